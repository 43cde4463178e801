//! Extractor unit contract
//!
//! A unit is one independent extractor of a metadata domain. The orchestrator
//! only sees its descriptor (id, dependencies, tags) and the `invoke` entry
//! point; whatever it parses is opaque.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Unique unit identifier (unique across built-in and plugin sources)
pub type UnitId = String;

/// Domain-specific output of one unit
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Where a unit came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum UnitOrigin {
    Builtin,
    Plugin(String),
}

impl UnitOrigin {
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            UnitOrigin::Builtin => None,
            UnitOrigin::Plugin(name) => Some(name),
        }
    }
}

impl std::fmt::Display for UnitOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitOrigin::Builtin => write!(f, "built-in"),
            UnitOrigin::Plugin(name) => write!(f, "plugin:{}", name),
        }
    }
}

impl From<UnitOrigin> for String {
    fn from(origin: UnitOrigin) -> Self {
        origin.to_string()
    }
}

impl TryFrom<String> for UnitOrigin {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "built-in" {
            return Ok(UnitOrigin::Builtin);
        }
        match s.strip_prefix("plugin:") {
            Some(name) if !name.is_empty() => Ok(UnitOrigin::Plugin(name.to_string())),
            _ => Err(format!("Invalid unit origin: {}", s)),
        }
    }
}

/// Coarse file type, decided upstream from the MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MimeCategory {
    Image,
    Audio,
    Video,
    Document,
    Archive,
    Text,
    Other,
}

impl MimeCategory {
    /// Classify a MIME type string (`image/png`, `application/pdf`, ...)
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.trim().to_ascii_lowercase();
        let (top, sub) = mime.split_once('/').unwrap_or((mime.as_str(), ""));

        match top {
            "image" => MimeCategory::Image,
            "audio" => MimeCategory::Audio,
            "video" => MimeCategory::Video,
            "text" => MimeCategory::Text,
            "application" => match sub {
                "pdf" | "msword" | "rtf" | "epub+zip" => MimeCategory::Document,
                s if s.starts_with("vnd.openxmlformats-officedocument")
                    || s.starts_with("vnd.oasis.opendocument")
                    || s.starts_with("vnd.ms-") =>
                {
                    MimeCategory::Document
                }
                "zip" | "gzip" | "x-tar" | "x-7z-compressed" | "x-rar-compressed"
                | "x-bzip2" | "x-xz" | "zstd" => MimeCategory::Archive,
                "json" | "xml" | "x-yaml" | "javascript" => MimeCategory::Text,
                _ => MimeCategory::Other,
            },
            _ => MimeCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MimeCategory::Image => "image",
            MimeCategory::Audio => "audio",
            MimeCategory::Video => "video",
            MimeCategory::Document => "document",
            MimeCategory::Archive => "archive",
            MimeCategory::Text => "text",
            MimeCategory::Other => "other",
        }
    }
}

impl std::fmt::Display for MimeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit descriptor (data only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDescriptor {
    pub id: UnitId,
    pub version: String,
    /// Other unit ids this unit needs outputs from
    #[serde(default)]
    pub dependency_ids: BTreeSet<UnitId>,
    /// Domain tags (e.g. "image", "forensic")
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    /// File categories this unit handles (`None` = all)
    #[serde(default)]
    pub applies_to: Option<BTreeSet<MimeCategory>>,
    pub origin: UnitOrigin,
}

impl UnitDescriptor {
    pub fn new(id: impl Into<UnitId>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            dependency_ids: BTreeSet::new(),
            capability_tags: BTreeSet::new(),
            applies_to: None,
            origin: UnitOrigin::Builtin,
        }
    }

    pub fn depends_on(mut self, id: impl Into<UnitId>) -> Self {
        self.dependency_ids.insert(id.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.capability_tags.insert(tag.into());
        self
    }

    pub fn applies_to(mut self, category: MimeCategory) -> Self {
        self.applies_to
            .get_or_insert_with(BTreeSet::new)
            .insert(category);
        self
    }

    pub fn with_origin(mut self, origin: UnitOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Whether this unit should run for a file of the given category
    pub fn is_applicable(&self, category: MimeCategory) -> bool {
        self.applies_to
            .as_ref()
            .map_or(true, |set| set.contains(&category))
    }

    /// Structural checks that do not need the rest of the catalog
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("unit id is empty".to_string());
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(format!("unit id '{}' contains whitespace", self.id));
        }
        if self.version.trim().is_empty() {
            return Err(format!("unit '{}' has an empty version", self.id));
        }
        if let Some(dep) = self.dependency_ids.iter().find(|d| d.trim().is_empty()) {
            return Err(format!(
                "unit '{}' declares an empty dependency id '{}'",
                self.id, dep
            ));
        }
        if let Some(set) = &self.applies_to {
            if set.is_empty() {
                return Err(format!("unit '{}' applies to no file category", self.id));
            }
        }
        Ok(())
    }
}

/// Immutable description of the file being extracted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContext {
    pub path: PathBuf,
    pub mime_type: String,
    pub category: MimeCategory,
    pub size_bytes: u64,
}

impl FileContext {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>, size_bytes: u64) -> Self {
        let mime_type = mime_type.into();
        Self {
            path: path.into(),
            category: MimeCategory::from_mime(&mime_type),
            mime_type,
            size_bytes,
        }
    }

    /// Build a context for an already stored file, reading its size from disk
    pub async fn inspect(path: &Path, mime_type: &str) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Not a regular file: {}", path.display()),
            ));
        }
        Ok(Self::new(path, mime_type, metadata.len()))
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }
}

/// Read-only view of the successful outputs of a unit's declared dependencies
#[derive(Debug, Clone, Default)]
pub struct DependencyOutputs {
    outputs: BTreeMap<UnitId, Arc<Payload>>,
}

impl DependencyOutputs {
    pub fn new(outputs: BTreeMap<UnitId, Arc<Payload>>) -> Self {
        Self { outputs }
    }

    pub fn get(&self, unit_id: &str) -> Option<&Payload> {
        self.outputs.get(unit_id).map(|p| p.as_ref())
    }

    /// Field lookup in one dependency's payload
    pub fn field(&self, unit_id: &str, field: &str) -> Option<&serde_json::Value> {
        self.get(unit_id).and_then(|payload| payload.get(field))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UnitId, &Payload)> {
        self.outputs.iter().map(|(id, p)| (id, p.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// Error raised from inside a unit
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("missing dependency output: {0}")]
    MissingInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UnitError {
    /// Short machine-readable kind for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            UnitError::Unsupported(_) => "unsupported",
            UnitError::Malformed(_) => "malformed",
            UnitError::MissingInput(_) => "missing_input",
            UnitError::Io(_) => "io",
            UnitError::Other(_) => "other",
        }
    }
}

/// Extractor unit (one per metadata domain)
#[async_trait]
pub trait Unit: Send + Sync {
    /// Identity, dependencies and tags
    fn descriptor(&self) -> &UnitDescriptor;

    /// Extract this unit's domain from the file
    async fn invoke(
        &self,
        ctx: &FileContext,
        deps: &DependencyOutputs,
    ) -> Result<Payload, UnitError>;
}
