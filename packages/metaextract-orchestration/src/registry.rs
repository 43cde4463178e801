//! Unit discovery
//!
//! Discovery enumerates a known list of registration sources (the built-in
//! list plus plugin directories). Each source yields one outcome per
//! candidate unit; a bad unit becomes a [`DiscoveryDiagnostic`] and never
//! aborts the pass. Only an unreadable source root is fatal.

use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::unit::{MimeCategory, Unit, UnitDescriptor, UnitId, UnitOrigin};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A unit that loaded successfully: descriptor + callable
#[derive(Clone)]
pub struct RegisteredUnit {
    pub descriptor: Arc<UnitDescriptor>,
    pub unit: Arc<dyn Unit>,
}

impl RegisteredUnit {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for RegisteredUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredUnit")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Why a candidate unit was left out of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryIssue {
    /// Descriptor file could not be parsed
    MalformedDescriptor,
    /// Descriptor parsed but failed structural validation
    InvalidDescriptor,
    /// Descriptor names a factory kind nobody registered
    UnknownKind,
    /// Factory rejected the descriptor parameters
    InvalidParams,
    /// Another source already registered this id
    DuplicateId,
}

/// Load-time failure attached to one unit id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDiagnostic {
    pub unit_id: UnitId,
    pub origin: UnitOrigin,
    pub issue: DiscoveryIssue,
    pub message: String,
    pub category: ErrorCategory,
}

impl DiscoveryDiagnostic {
    pub fn new(
        unit_id: impl Into<UnitId>,
        origin: UnitOrigin,
        issue: DiscoveryIssue,
        message: impl Into<String>,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            origin,
            issue,
            message: message.into(),
            category: ErrorCategory::Discovery,
        }
    }
}

pub type LoadOutcome = std::result::Result<RegisteredUnit, DiscoveryDiagnostic>;

/// Everything one source produced in one discovery pass
#[derive(Debug, Clone)]
pub struct SourceContribution {
    pub origin: UnitOrigin,
    pub units: Vec<RegisteredUnit>,
    pub diagnostics: Vec<DiscoveryDiagnostic>,
}

impl SourceContribution {
    pub fn from_outcomes(origin: UnitOrigin, outcomes: Vec<LoadOutcome>) -> Self {
        let mut units = Vec::new();
        let mut diagnostics = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(unit) => units.push(unit),
                Err(diag) => diagnostics.push(diag),
            }
        }
        Self {
            origin,
            units,
            diagnostics,
        }
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.iter().map(|u| u.descriptor.id.clone()).collect()
    }
}

/// A registration source (built-in list, plugin directory, ...)
pub trait UnitSource: Send + Sync {
    fn origin(&self) -> UnitOrigin;

    /// Load every candidate unit. `Err` only for source-level failures.
    fn load(&self, factories: &UnitFactoryRegistry) -> Result<Vec<LoadOutcome>>;
}

/// Validate a unit's own descriptor and stamp it with its source origin
fn register(unit: Arc<dyn Unit>, origin: &UnitOrigin) -> LoadOutcome {
    let descriptor = unit.descriptor().clone().with_origin(origin.clone());
    if let Err(reason) = descriptor.validate() {
        return Err(DiscoveryDiagnostic::new(
            descriptor.id.clone(),
            origin.clone(),
            DiscoveryIssue::InvalidDescriptor,
            reason,
        ));
    }
    Ok(RegisteredUnit {
        descriptor: Arc::new(descriptor),
        unit,
    })
}

/// Units compiled into the binary
#[derive(Clone, Default)]
pub struct BuiltinSource {
    units: Vec<Arc<dyn Unit>>,
}

impl BuiltinSource {
    pub fn new(units: Vec<Arc<dyn Unit>>) -> Self {
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl UnitSource for BuiltinSource {
    fn origin(&self) -> UnitOrigin {
        UnitOrigin::Builtin
    }

    fn load(&self, _factories: &UnitFactoryRegistry) -> Result<Vec<LoadOutcome>> {
        let origin = self.origin();
        Ok(self
            .units
            .iter()
            .map(|unit| register(unit.clone(), &origin))
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Factory kinds (plugin descriptors name a kind instead of shipping code)
// ═══════════════════════════════════════════════════════════════════════════

pub type UnitFactory = Arc<
    dyn Fn(UnitDescriptor, &serde_json::Value) -> std::result::Result<Arc<dyn Unit>, String>
        + Send
        + Sync,
>;

/// Maps a descriptor `kind` to the constructor of its callable
#[derive(Clone, Default)]
pub struct UnitFactoryRegistry {
    factories: BTreeMap<String, UnitFactory>,
}

impl UnitFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the crate's built-in kinds
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        crate::units::register_factories(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(UnitDescriptor, &serde_json::Value) -> std::result::Result<Arc<dyn Unit>, String>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn get(&self, kind: &str) -> Option<&UnitFactory> {
        self.factories.get(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// One unit descriptor file inside a plugin's `units/` directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnitSpec {
    pub id: UnitId,
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub depends_on: Vec<UnitId>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub applies_to: Option<Vec<MimeCategory>>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl UnitSpec {
    pub fn descriptor(&self, origin: UnitOrigin) -> UnitDescriptor {
        UnitDescriptor {
            id: self.id.clone(),
            version: self.version.clone(),
            dependency_ids: self.depends_on.iter().cloned().collect(),
            capability_tags: self.tags.iter().cloned().collect(),
            applies_to: self
                .applies_to
                .as_ref()
                .map(|cats| cats.iter().copied().collect()),
            origin,
        }
    }
}

/// Plugin directory: `<root>/units/*.yaml`, one descriptor per file
#[derive(Debug, Clone)]
pub struct PluginDirSource {
    name: String,
    root: PathBuf,
}

impl PluginDirSource {
    pub const UNITS_DIR: &'static str = "units";

    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Descriptor files, sorted for deterministic load order
    fn descriptor_files(&self) -> Result<Vec<PathBuf>> {
        let units_dir = self.root.join(Self::UNITS_DIR);
        let entries = std::fs::read_dir(&units_dir)
            .map_err(|e| OrchestratorError::unreadable_root(&units_dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| OrchestratorError::unreadable_root(&units_dir, e))?
                .path();
            let is_yaml = path
                .extension()
                .map_or(false, |ext| ext == "yaml" || ext == "yml");
            if path.is_file() && is_yaml {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn load_file(&self, path: &Path, factories: &UnitFactoryRegistry) -> LoadOutcome {
        let origin = self.origin();
        let fallback_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let content = std::fs::read_to_string(path).map_err(|e| {
            DiscoveryDiagnostic::new(
                fallback_id.clone(),
                origin.clone(),
                DiscoveryIssue::MalformedDescriptor,
                format!("{}: {}", path.display(), e),
            )
        })?;

        let spec: UnitSpec = serde_yaml::from_str(&content).map_err(|e| {
            DiscoveryDiagnostic::new(
                fallback_id.clone(),
                origin.clone(),
                DiscoveryIssue::MalformedDescriptor,
                format!("{}: {}", path.display(), e),
            )
        })?;

        let descriptor = spec.descriptor(origin.clone());
        if let Err(reason) = descriptor.validate() {
            return Err(DiscoveryDiagnostic::new(
                spec.id,
                origin,
                DiscoveryIssue::InvalidDescriptor,
                reason,
            ));
        }

        let factory = factories.get(&spec.kind).ok_or_else(|| {
            DiscoveryDiagnostic::new(
                spec.id.clone(),
                origin.clone(),
                DiscoveryIssue::UnknownKind,
                format!(
                    "unknown unit kind '{}' (known: {})",
                    spec.kind,
                    factories.kinds().join(", ")
                ),
            )
        })?;

        let unit = factory(descriptor.clone(), &spec.params).map_err(|reason| {
            DiscoveryDiagnostic::new(
                spec.id.clone(),
                origin.clone(),
                DiscoveryIssue::InvalidParams,
                reason,
            )
        })?;

        Ok(RegisteredUnit {
            descriptor: Arc::new(descriptor),
            unit,
        })
    }
}

impl UnitSource for PluginDirSource {
    fn origin(&self) -> UnitOrigin {
        UnitOrigin::Plugin(self.name.clone())
    }

    fn load(&self, factories: &UnitFactoryRegistry) -> Result<Vec<LoadOutcome>> {
        let files = self.descriptor_files()?;
        debug!(
            "Plugin {}: {} descriptor files under {}",
            self.name,
            files.len(),
            self.root.display()
        );
        Ok(files
            .iter()
            .map(|path| self.load_file(path, factories))
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Catalog
// ═══════════════════════════════════════════════════════════════════════════

/// Successfully discovered, runnable units. Immutable once published.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    units: BTreeMap<UnitId, RegisteredUnit>,
    diagnostics: Vec<DiscoveryDiagnostic>,
    generation: u64,
}

impl Catalog {
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    /// Merge source contributions in order; the first registration of an id wins
    pub fn assemble(contributions: &[SourceContribution], generation: u64) -> Self {
        let mut units: BTreeMap<UnitId, RegisteredUnit> = BTreeMap::new();
        let mut diagnostics = Vec::new();

        for contribution in contributions {
            diagnostics.extend(contribution.diagnostics.iter().cloned());

            for unit in &contribution.units {
                let id = unit.descriptor.id.clone();
                if let Some(existing) = units.get(&id) {
                    diagnostics.push(DiscoveryDiagnostic::new(
                        id.clone(),
                        unit.descriptor.origin.clone(),
                        DiscoveryIssue::DuplicateId,
                        format!(
                            "id already registered by {}; {} copy ignored",
                            existing.descriptor.origin, unit.descriptor.origin
                        ),
                    ));
                    continue;
                }
                units.insert(id, unit.clone());
            }
        }

        for diag in &diagnostics {
            warn!(
                "Discovery: unit '{}' ({}) excluded - {:?}: {}",
                diag.unit_id, diag.origin, diag.issue, diag.message
            );
        }

        Self {
            units,
            diagnostics,
            generation,
        }
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredUnit> {
        self.units.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.units.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = &UnitId> {
        self.units.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UnitId, &RegisteredUnit)> {
        self.units.iter()
    }

    pub fn diagnostics(&self) -> &[DiscoveryDiagnostic] {
        &self.diagnostics
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Runs discovery over a fixed list of sources
pub struct Registry {
    factories: UnitFactoryRegistry,
}

impl Registry {
    pub fn new(factories: UnitFactoryRegistry) -> Self {
        Self { factories }
    }

    pub fn factories(&self) -> &UnitFactoryRegistry {
        &self.factories
    }

    /// Load one source into a contribution
    pub fn load_source(&self, source: &dyn UnitSource) -> Result<SourceContribution> {
        let outcomes = source.load(&self.factories)?;
        let contribution = SourceContribution::from_outcomes(source.origin(), outcomes);
        info!(
            "Discovered {} units from {} ({} failed to load)",
            contribution.units.len(),
            contribution.origin,
            contribution.diagnostics.len()
        );
        Ok(contribution)
    }

    /// Discover every source in order and publish a fresh catalog
    pub fn discover(&self, sources: &[&dyn UnitSource], generation: u64) -> Result<Catalog> {
        let contributions = sources
            .iter()
            .map(|source| self.load_source(*source))
            .collect::<Result<Vec<_>>>()?;
        Ok(Catalog::assemble(&contributions, generation))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(UnitFactoryRegistry::with_builtin_kinds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{DependencyOutputs, FileContext, Payload, UnitError};
    use async_trait::async_trait;

    struct FixedUnit {
        desc: UnitDescriptor,
    }

    #[async_trait]
    impl Unit for FixedUnit {
        fn descriptor(&self) -> &UnitDescriptor {
            &self.desc
        }

        async fn invoke(
            &self,
            _ctx: &FileContext,
            _deps: &DependencyOutputs,
        ) -> std::result::Result<Payload, UnitError> {
            Ok(Payload::new())
        }
    }

    fn fixed(id: &str) -> Arc<dyn Unit> {
        Arc::new(FixedUnit {
            desc: UnitDescriptor::new(id, "1.0"),
        })
    }

    fn write_unit(root: &Path, file: &str, content: &str) {
        let dir = root.join(PluginDirSource::UNITS_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), content).unwrap();
    }

    #[test]
    fn test_builtin_source_stamps_origin() {
        let source = BuiltinSource::new(vec![fixed("a"), fixed("b")]);
        let registry = Registry::new(UnitFactoryRegistry::new());
        let catalog = registry.discover(&[&source], 1).unwrap();

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.generation(), 1);
        assert_eq!(catalog.get("a").unwrap().descriptor.origin, UnitOrigin::Builtin);
        assert!(catalog.diagnostics().is_empty());
    }

    #[test]
    fn test_invalid_builtin_descriptor_is_isolated() {
        let source = BuiltinSource::new(vec![fixed("good"), fixed("bad id")]);
        let registry = Registry::new(UnitFactoryRegistry::new());
        let catalog = registry.discover(&[&source], 1).unwrap();

        assert_eq!(catalog.ids().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(catalog.diagnostics().len(), 1);
        assert_eq!(
            catalog.diagnostics()[0].issue,
            DiscoveryIssue::InvalidDescriptor
        );
    }

    #[test]
    fn test_duplicate_id_first_loaded_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(
            dir.path(),
            "dup.yaml",
            "id: a\nversion: '2.0'\nkind: static\nparams:\n  fields:\n    x: 1\n",
        );

        let builtin = BuiltinSource::new(vec![fixed("a")]);
        let plugin = PluginDirSource::new("extra", dir.path());
        let registry = Registry::default();
        let catalog = registry.discover(&[&builtin, &plugin], 1).unwrap();

        assert_eq!(catalog.len(), 1);
        let kept = catalog.get("a").unwrap();
        assert_eq!(kept.descriptor.origin, UnitOrigin::Builtin);
        assert_eq!(kept.descriptor.version, "1.0");

        let diag = &catalog.diagnostics()[0];
        assert_eq!(diag.issue, DiscoveryIssue::DuplicateId);
        assert_eq!(diag.origin, UnitOrigin::Plugin("extra".to_string()));
    }

    #[test]
    fn test_plugin_dir_isolates_bad_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(
            dir.path(),
            "01-good.yaml",
            "id: p.good\nversion: '1'\nkind: static\ntags: [demo]\nparams:\n  fields:\n    a: 1\n",
        );
        write_unit(dir.path(), "02-broken.yaml", "id: [unterminated\n");
        write_unit(
            dir.path(),
            "03-unknown.yml",
            "id: p.unknown\nversion: '1'\nkind: teleport\n",
        );
        write_unit(
            dir.path(),
            "04-params.yaml",
            "id: p.params\nversion: '1'\nkind: static\nparams: 42\n",
        );
        write_unit(dir.path(), "README.txt", "not a descriptor");

        let source = PluginDirSource::new("demo", dir.path());
        let registry = Registry::default();
        let contribution = registry.load_source(&source).unwrap();

        assert_eq!(contribution.unit_ids(), vec!["p.good".to_string()]);
        let issues: Vec<_> = contribution
            .diagnostics
            .iter()
            .map(|d| (d.unit_id.as_str(), d.issue))
            .collect();
        assert_eq!(
            issues,
            vec![
                ("02-broken", DiscoveryIssue::MalformedDescriptor),
                ("p.unknown", DiscoveryIssue::UnknownKind),
                ("p.params", DiscoveryIssue::InvalidParams),
            ]
        );
    }

    #[test]
    fn test_out_of_range_signature_offset_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(
            dir.path(),
            "01-good.yaml",
            "id: p.good\nversion: '1'\nkind: static\nparams:\n  fields:\n    a: 1\n",
        );
        write_unit(
            dir.path(),
            "02-overflow.yaml",
            "id: p.overflow\nversion: '1'\nkind: signature\nparams:\n  signatures:\n    - format: far\n      magic: 'AA'\n      offset: 18446744073709551615\n",
        );
        write_unit(
            dir.path(),
            "03-huge.yaml",
            "id: p.huge\nversion: '1'\nkind: signature\nparams:\n  signatures:\n    - format: far\n      magic: 'AA'\n      offset: 1000000000000000\n",
        );

        let source = PluginDirSource::new("demo", dir.path());
        let contribution = Registry::default().load_source(&source).unwrap();

        assert_eq!(contribution.unit_ids(), vec!["p.good".to_string()]);
        let issues: Vec<_> = contribution
            .diagnostics
            .iter()
            .map(|d| (d.unit_id.as_str(), d.issue))
            .collect();
        assert_eq!(
            issues,
            vec![
                ("p.overflow", DiscoveryIssue::InvalidParams),
                ("p.huge", DiscoveryIssue::InvalidParams),
            ]
        );
    }

    #[test]
    fn test_unreadable_plugin_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let source = PluginDirSource::new("ghost", dir.path().join("nope"));
        let registry = Registry::default();

        let err = registry.discover(&[&source], 1).unwrap_err();
        assert!(matches!(err, OrchestratorError::UnreadableRoot { .. }));
    }

    #[test]
    fn test_unit_spec_descriptor_conversion() {
        let spec: UnitSpec = serde_yaml::from_str(
            "id: audio.tags\nversion: '1.2'\nkind: static\ndepends_on: [file.basic]\ntags: [audio]\napplies_to: [audio]\n",
        )
        .unwrap();
        let desc = spec.descriptor(UnitOrigin::Plugin("media".to_string()));

        assert!(desc.dependency_ids.contains("file.basic"));
        assert!(desc.capability_tags.contains("audio"));
        assert!(desc.is_applicable(MimeCategory::Audio));
        assert!(!desc.is_applicable(MimeCategory::Image));
        assert_eq!(desc.origin.plugin_name(), Some("media"));
    }

    #[test]
    fn test_unit_spec_rejects_unknown_fields() {
        let result: std::result::Result<UnitSpec, _> =
            serde_yaml::from_str("id: a\nversion: '1'\nkind: static\nbogus: true\n");
        assert!(result.is_err());
    }
}
