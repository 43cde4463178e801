//! Content signatures (magic bytes) and the extension cross-check built on them

use crate::unit::{DependencyOutputs, FileContext, MimeCategory, Payload, Unit, UnitDescriptor, UnitError};
use crate::units::file::FileBasicUnit;
use crate::units::read_head;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One entry of a signature table, as written in plugin descriptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Signature {
    pub format: String,
    /// Hex-encoded leading bytes (`89504E47`)
    pub magic: String,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl Signature {
    fn new(format: &str, magic: &str, offset: usize, mime: &str, extensions: &[&str]) -> Self {
        Self {
            format: format.to_string(),
            magic: magic.to_string(),
            offset,
            mime: Some(mime.to_string()),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Furthest byte a signature may inspect (offset + magic length)
pub const MAX_SIGNATURE_END: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct CompiledSignature {
    signature: Signature,
    bytes: Vec<u8>,
}

impl CompiledSignature {
    fn compile(signature: Signature) -> Result<Self, String> {
        let bytes = decode_hex(&signature.magic)
            .map_err(|e| format!("signature '{}': {}", signature.format, e))?;
        if bytes.is_empty() {
            return Err(format!("signature '{}': empty magic", signature.format));
        }
        match signature.offset.checked_add(bytes.len()) {
            Some(end) if end <= MAX_SIGNATURE_END => {}
            _ => {
                return Err(format!(
                    "signature '{}': offset {} + {} magic bytes exceeds {} bytes",
                    signature.format,
                    signature.offset,
                    bytes.len(),
                    MAX_SIGNATURE_END
                ))
            }
        }
        Ok(Self { signature, bytes })
    }

    fn end(&self) -> usize {
        self.signature.offset + self.bytes.len()
    }

    fn matches(&self, head: &[u8]) -> bool {
        head.get(self.signature.offset..self.end()) == Some(self.bytes.as_slice())
    }
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = hex.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{}'", hex));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let s: String = pair.iter().collect();
            u8::from_str_radix(&s, 16).map_err(|_| format!("invalid hex byte '{}'", s))
        })
        .collect()
}

fn builtin_table() -> Vec<Signature> {
    vec![
        Signature::new("png", "89504E470D0A1A0A", 0, "image/png", &["png"]),
        Signature::new("jpeg", "FFD8FF", 0, "image/jpeg", &["jpg", "jpeg"]),
        Signature::new("gif", "47494638", 0, "image/gif", &["gif"]),
        Signature::new("tiff", "49492A00", 0, "image/tiff", &["tif", "tiff", "dng"]),
        Signature::new("tiff", "4D4D002A", 0, "image/tiff", &["tif", "tiff"]),
        Signature::new("webp", "57454250", 8, "image/webp", &["webp"]),
        Signature::new("wav", "57415645", 8, "audio/wav", &["wav"]),
        Signature::new("flac", "664C6143", 0, "audio/flac", &["flac"]),
        Signature::new("ogg", "4F676753", 0, "audio/ogg", &["ogg", "oga", "opus"]),
        Signature::new("mp3", "494433", 0, "audio/mpeg", &["mp3"]),
        Signature::new("mp4", "66747970", 4, "video/mp4", &["mp4", "m4a", "m4v", "mov", "heic"]),
        Signature::new("pdf", "255044462D", 0, "application/pdf", &["pdf"]),
        Signature::new("zip", "504B0304", 0, "application/zip", &["zip", "docx", "xlsx", "pptx", "odt", "epub", "jar"]),
        Signature::new("gzip", "1F8B", 0, "application/gzip", &["gz", "tgz"]),
        Signature::new("7z", "377ABCAF271C", 0, "application/x-7z-compressed", &["7z"]),
        Signature::new("rar", "526172211A07", 0, "application/x-rar-compressed", &["rar"]),
        Signature::new("elf", "7F454C46", 0, "application/x-executable", &["", "so", "o"]),
    ]
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SignatureParams {
    signatures: Vec<Signature>,
}

/// Detects the content format from leading bytes
///
/// The first matching entry wins; a file no entry matches yields
/// `{"matched": false}` rather than an error.
pub struct SignatureUnit {
    descriptor: UnitDescriptor,
    table: Vec<CompiledSignature>,
    head_len: usize,
}

impl SignatureUnit {
    pub const ID: &'static str = "file.signature";

    pub fn new(descriptor: UnitDescriptor, signatures: Vec<Signature>) -> Result<Self, String> {
        let table = signatures
            .into_iter()
            .map(CompiledSignature::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let head_len = table.iter().map(CompiledSignature::end).max().unwrap_or(0);
        Ok(Self {
            descriptor,
            table,
            head_len,
        })
    }

    /// The crate's own table of common formats
    pub fn builtin() -> Self {
        let descriptor = UnitDescriptor::new(Self::ID, "1.0.0").tag("file");
        let table: Vec<CompiledSignature> = builtin_table()
            .into_iter()
            .filter_map(|s| CompiledSignature::compile(s).ok())
            .collect();
        let head_len = table.iter().map(CompiledSignature::end).max().unwrap_or(0);
        Self {
            descriptor,
            table,
            head_len,
        }
    }

    /// `signature` factory kind: `params.signatures` is a non-empty table
    pub fn from_params(descriptor: UnitDescriptor, params: &Value) -> Result<Self, String> {
        let params: SignatureParams = serde_json::from_value(params.clone())
            .map_err(|e| format!("invalid params for 'signature': {}", e))?;
        if params.signatures.is_empty() {
            return Err("params.signatures must not be empty".to_string());
        }
        Self::new(descriptor, params.signatures)
    }

    pub fn detect(&self, head: &[u8]) -> Option<&Signature> {
        self.table
            .iter()
            .find(|entry| entry.matches(head))
            .map(|entry| &entry.signature)
    }
}

#[async_trait]
impl Unit for SignatureUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &FileContext, _deps: &DependencyOutputs) -> Result<Payload, UnitError> {
        let head = read_head(&ctx.path, self.head_len).await?;

        let mut payload = Payload::new();
        match self.detect(&head) {
            Some(signature) => {
                payload.insert("matched".into(), json!(true));
                payload.insert("format".into(), json!(signature.format));
                payload.insert("mime".into(), json!(signature.mime));
                payload.insert("extensions".into(), json!(signature.extensions));
            }
            None => {
                payload.insert("matched".into(), json!(false));
            }
        }
        Ok(payload)
    }
}

/// Flags files whose extension disagrees with their detected content
pub struct ExtensionMismatchUnit {
    descriptor: UnitDescriptor,
}

impl ExtensionMismatchUnit {
    pub const ID: &'static str = "forensic.extension_mismatch";

    pub fn new() -> Self {
        Self {
            descriptor: UnitDescriptor::new(Self::ID, "1.0.0")
                .depends_on(FileBasicUnit::ID)
                .depends_on(SignatureUnit::ID)
                .tag("forensic"),
        }
    }

    fn declared_mime_matches(ctx: &FileContext, detected_mime: Option<&str>) -> Option<bool> {
        let detected = detected_mime?;
        if ctx.category == MimeCategory::Other {
            return None;
        }
        Some(MimeCategory::from_mime(detected) == ctx.category)
    }
}

impl Default for ExtensionMismatchUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Unit for ExtensionMismatchUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &FileContext, deps: &DependencyOutputs) -> Result<Payload, UnitError> {
        let basic = deps
            .get(FileBasicUnit::ID)
            .ok_or_else(|| UnitError::MissingInput(FileBasicUnit::ID.to_string()))?;
        let signature = deps
            .get(SignatureUnit::ID)
            .ok_or_else(|| UnitError::MissingInput(SignatureUnit::ID.to_string()))?;

        let extension = basic.get("extension").and_then(Value::as_str);
        let matched = signature.get("matched").and_then(Value::as_bool).unwrap_or(false);

        let mut payload = Payload::new();
        payload.insert("checked".into(), json!(matched));
        if !matched {
            return Ok(payload);
        }

        let expected: Vec<&str> = signature
            .get("extensions")
            .and_then(Value::as_array)
            .map(|exts| exts.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let extension_mismatch = !expected.contains(&extension.unwrap_or(""));
        let detected_mime = signature.get("mime").and_then(Value::as_str);

        payload.insert("extension".into(), json!(extension));
        payload.insert("detected_format".into(), signature.get("format").cloned().unwrap_or(Value::Null));
        payload.insert("extension_mismatch".into(), json!(extension_mismatch));
        payload.insert(
            "declared_mime_matches".into(),
            json!(Self::declared_mime_matches(ctx, detected_mime)),
        );
        Ok(payload)
    }
}
