use crate::unit::{DependencyOutputs, FileContext, Payload, Unit, UnitDescriptor, UnitError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const HASH_CHUNK: usize = 64 * 1024;

/// Filesystem facts: size, name, extension, MIME, modification time
pub struct FileBasicUnit {
    descriptor: UnitDescriptor,
}

impl FileBasicUnit {
    pub const ID: &'static str = "file.basic";

    pub fn new() -> Self {
        Self {
            descriptor: UnitDescriptor::new(Self::ID, "1.0.0").tag("file"),
        }
    }
}

impl Default for FileBasicUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Unit for FileBasicUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &FileContext, _deps: &DependencyOutputs) -> Result<Payload, UnitError> {
        let metadata = tokio::fs::metadata(&ctx.path).await?;

        let modified = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
        let file_name = ctx
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        let mut payload = Payload::new();
        payload.insert("file_name".into(), json!(file_name));
        payload.insert("size_bytes".into(), json!(metadata.len()));
        payload.insert("extension".into(), json!(ctx.extension()));
        payload.insert("mime_type".into(), json!(ctx.mime_type));
        payload.insert("category".into(), json!(ctx.category.as_str()));
        payload.insert("modified".into(), modified.map(Value::String).unwrap_or(Value::Null));
        Ok(payload)
    }
}

/// SHA-256 of the whole file
pub struct FileHashUnit {
    descriptor: UnitDescriptor,
}

impl FileHashUnit {
    pub const ID: &'static str = "file.hash";

    pub fn new() -> Self {
        Self {
            descriptor: UnitDescriptor::new(Self::ID, "1.0.0").tag("integrity"),
        }
    }
}

impl Default for FileHashUnit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Unit for FileHashUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, ctx: &FileContext, _deps: &DependencyOutputs) -> Result<Payload, UnitError> {
        let mut file = tokio::fs::File::open(&ctx.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        let mut total: u64 = 0;

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }

        let mut payload = Payload::new();
        payload.insert("sha256".into(), json!(format!("{:x}", hasher.finalize())));
        payload.insert("bytes_hashed".into(), json!(total));
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &tempfile::TempDir, name: &str, content: &[u8], mime: &str) -> FileContext {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        FileContext::new(path, mime, content.len() as u64)
    }

    #[tokio::test]
    async fn test_file_basic() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "Photo.JPG", b"\xFF\xD8\xFFdata", "image/jpeg");

        let payload = FileBasicUnit::new()
            .invoke(&ctx, &DependencyOutputs::default())
            .await
            .unwrap();

        assert_eq!(payload["file_name"], "Photo.JPG");
        assert_eq!(payload["size_bytes"], 7);
        assert_eq!(payload["extension"], "jpg");
        assert_eq!(payload["category"], "image");
        assert!(payload["modified"].is_string());
    }

    #[tokio::test]
    async fn test_file_basic_missing_file() {
        let ctx = FileContext::new("/nonexistent/metaextract/file.bin", "application/octet-stream", 0);
        let err = FileBasicUnit::new()
            .invoke(&ctx, &DependencyOutputs::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[tokio::test]
    async fn test_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "a.txt", b"abc", "text/plain");

        let payload = FileHashUnit::new()
            .invoke(&ctx, &DependencyOutputs::default())
            .await
            .unwrap();

        assert_eq!(
            payload["sha256"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(payload["bytes_hashed"], 3);
    }
}
