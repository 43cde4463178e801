// Built-in extractor units and plugin factory kinds
pub mod file;
pub mod generic;
pub mod signature;

// Re-exports
pub use file::{FileBasicUnit, FileHashUnit};
pub use generic::{ProjectionUnit, StaticUnit};
pub use signature::{ExtensionMismatchUnit, Signature, SignatureUnit};

use crate::registry::{BuiltinSource, UnitFactoryRegistry};
use crate::unit::Unit;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Every unit compiled into the crate
pub fn builtin_units() -> Vec<Arc<dyn Unit>> {
    vec![
        Arc::new(FileBasicUnit::new()),
        Arc::new(FileHashUnit::new()),
        Arc::new(SignatureUnit::builtin()),
        Arc::new(ExtensionMismatchUnit::new()),
    ]
}

pub fn builtin_source() -> BuiltinSource {
    BuiltinSource::new(builtin_units())
}

/// Register the kinds plugin descriptors may name
pub fn register_factories(registry: &mut UnitFactoryRegistry) {
    registry.register("static", |desc, params| {
        StaticUnit::from_params(desc, params).map(|u| Arc::new(u) as Arc<dyn Unit>)
    });
    registry.register("projection", |desc, params| {
        ProjectionUnit::from_params(desc, params).map(|u| Arc::new(u) as Arc<dyn Unit>)
    });
    registry.register("signature", |desc, params| {
        SignatureUnit::from_params(desc, params).map(|u| Arc::new(u) as Arc<dyn Unit>)
    });
}

/// Leading bytes of a file (shorter when the file is)
pub(crate) async fn read_head(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::new();
    file.take(len as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}
