//! Common test utilities for metaextract-orchestration
//!
//! Scripted units with call counters, catalog builders and on-disk fixtures
//! (input files, plugin roots).

#![allow(dead_code)]

use async_trait::async_trait;
use metaextract_orchestration::{
    BuiltinSource, Catalog, DependencyOutputs, FileContext, Payload, Registry, Unit,
    UnitDescriptor, UnitError, UnitSource,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a scripted unit does when invoked
#[derive(Clone, Debug)]
pub enum Script {
    /// Emit `n` scalar fields
    Fields(usize),
    /// Return a unit error
    Fail,
    /// Panic inside `invoke`
    Panic,
    /// Sleep, then emit one field
    Sleep(Duration),
}

pub struct ScriptedUnit {
    desc: UnitDescriptor,
    script: Script,
    calls: Arc<AtomicUsize>,
}

impl ScriptedUnit {
    pub fn new(desc: UnitDescriptor, script: Script) -> Self {
        Self {
            desc,
            script,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared invocation counter
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Unit for ScriptedUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.desc
    }

    async fn invoke(&self, _ctx: &FileContext, _deps: &DependencyOutputs) -> Result<Payload, UnitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Fields(n) => Ok(fields(*n)),
            Script::Fail => Err(UnitError::Malformed("scripted failure".to_string())),
            Script::Panic => panic!("scripted panic"),
            Script::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(fields(1))
            }
        }
    }
}

/// Payload with `n` scalar fields `f0..f{n-1}`
pub fn fields(n: usize) -> Payload {
    (0..n).map(|i| (format!("f{i}"), json!(i))).collect()
}

/// Descriptor shorthand: id plus dependencies
pub fn desc(id: &str, deps: &[&str]) -> UnitDescriptor {
    deps.iter()
        .fold(UnitDescriptor::new(id, "1.0"), |d, dep| d.depends_on(*dep))
}

pub fn source(units: Vec<ScriptedUnit>) -> BuiltinSource {
    BuiltinSource::new(
        units
            .into_iter()
            .map(|u| Arc::new(u) as Arc<dyn Unit>)
            .collect(),
    )
}

pub fn catalog(units: Vec<ScriptedUnit>) -> Catalog {
    let source = source(units);
    let sources: [&dyn UnitSource; 1] = [&source];
    Registry::default()
        .discover(&sources, 1)
        .expect("builtin discovery cannot fail")
}

/// Small file on disk plus its context
pub fn file_context(dir: &Path) -> FileContext {
    let path = dir.join("input.bin");
    std::fs::write(&path, b"metaextract test input").unwrap();
    FileContext::new(path, "application/octet-stream", 22)
}

/// Plugin root with one `static` unit per `(id, depends_on)` entry;
/// `depends_on` is a comma-separated id list
pub fn write_plugin(root: &Path, units: &[(&str, &str)]) -> PathBuf {
    let dir = root.join("units");
    std::fs::create_dir_all(&dir).unwrap();
    for (id, deps) in units {
        let yaml = format!(
            "id: {id}\nversion: \"1.0\"\nkind: static\ndepends_on: [{deps}]\ntags: [plugin]\nparams:\n  fields:\n    source: {id}\n"
        );
        std::fs::write(dir.join(format!("{id}.yaml")), yaml).unwrap();
    }
    root.to_path_buf()
}
