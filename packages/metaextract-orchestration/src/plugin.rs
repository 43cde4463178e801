//! Plugin manager
//!
//! Owns the single piece of shared mutable state in the engine: the handle to
//! the current [`Catalog`]. Every change (load, unload, reload, toggle) builds
//! a brand-new catalog from the stored source contributions and swaps the
//! handle. Runs hold the `Arc<Catalog>` they started with, so a swap never
//! reaches a run already in flight.
//!
//! Plugins contribute nothing until the process-wide toggle is switched on.

use crate::registry::{Catalog, PluginDirSource, Registry, SourceContribution, UnitSource};
use crate::unit::UnitId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("Invalid plugin manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Invalid plugin root {path}: {reason}")]
    InvalidRoot { path: String, reason: String },

    #[error("Reload of plugin '{name}' failed, previous units kept: {reason}")]
    ReloadFailed { name: String, reason: String },
}

/// Optional `plugin.yaml` at the plugin root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl PluginManifest {
    pub const FILE_NAME: &'static str = "plugin.yaml";

    /// Read the manifest of a plugin root; `None` when the root has none
    pub fn read(root: &Path) -> Result<Option<Self>, PluginError> {
        let path = root.join(Self::FILE_NAME);
        if !path.is_file() {
            return Ok(None);
        }
        let invalid = |reason: String| PluginError::InvalidManifest {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(&path).map_err(|e| invalid(e.to_string()))?;
        let manifest: Self = serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        if manifest.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        Ok(Some(manifest))
    }
}

/// A loaded plugin and its current contribution
#[derive(Debug, Clone)]
pub struct PluginSet {
    pub name: String,
    pub root: PathBuf,
    pub manifest: Option<PluginManifest>,
    pub enabled: bool,
    pub contribution: SourceContribution,
    pub loaded_at: DateTime<Utc>,
    pub reloads: u32,
}

/// Operator view of one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: Option<String>,
    pub root: PathBuf,
    pub enabled: bool,
    pub units: Vec<UnitId>,
    pub diagnostics: usize,
    pub loaded_at: DateTime<Utc>,
    pub reloads: u32,
}

impl From<&PluginSet> for PluginInfo {
    fn from(set: &PluginSet) -> Self {
        Self {
            name: set.name.clone(),
            version: set.manifest.as_ref().and_then(|m| m.version.clone()),
            root: set.root.clone(),
            enabled: set.enabled,
            units: set.contribution.unit_ids(),
            diagnostics: set.contribution.diagnostics.len(),
            loaded_at: set.loaded_at,
            reloads: set.reloads,
        }
    }
}

#[derive(Debug, Default)]
struct PluginState {
    enabled: bool,
    /// Load order; earlier plugins win id collisions
    plugins: Vec<PluginSet>,
}

impl PluginState {
    fn find(&self, name: &str) -> Option<usize> {
        self.plugins.iter().position(|p| p.name == name)
    }
}

pub struct PluginManager {
    registry: Registry,
    builtin: SourceContribution,
    state: Mutex<PluginState>,
    current: RwLock<Arc<Catalog>>,
    generation: AtomicU64,
}

impl PluginManager {
    /// Load the built-in source and publish the first catalog (generation 1)
    pub fn new(registry: Registry, builtin: &dyn UnitSource) -> crate::error::Result<Self> {
        let builtin = registry.load_source(builtin)?;
        let catalog = Catalog::assemble(std::slice::from_ref(&builtin), 1);
        Ok(Self {
            registry,
            builtin,
            state: Mutex::new(PluginState::default()),
            current: RwLock::new(Arc::new(catalog)),
            generation: AtomicU64::new(1),
        })
    }

    /// Manager over the crate's built-in units and factory kinds
    pub fn with_builtins() -> crate::error::Result<Self> {
        Self::new(Registry::default(), &crate::units::builtin_source())
    }

    /// Catalog for a new run. Never blocks on a reload in progress.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.read().clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Process-wide plugin toggle
    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;
        info!("Plugins {}", if enabled { "enabled" } else { "disabled" });
        self.publish(&state);
    }

    pub fn set_plugin_enabled(&self, name: &str, enabled: bool) -> Result<(), PluginError> {
        let mut state = self.state.lock();
        let index = state
            .find(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        state.plugins[index].enabled = enabled;
        self.publish(&state);
        Ok(())
    }

    /// Discover a plugin root and add it; returns the plugin name
    pub fn load(&self, root: impl AsRef<Path>) -> Result<String, PluginError> {
        let root = root.as_ref().to_path_buf();
        let manifest = PluginManifest::read(&root)?;
        let name = match &manifest {
            Some(manifest) => manifest.name.clone(),
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| PluginError::InvalidRoot {
                    path: root.display().to_string(),
                    reason: "cannot derive a plugin name".to_string(),
                })?,
        };

        if self.state.lock().find(&name).is_some() {
            return Err(PluginError::AlreadyLoaded(name));
        }

        let contribution = self.discover(&name, &root).map_err(|reason| PluginError::InvalidRoot {
            path: root.display().to_string(),
            reason,
        })?;

        let mut state = self.state.lock();
        if state.find(&name).is_some() {
            return Err(PluginError::AlreadyLoaded(name));
        }
        info!(
            "Plugin {} loaded from {}: {} units",
            name,
            root.display(),
            contribution.units.len()
        );
        state.plugins.push(PluginSet {
            name: name.clone(),
            root,
            manifest,
            enabled: true,
            contribution,
            loaded_at: Utc::now(),
            reloads: 0,
        });
        self.publish(&state);
        Ok(name)
    }

    pub fn unload(&self, name: &str) -> Result<(), PluginError> {
        let mut state = self.state.lock();
        let index = state
            .find(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        state.plugins.remove(index);
        info!("Plugin {} unloaded", name);
        self.publish(&state);
        Ok(())
    }

    /// Re-discover only this plugin's root and swap its contribution in
    ///
    /// On failure the previous contribution stays in the catalog untouched.
    /// The plugin name is fixed at load time; a manifest that now declares a
    /// different name fails the reload.
    pub fn reload(&self, name: &str) -> Result<(), PluginError> {
        let root = {
            let state = self.state.lock();
            let index = state
                .find(name)
                .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
            state.plugins[index].root.clone()
        };

        let rediscovered = PluginManifest::read(&root)
            .map_err(|e| e.to_string())
            .and_then(|manifest| {
                if let Some(renamed) = manifest.as_ref().filter(|m| m.name != name) {
                    return Err(format!(
                        "manifest now names the plugin '{}'; unload and load it to rename",
                        renamed.name
                    ));
                }
                Ok(manifest)
            })
            .and_then(|manifest| Ok((manifest, self.discover(name, &root)?)));

        let (manifest, contribution) = match rediscovered {
            Ok(found) => found,
            Err(reason) => {
                warn!("Plugin {} reload failed, keeping previous units: {}", name, reason);
                return Err(PluginError::ReloadFailed {
                    name: name.to_string(),
                    reason,
                });
            }
        };

        let mut state = self.state.lock();
        let index = state
            .find(name)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        let set = &mut state.plugins[index];
        set.manifest = manifest;
        set.contribution = contribution;
        set.loaded_at = Utc::now();
        set.reloads += 1;
        info!(
            "Plugin {} reloaded (#{}): {} units",
            name,
            set.reloads,
            set.contribution.units.len()
        );
        self.publish(&state);
        Ok(())
    }

    /// Plugins currently contributing units (global and per-plugin toggles on)
    pub fn list_active(&self) -> Vec<PluginInfo> {
        let state = self.state.lock();
        if !state.enabled {
            return Vec::new();
        }
        state
            .plugins
            .iter()
            .filter(|p| p.enabled)
            .map(PluginInfo::from)
            .collect()
    }

    /// Every loaded plugin, active or not, in load order
    pub fn list_loaded(&self) -> Vec<PluginInfo> {
        self.state.lock().plugins.iter().map(PluginInfo::from).collect()
    }

    fn discover(&self, name: &str, root: &Path) -> Result<SourceContribution, String> {
        let source = PluginDirSource::new(name, root);
        self.registry
            .load_source(&source)
            .map_err(|e| e.to_string())
    }

    /// Build and swap in a new catalog. Caller holds the state lock, which
    /// serializes writers.
    fn publish(&self, state: &PluginState) {
        let mut contributions = vec![self.builtin.clone()];
        if state.enabled {
            contributions.extend(
                state
                    .plugins
                    .iter()
                    .filter(|p| p.enabled)
                    .map(|p| p.contribution.clone()),
            );
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let catalog = Catalog::assemble(&contributions, generation);
        info!(
            "Catalog generation {}: {} units from {} sources ({} diagnostics)",
            generation,
            catalog.len(),
            contributions.len(),
            catalog.diagnostics().len()
        );
        *self.current.write() = Arc::new(catalog);
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("generation", &self.generation())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
