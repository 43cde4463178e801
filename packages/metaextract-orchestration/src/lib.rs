/*
 * Metaextract Orchestration - Extractor Unit Orchestration Engine
 *
 * Runs an open-ended set of independent metadata extractor units against one
 * file and merges their outputs into a single tier-filtered document.
 *
 * Architecture:
 * - Registry (built-in + plugin sources, per-unit load diagnostics)
 * - Dependency Graph Builder (Kahn layering, cycle reporting)
 * - Execution Scheduler (bounded worker pool, timeouts, panic isolation)
 * - Result Aggregator + Tier Filter
 * - Plugin Manager (atomic catalog snapshots, hot reload)
 */

// Public modules
pub mod aggregate;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod scheduler;
pub mod tier;
pub mod unit;
pub mod units;

// Re-exports
pub use aggregate::{count_leaf_values, Diagnostics, MergedDocument, MergedEntry};
pub use config::{ConfigError, EngineConfig};
pub use dag::{ExecutionPlan, Layer, PlanBuilder, PlanDiagnostic, PlanIssue};
pub use engine::{ExtractionEngine, ExtractionReport, ExtractionRequest};
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use plugin::{PluginError, PluginInfo, PluginManager, PluginManifest, PluginSet};
pub use registry::{
    BuiltinSource, Catalog, DiscoveryDiagnostic, DiscoveryIssue, PluginDirSource, RegisteredUnit,
    Registry, SourceContribution, UnitFactoryRegistry, UnitSource,
};
pub use scheduler::{
    Enablement, ErrorInfo, RunOutcome, Scheduler, SchedulerConfig, UnitResult, UnitStatus,
};
pub use tier::{filter, LockedSummary, ReleasedDocument, TierPolicy, TierPolicySet, Visibility};
pub use unit::{
    DependencyOutputs, FileContext, MimeCategory, Payload, Unit, UnitDescriptor, UnitError,
    UnitId, UnitOrigin,
};

/// Merge unit results (see [`MergedDocument::merge`])
pub fn merge(results: &[UnitResult]) -> MergedDocument {
    MergedDocument::merge(results)
}
