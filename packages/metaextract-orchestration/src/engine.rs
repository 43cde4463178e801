//! In-process entry point
//!
//! snapshot → plan → run → merge → tier filter, once per request.

use crate::aggregate::{Diagnostics, MergedDocument};
use crate::config::EngineConfig;
use crate::dag::{ExecutionPlan, PlanBuilder};
use crate::error::{OrchestratorError, Result};
use crate::plugin::PluginManager;
use crate::scheduler::{Enablement, Scheduler};
use crate::tier::{filter, LockedSummary, ReleasedDocument, TierPolicySet};
use crate::unit::FileContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// One file to extract, as handed over by the request layer
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub path: PathBuf,
    pub mime_type: String,
    /// Resolved access tier (`None` = configured default)
    pub tier: Option<String>,
    /// Narrows the configured capability set for this run
    pub enablement: Option<Enablement>,
}

impl ExtractionRequest {
    pub fn new(path: impl Into<PathBuf>, mime_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mime_type: mime_type.into(),
            tier: None,
            enablement: None,
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_enablement(mut self, enablement: Enablement) -> Self {
        self.enablement = Some(enablement);
        self
    }
}

/// What the caller gets back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    pub run_id: Uuid,
    pub tier: String,
    pub catalog_generation: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub released: ReleasedDocument,
    /// Leaf values released at this tier
    pub fields_extracted: usize,
    /// Leaf values extracted before tier filtering
    pub fields_total: usize,
    pub locked: LockedSummary,
    /// Operator-facing; not meant for end users
    pub diagnostics: Diagnostics,
    pub cancelled: bool,
}

impl ExtractionReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(OrchestratorError::serialization)
    }
}

pub struct ExtractionEngine {
    plugins: Arc<PluginManager>,
    scheduler: Scheduler,
    tiers: TierPolicySet,
    default_tier: String,
    capabilities: Enablement,
}

impl ExtractionEngine {
    /// Engine over an existing plugin manager
    pub fn new(plugins: Arc<PluginManager>, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            plugins,
            scheduler: Scheduler::new(config.scheduler_config()),
            tiers: config.tier_policies()?,
            default_tier: config.default_tier.clone(),
            capabilities: config.capabilities.clone(),
        })
    }

    /// Built-in units plus the plugin roots named in the configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let plugins = PluginManager::with_builtins()?;
        plugins.set_enabled(config.plugins.enabled);
        for root in &config.plugins.roots {
            plugins.load(root)?;
        }
        Self::new(Arc::new(plugins), config)
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Plan against the current catalog
    pub fn plan(&self) -> ExecutionPlan {
        PlanBuilder::build(&self.plugins.snapshot())
    }

    /// Extract one file
    ///
    /// Fails only for run-level conditions: unknown tier, unreadable file,
    /// or a plan with nothing runnable. Unit failures land in the report.
    pub async fn extract(
        &self,
        request: ExtractionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractionReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let tier = request.tier.unwrap_or_else(|| self.default_tier.clone());
        let policy = self
            .tiers
            .get(&tier)
            .ok_or_else(|| OrchestratorError::UnknownTier(tier.clone()))?;

        let ctx = FileContext::inspect(&request.path, &request.mime_type)
            .await
            .map_err(|e| OrchestratorError::FileContext(format!("{}: {}", request.path.display(), e)))?;

        // Pinned for the whole run; later reloads do not reach it
        let catalog = self.plugins.snapshot();
        let plan = PlanBuilder::build(&catalog);
        if plan.is_empty() {
            return Err(OrchestratorError::NothingRunnable {
                excluded: plan.diagnostics().len(),
            });
        }

        info!(
            "Run {}: {} ({}, {} bytes), tier '{}', catalog generation {}",
            run_id,
            ctx.path.display(),
            ctx.mime_type,
            ctx.size_bytes,
            tier,
            catalog.generation()
        );
        debug!("Run {} plan:\n{}", run_id, plan.describe());

        let enablement = match &request.enablement {
            Some(narrow) => self.capabilities.intersect(narrow),
            None => self.capabilities.clone(),
        };

        let outcome = self
            .scheduler
            .run(run_id, &plan, Arc::new(ctx), &enablement, cancel)
            .await;

        let merged = MergedDocument::merge(&outcome.results)
            .with_discovery(catalog.diagnostics())
            .with_plan(plan.diagnostics())
            .with_not_dispatched(&outcome.not_dispatched)
            .with_cancellation(outcome.cancelled);
        let (released, locked) = filter(&merged, policy);

        Ok(ExtractionReport {
            run_id,
            tier,
            catalog_generation: catalog.generation(),
            started_at,
            finished_at: Utc::now(),
            fields_extracted: released.fields,
            fields_total: merged.fields_extracted,
            released,
            locked,
            diagnostics: merged.diagnostics,
            cancelled: outcome.cancelled,
        })
    }
}

impl std::fmt::Debug for ExtractionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionEngine")
            .field("plugins", &self.plugins)
            .field("scheduler", &self.scheduler)
            .field("tiers", &self.tiers.names().collect::<Vec<_>>())
            .field("default_tier", &self.default_tier)
            .finish()
    }
}
