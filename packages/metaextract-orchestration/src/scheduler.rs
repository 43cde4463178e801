//! Layered execution
//!
//! Layers run strictly in sequence; units inside a layer run concurrently
//! under a bounded worker pool. Every invocation goes through one dispatch
//! wrapper that turns errors, panics and timeouts into a [`UnitResult`], so a
//! misbehaving unit can never abort the run.

use crate::aggregate::count_leaf_values;
use crate::dag::ExecutionPlan;
use crate::error::ErrorCategory;
use crate::registry::RegisteredUnit;
use crate::unit::{DependencyOutputs, FileContext, Payload, UnitDescriptor, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal state of one unit in one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Success,
    Error,
    Timeout,
    SkippedDependencyFailed,
    SkippedDisabled,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Success => "success",
            UnitStatus::Error => "error",
            UnitStatus::Timeout => "timeout",
            UnitStatus::SkippedDependencyFailed => "skipped_dependency_failed",
            UnitStatus::SkippedDisabled => "skipped_disabled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UnitStatus::Success)
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable kind (`panic`, `io`, `dependency_failed`, ...)
    pub kind: String,
    pub message: String,
    pub category: ErrorCategory,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            category,
        }
    }
}

/// Outcome of one unit. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit_id: UnitId,
    pub status: UnitStatus,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<ErrorInfo>,
    pub duration_ms: u64,
    #[serde(default)]
    pub capability_tags: BTreeSet<String>,
    /// Layer the unit was planned in (`None` when excluded at plan time)
    #[serde(default)]
    pub layer: Option<usize>,
}

impl UnitResult {
    pub fn success(desc: &UnitDescriptor, payload: Payload, duration_ms: u64, layer: usize) -> Self {
        Self {
            unit_id: desc.id.clone(),
            status: UnitStatus::Success,
            payload,
            error_info: None,
            duration_ms,
            capability_tags: desc.capability_tags.clone(),
            layer: Some(layer),
        }
    }

    pub fn failed(
        desc: &UnitDescriptor,
        status: UnitStatus,
        error: ErrorInfo,
        duration_ms: u64,
        layer: Option<usize>,
    ) -> Self {
        Self {
            unit_id: desc.id.clone(),
            status,
            payload: Payload::new(),
            error_info: Some(error),
            duration_ms,
            capability_tags: desc.capability_tags.clone(),
            layer,
        }
    }

    /// Leaf values in the payload (0 for anything but success)
    pub fn field_count(&self) -> usize {
        if self.status.is_success() {
            count_leaf_values(&self.payload)
        } else {
            0
        }
    }
}

/// Which units may run (capability gating)
///
/// A unit matches a set when the set contains its id or any of its tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Enablement {
    /// `None` = everything allowed
    #[serde(default)]
    pub allow: Option<BTreeSet<String>>,
    #[serde(default)]
    pub deny: BTreeSet<String>,
}

impl Enablement {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: Some(keys.into_iter().map(Into::into).collect()),
            deny: BTreeSet::new(),
        }
    }

    pub fn deny(mut self, key: impl Into<String>) -> Self {
        self.deny.insert(key.into());
        self
    }

    fn matches(set: &BTreeSet<String>, desc: &UnitDescriptor) -> bool {
        set.contains(&desc.id) || desc.capability_tags.iter().any(|t| set.contains(t))
    }

    pub fn is_enabled(&self, desc: &UnitDescriptor) -> bool {
        if Self::matches(&self.deny, desc) {
            return false;
        }
        match &self.allow {
            Some(allow) => Self::matches(allow, desc),
            None => true,
        }
    }

    /// Narrow this set by another (both must allow, either may deny)
    pub fn intersect(&self, other: &Enablement) -> Enablement {
        let allow = match (&self.allow, &other.allow) {
            (Some(a), Some(b)) => Some(a.intersection(b).cloned().collect()),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        Enablement {
            allow,
            deny: self.deny.union(&other.deny).cloned().collect(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Concurrent unit invocations per run
    pub worker_limit: usize,
    /// Budget of each invocation
    pub unit_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_limit: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            unit_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Sorted by unit id
    pub results: Vec<UnitResult>,
    pub cancelled: bool,
    /// Units never dispatched because the run was cancelled
    pub not_dispatched: Vec<UnitId>,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn result(&self, unit_id: &str) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.unit_id == unit_id)
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Execution scheduler
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every layer of the plan against one file
    pub async fn run(
        &self,
        run_id: Uuid,
        plan: &ExecutionPlan,
        ctx: Arc<FileContext>,
        enablement: &Enablement,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let run_start = Instant::now();
        let workers = Arc::new(Semaphore::new(self.config.worker_limit.max(1)));

        let mut results: BTreeMap<UnitId, UnitResult> = BTreeMap::new();
        let mut outputs: HashMap<UnitId, Arc<Payload>> = HashMap::new();
        let mut not_dispatched = Vec::new();

        info!(
            "Run {}: {} layers, {} units, {} workers, {}ms unit timeout",
            run_id,
            plan.layers().len(),
            plan.runnable_count(),
            self.config.worker_limit,
            self.config.unit_timeout.as_millis()
        );

        // Units the plan already excluded never run
        for diag in plan.diagnostics() {
            let desc = match plan.excluded_descriptor(&diag.unit_id) {
                Some(desc) => desc.clone(),
                None => Arc::new(UnitDescriptor::new(diag.unit_id.clone(), "unknown")),
            };
            let error = ErrorInfo::new("dependency_unavailable", diag.describe(), diag.category);
            results.insert(
                diag.unit_id.clone(),
                UnitResult::failed(&desc, UnitStatus::SkippedDependencyFailed, error, 0, None),
            );
        }

        for layer in plan.layers() {
            if cancel.is_cancelled() {
                not_dispatched.extend(layer.units.iter().cloned());
                continue;
            }

            info!(
                "Run {}: Layer {} - {} units{}",
                run_id,
                layer.index + 1,
                layer.units.len(),
                if layer.units.len() > 1 { " (parallel)" } else { "" }
            );

            let mut tasks = Vec::new();
            let mut task_ids = Vec::new();

            for unit_id in &layer.units {
                if cancel.is_cancelled() {
                    not_dispatched.push(unit_id.clone());
                    continue;
                }
                let Some(entry) = plan.unit(unit_id) else {
                    continue;
                };
                let desc = entry.descriptor.clone();

                if let Some(skipped) = Self::gate(&desc, &ctx, enablement, &results, layer.index) {
                    debug!("Run {}: {} {}", run_id, unit_id, skipped.status);
                    results.insert(unit_id.clone(), skipped);
                    continue;
                }

                let deps: BTreeMap<UnitId, Arc<Payload>> = desc
                    .dependency_ids
                    .iter()
                    .filter_map(|dep| outputs.get(dep).map(|p| (dep.clone(), p.clone())))
                    .collect();

                // Dispatch in id order; block here while the pool is full
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = workers.clone().acquire_owned() => permit.ok(),
                };
                let Some(permit) = permit else {
                    not_dispatched.push(unit_id.clone());
                    continue;
                };

                tasks.push(tokio::spawn(Self::dispatch(
                    entry.clone(),
                    ctx.clone(),
                    DependencyOutputs::new(deps),
                    permit,
                    self.config.unit_timeout,
                    layer.index,
                )));
                task_ids.push(desc);
            }

            // Barrier: the whole layer reaches a terminal state before the next starts
            let joined = futures::future::join_all(tasks).await;

            for (desc, joined) in task_ids.into_iter().zip(joined) {
                match joined {
                    Ok(result) => {
                        if result.status.is_success() {
                            outputs.insert(desc.id.clone(), Arc::new(result.payload.clone()));
                        }
                        results.insert(desc.id.clone(), result);
                    }
                    Err(join_err) => {
                        warn!("Run {}: dispatch of {} failed: {}", run_id, desc.id, join_err);
                        let error = ErrorInfo::new(
                            "dispatch_failed",
                            join_err.to_string(),
                            ErrorCategory::Runtime,
                        );
                        results.insert(
                            desc.id.clone(),
                            UnitResult::failed(&desc, UnitStatus::Error, error, 0, Some(layer.index)),
                        );
                    }
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        let outcome = RunOutcome {
            results: results.into_values().collect(),
            cancelled,
            not_dispatched,
            duration_ms: run_start.elapsed().as_millis() as u64,
        };

        info!(
            "Run {}: finished in {}ms - {} success, {} error, {} timeout, {} skipped{}",
            run_id,
            outcome.duration_ms,
            outcome.count(UnitStatus::Success),
            outcome.count(UnitStatus::Error),
            outcome.count(UnitStatus::Timeout),
            outcome.count(UnitStatus::SkippedDependencyFailed)
                + outcome.count(UnitStatus::SkippedDisabled),
            if cancelled { " (cancelled)" } else { "" }
        );
        outcome
    }

    /// Decide whether a unit is skipped before it is ever invoked
    fn gate(
        desc: &UnitDescriptor,
        ctx: &FileContext,
        enablement: &Enablement,
        results: &BTreeMap<UnitId, UnitResult>,
        layer: usize,
    ) -> Option<UnitResult> {
        if !enablement.is_enabled(desc) {
            let error = ErrorInfo::new(
                "disabled",
                format!("{} is not enabled for this run", desc.id),
                ErrorCategory::Configuration,
            );
            return Some(UnitResult::failed(
                desc,
                UnitStatus::SkippedDisabled,
                error,
                0,
                Some(layer),
            ));
        }

        if !desc.is_applicable(ctx.category) {
            let error = ErrorInfo::new(
                "not_applicable",
                format!("{} does not handle {} files", desc.id, ctx.category),
                ErrorCategory::Configuration,
            );
            return Some(UnitResult::failed(
                desc,
                UnitStatus::SkippedDisabled,
                error,
                0,
                Some(layer),
            ));
        }

        let failed: Vec<String> = desc
            .dependency_ids
            .iter()
            .filter_map(|dep| match results.get(dep) {
                Some(r) if r.status.is_success() => None,
                Some(r) => Some(format!("{} ({})", dep, r.status)),
                None => Some(format!("{} (no result)", dep)),
            })
            .collect();

        if failed.is_empty() {
            return None;
        }

        let error = ErrorInfo::new(
            "dependency_failed",
            format!("dependencies did not succeed: {}", failed.join(", ")),
            ErrorCategory::Dependency,
        );
        Some(UnitResult::failed(
            desc,
            UnitStatus::SkippedDependencyFailed,
            error,
            0,
            Some(layer),
        ))
    }

    /// Invoke the unit on a worker slot and convert whatever happens into a result
    async fn dispatch(
        entry: RegisteredUnit,
        ctx: Arc<FileContext>,
        deps: DependencyOutputs,
        _permit: OwnedSemaphorePermit,
        timeout: Duration,
        layer: usize,
    ) -> UnitResult {
        let desc = entry.descriptor.clone();
        let started = Instant::now();
        debug!("Invoking unit {} (layer {})", desc.id, layer + 1);

        // Separate task so a panic is contained and a timed-out unit can be aborted
        let unit = entry.unit.clone();
        let mut handle = tokio::spawn(async move { unit.invoke(&ctx, &deps).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(payload))) => {
                let elapsed = started.elapsed().as_millis() as u64;
                UnitResult::success(&desc, payload, elapsed, layer)
            }
            Ok(Ok(Err(e))) => {
                let elapsed = started.elapsed().as_millis() as u64;
                warn!("Unit {} failed after {}ms: {}", desc.id, elapsed, e);
                let error = ErrorInfo::new(e.kind(), e.to_string(), ErrorCategory::Runtime);
                UnitResult::failed(&desc, UnitStatus::Error, error, elapsed, Some(layer))
            }
            Ok(Err(join_err)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let (kind, message) = if join_err.is_panic() {
                    ("panic", panic_message(join_err.into_panic()))
                } else {
                    ("aborted", join_err.to_string())
                };
                warn!("Unit {} crashed after {}ms: {}", desc.id, elapsed, message);
                let error = ErrorInfo::new(kind, message, ErrorCategory::Runtime);
                UnitResult::failed(&desc, UnitStatus::Error, error, elapsed, Some(layer))
            }
            Err(_) => {
                handle.abort();
                let elapsed = started.elapsed().as_millis() as u64;
                warn!(
                    "Unit {} timed out after {}ms",
                    desc.id,
                    timeout.as_millis()
                );
                let error = ErrorInfo::new(
                    "timeout",
                    format!("exceeded {}ms budget", timeout.as_millis()),
                    ErrorCategory::Timeout,
                );
                UnitResult::failed(&desc, UnitStatus::Timeout, error, elapsed, Some(layer))
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unit panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::PlanBuilder;
    use crate::registry::{BuiltinSource, Registry, UnitFactoryRegistry};
    use crate::unit::{Unit, UnitError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        Fields(usize),
        Fail,
        Panic,
        Sleep(u64),
        EchoDeps,
    }

    struct MockUnit {
        desc: UnitDescriptor,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Unit for MockUnit {
        fn descriptor(&self) -> &UnitDescriptor {
            &self.desc
        }

        async fn invoke(
            &self,
            _ctx: &FileContext,
            deps: &DependencyOutputs,
        ) -> Result<Payload, UnitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut payload = Payload::new();
            match &self.behavior {
                Behavior::Fields(n) => {
                    for i in 0..*n {
                        payload.insert(format!("f{}", i), json!(i));
                    }
                }
                Behavior::Fail => return Err(UnitError::Malformed("bad header".to_string())),
                Behavior::Panic => panic!("unit exploded"),
                Behavior::Sleep(ms) => {
                    tokio::time::sleep(Duration::from_millis(*ms)).await;
                    payload.insert("slept".to_string(), json!(true));
                }
                Behavior::EchoDeps => {
                    for (id, dep) in deps.iter() {
                        payload.insert(id.clone(), json!(dep.len()));
                    }
                }
            }
            Ok(payload)
        }
    }

    struct Fixture {
        plan: ExecutionPlan,
        calls: BTreeMap<String, Arc<AtomicUsize>>,
    }

    fn fixture(specs: Vec<(&str, Vec<&str>, Behavior)>) -> Fixture {
        let mut calls = BTreeMap::new();
        let mut units: Vec<Arc<dyn Unit>> = Vec::new();
        for (id, deps, behavior) in specs {
            let counter = Arc::new(AtomicUsize::new(0));
            calls.insert(id.to_string(), counter.clone());
            let desc = deps
                .into_iter()
                .fold(UnitDescriptor::new(id, "1.0").tag("test"), |d, dep| {
                    d.depends_on(dep)
                });
            units.push(Arc::new(MockUnit {
                desc,
                behavior,
                calls: counter,
            }));
        }
        let source = BuiltinSource::new(units);
        let catalog = Registry::new(UnitFactoryRegistry::new())
            .discover(&[&source], 1)
            .unwrap();
        Fixture {
            plan: PlanBuilder::build(&catalog),
            calls,
        }
    }

    fn ctx() -> Arc<FileContext> {
        Arc::new(FileContext::new("/tmp/sample.bin", "application/octet-stream", 16))
    }

    fn scheduler(workers: usize, timeout_ms: u64) -> Scheduler {
        Scheduler::new(SchedulerConfig {
            worker_limit: workers,
            unit_timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[tokio::test]
    async fn test_dependency_outputs_flow_downstream() {
        let fx = fixture(vec![
            ("a", vec![], Behavior::Fields(3)),
            ("b", vec!["a"], Behavior::EchoDeps),
        ]);
        let outcome = scheduler(2, 1000)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &Enablement::all(), &CancellationToken::new())
            .await;

        let b = outcome.result("b").unwrap();
        assert_eq!(b.status, UnitStatus::Success);
        assert_eq!(b.payload.get("a"), Some(&json!(3)));
        assert_eq!(b.layer, Some(1));
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependent_without_invoking() {
        let fx = fixture(vec![
            ("a", vec![], Behavior::Fail),
            ("b", vec!["a"], Behavior::Fields(1)),
            ("c", vec![], Behavior::Fields(2)),
        ]);
        let outcome = scheduler(2, 1000)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &Enablement::all(), &CancellationToken::new())
            .await;

        let a = outcome.result("a").unwrap();
        assert_eq!(a.status, UnitStatus::Error);
        assert_eq!(a.error_info.as_ref().unwrap().kind, "malformed");

        let b = outcome.result("b").unwrap();
        assert_eq!(b.status, UnitStatus::SkippedDependencyFailed);
        assert_eq!(fx.calls["b"].load(Ordering::SeqCst), 0);

        assert_eq!(outcome.result("c").unwrap().status, UnitStatus::Success);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let fx = fixture(vec![
            ("boom", vec![], Behavior::Panic),
            ("calm", vec![], Behavior::Fields(1)),
        ]);
        let outcome = scheduler(2, 1000)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &Enablement::all(), &CancellationToken::new())
            .await;

        let boom = outcome.result("boom").unwrap();
        assert_eq!(boom.status, UnitStatus::Error);
        let info = boom.error_info.as_ref().unwrap();
        assert_eq!(info.kind, "panic");
        assert!(info.message.contains("unit exploded"));
        assert_eq!(outcome.result("calm").unwrap().status, UnitStatus::Success);
    }

    #[tokio::test]
    async fn test_timeout_is_bounded_and_recorded() {
        let fx = fixture(vec![
            ("slow", vec![], Behavior::Sleep(5_000)),
            ("fast", vec![], Behavior::Fields(1)),
            ("after", vec!["fast"], Behavior::Fields(1)),
        ]);
        let started = Instant::now();
        let outcome = scheduler(4, 50)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &Enablement::all(), &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_millis(2_000));
        let slow = outcome.result("slow").unwrap();
        assert_eq!(slow.status, UnitStatus::Timeout);
        assert_eq!(slow.field_count(), 0);
        assert_eq!(slow.error_info.as_ref().unwrap().category, ErrorCategory::Timeout);
        assert_eq!(outcome.result("after").unwrap().status, UnitStatus::Success);
    }

    #[tokio::test]
    async fn test_disabled_units_are_not_invoked() {
        let fx = fixture(vec![
            ("a", vec![], Behavior::Fields(1)),
            ("b", vec!["a"], Behavior::Fields(1)),
        ]);
        let enablement = Enablement::all().deny("a");
        let outcome = scheduler(2, 1000)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &enablement, &CancellationToken::new())
            .await;

        assert_eq!(outcome.result("a").unwrap().status, UnitStatus::SkippedDisabled);
        assert_eq!(
            outcome.result("b").unwrap().status,
            UnitStatus::SkippedDependencyFailed
        );
        assert_eq!(fx.calls["a"].load(Ordering::SeqCst), 0);
        assert_eq!(fx.calls["b"].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_applicable_unit_is_skipped_disabled() {
        let unit = MockUnit {
            desc: UnitDescriptor::new("img", "1.0").applies_to(crate::unit::MimeCategory::Image),
            behavior: Behavior::Fields(1),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let source = BuiltinSource::new(vec![Arc::new(unit) as Arc<dyn Unit>]);
        let catalog = Registry::new(UnitFactoryRegistry::new())
            .discover(&[&source], 1)
            .unwrap();
        let plan = PlanBuilder::build(&catalog);

        let outcome = scheduler(1, 1000)
            .run(Uuid::new_v4(), &plan, ctx(), &Enablement::all(), &CancellationToken::new())
            .await;

        let img = outcome.result("img").unwrap();
        assert_eq!(img.status, UnitStatus::SkippedDisabled);
        assert_eq!(img.error_info.as_ref().unwrap().kind, "not_applicable");
    }

    #[tokio::test]
    async fn test_plan_exclusions_reported_as_skipped() {
        let fx = fixture(vec![
            ("a", vec![], Behavior::Fields(1)),
            ("c", vec!["x"], Behavior::Fields(1)),
        ]);
        let outcome = scheduler(1, 1000)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &Enablement::all(), &CancellationToken::new())
            .await;

        let c = outcome.result("c").unwrap();
        assert_eq!(c.status, UnitStatus::SkippedDependencyFailed);
        assert_eq!(c.layer, None);
        assert!(c.error_info.as_ref().unwrap().message.contains("x"));
        assert!(c.capability_tags.contains("test"));
        assert_eq!(fx.calls["c"].load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_limit_bounds_concurrency() {
        let fx = fixture(vec![
            ("a", vec![], Behavior::Sleep(60)),
            ("b", vec![], Behavior::Sleep(60)),
            ("c", vec![], Behavior::Sleep(60)),
        ]);
        let started = Instant::now();
        let outcome = scheduler(1, 5_000)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &Enablement::all(), &CancellationToken::new())
            .await;

        // One worker: the three sleeps cannot overlap
        assert!(started.elapsed() >= Duration::from_millis(170));
        assert_eq!(outcome.count(UnitStatus::Success), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_new_dispatch() {
        let fx = fixture(vec![
            ("a", vec![], Behavior::Sleep(100)),
            ("b", vec![], Behavior::Sleep(100)),
            ("c", vec!["a"], Behavior::Fields(1)),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = scheduler(1, 5_000)
            .run(Uuid::new_v4(), &fx.plan, ctx(), &Enablement::all(), &cancel)
            .await;

        assert!(outcome.cancelled);
        // `a` was in flight and finishes; `b` was still waiting for the only worker
        assert_eq!(outcome.result("a").unwrap().status, UnitStatus::Success);
        assert!(outcome.result("b").is_none());
        assert!(outcome.result("c").is_none());
        assert_eq!(outcome.not_dispatched, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(fx.calls["c"].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_enablement_rules() {
        let desc = UnitDescriptor::new("image.exif", "1").tag("image");

        assert!(Enablement::all().is_enabled(&desc));
        assert!(Enablement::only(["image"]).is_enabled(&desc));
        assert!(Enablement::only(["image.exif"]).is_enabled(&desc));
        assert!(!Enablement::only(["audio"]).is_enabled(&desc));
        assert!(!Enablement::all().deny("image").is_enabled(&desc));

        let narrowed = Enablement::only(["image", "audio"]).intersect(&Enablement::only(["audio"]));
        assert!(!narrowed.is_enabled(&desc));
    }

    #[test]
    fn test_unit_status_serialization() {
        let json = serde_json::to_string(&UnitStatus::SkippedDependencyFailed).unwrap();
        assert_eq!(json, "\"skipped_dependency_failed\"");
        assert_eq!(UnitStatus::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert!(config.worker_limit > 0);
        assert_eq!(config.unit_timeout, Duration::from_secs(30));
    }
}
