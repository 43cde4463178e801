//! Result aggregation
//!
//! Pure merge of per-unit results into one keyed document. The merge never
//! looks inside a payload beyond counting its leaf values.

use crate::dag::PlanDiagnostic;
use crate::error::ErrorCategory;
use crate::registry::DiscoveryDiagnostic;
use crate::scheduler::{ErrorInfo, UnitResult, UnitStatus};
use crate::unit::{Payload, UnitId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Number of leaf values in a payload
///
/// Scalars count 1, `null` counts 0, objects and arrays count their leaves.
pub fn count_leaf_values(payload: &Payload) -> usize {
    payload.values().map(count_value).sum()
}

pub fn count_value(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Object(map) => map.values().map(count_value).sum(),
        Value::Array(items) => items.iter().map(count_value).sum(),
        Value::Bool(_) | Value::Number(_) | Value::String(_) => 1,
    }
}

/// One successful unit's contribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedEntry {
    pub unit_id: UnitId,
    pub capability_tags: BTreeSet<String>,
    pub payload: Payload,
    pub field_count: usize,
}

impl MergedEntry {
    /// Group key: first capability tag, or the unit id when untagged
    pub fn group(&self) -> &str {
        self.capability_tags
            .iter()
            .next()
            .map(String::as_str)
            .unwrap_or(self.unit_id.as_str())
    }
}

/// Operator-facing diagnostics block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Every unit result (success or not), sorted by unit id
    pub units: Vec<UnitResult>,
    pub discovery: Vec<DiscoveryDiagnostic>,
    pub plan: Vec<PlanDiagnostic>,
    pub not_dispatched: Vec<UnitId>,
    /// Set when the caller cancelled the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<ErrorInfo>,
}

impl Diagnostics {
    pub fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.units
            .iter()
            .find(|r| r.unit_id == unit_id)
            .map(|r| r.status)
    }

    /// Units that could have contributed fields but did not succeed
    pub fn unavailable(&self) -> Vec<(&str, UnitStatus)> {
        self.units
            .iter()
            .filter(|r| !r.status.is_success())
            .map(|r| (r.unit_id.as_str(), r.status))
            .collect()
    }
}

/// Merged output of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedDocument {
    pub entries: BTreeMap<UnitId, MergedEntry>,
    pub diagnostics: Diagnostics,
    pub fields_extracted: usize,
}

impl MergedDocument {
    /// Merge unit results; deterministic regardless of input order
    pub fn merge(results: &[UnitResult]) -> Self {
        let mut units: Vec<UnitResult> = results.to_vec();
        units.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

        let mut entries = BTreeMap::new();
        for result in units.iter().filter(|r| r.status.is_success()) {
            let field_count = count_leaf_values(&result.payload);
            entries.insert(
                result.unit_id.clone(),
                MergedEntry {
                    unit_id: result.unit_id.clone(),
                    capability_tags: result.capability_tags.clone(),
                    payload: result.payload.clone(),
                    field_count,
                },
            );
        }

        let fields_extracted = entries.values().map(|e| e.field_count).sum();

        Self {
            entries,
            diagnostics: Diagnostics {
                units,
                ..Default::default()
            },
            fields_extracted,
        }
    }

    pub fn with_discovery(mut self, discovery: &[DiscoveryDiagnostic]) -> Self {
        self.diagnostics.discovery = discovery.to_vec();
        self
    }

    pub fn with_plan(mut self, plan: &[PlanDiagnostic]) -> Self {
        self.diagnostics.plan = plan.to_vec();
        self
    }

    pub fn with_not_dispatched(mut self, not_dispatched: &[UnitId]) -> Self {
        let mut ids = not_dispatched.to_vec();
        ids.sort();
        self.diagnostics.not_dispatched = ids;
        self
    }

    /// Record a caller cancellation against the units it kept from running
    pub fn with_cancellation(mut self, cancelled: bool) -> Self {
        self.diagnostics.cancellation = cancelled.then(|| {
            ErrorInfo::new(
                "cancelled",
                format!(
                    "run cancelled, {} units not dispatched",
                    self.diagnostics.not_dispatched.len()
                ),
                ErrorCategory::Cancelled,
            )
        });
        self
    }

    pub fn entry(&self, unit_id: &str) -> Option<&MergedEntry> {
        self.entries.get(unit_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tag-based consumer view: tag -> unit id -> payload
    ///
    /// A unit with several tags appears under each of them; untagged units
    /// appear under their own id.
    pub fn by_capability(&self) -> BTreeMap<&str, BTreeMap<&str, &Payload>> {
        let mut view: BTreeMap<&str, BTreeMap<&str, &Payload>> = BTreeMap::new();
        for entry in self.entries.values() {
            if entry.capability_tags.is_empty() {
                view.entry(entry.unit_id.as_str())
                    .or_default()
                    .insert(entry.unit_id.as_str(), &entry.payload);
                continue;
            }
            for tag in &entry.capability_tags {
                view.entry(tag.as_str())
                    .or_default()
                    .insert(entry.unit_id.as_str(), &entry.payload);
            }
        }
        view
    }
}
