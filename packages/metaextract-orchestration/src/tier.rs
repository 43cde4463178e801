//! Tier-based visibility filtering
//!
//! A [`TierPolicy`] splits a [`MergedDocument`] into the part released to the
//! caller and a [`LockedSummary`] of what was withheld. Withheld values never
//! leave this module; only their counts do.
//!
//! Per entry (unit id ascending):
//! 1. `allowed_domains` (when set) must contain the unit id or one of its tags
//! 2. tag rules, where `hidden` beats `visible`
//! 3. `default_visibility`
//!
//! Visible entries then go field by field through the field rules and the
//! `max_fields` budget.

use crate::aggregate::{count_value, MergedDocument, MergedEntry};
use crate::unit::{Payload, UnitId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Visibility policy for one access tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierPolicy {
    pub name: String,

    #[serde(default)]
    pub default_visibility: Visibility,

    /// Capability tag → visibility
    #[serde(default)]
    pub tags: BTreeMap<String, Visibility>,

    /// `<unit>.<field>` or bare `<field>` → visibility (top-level fields)
    #[serde(default)]
    pub fields: BTreeMap<String, Visibility>,

    /// Unit ids or tags allowed at this tier (`None` = no allowlist)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<BTreeSet<String>>,

    /// Leaf values released at most (`None` = unbounded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fields: Option<usize>,
}

impl TierPolicy {
    /// Tier that releases everything
    pub fn unrestricted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_visibility: Visibility::Visible,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            allowed_domains: None,
            max_fields: None,
        }
    }

    pub fn with_default(mut self, visibility: Visibility) -> Self {
        self.default_visibility = visibility;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>, visibility: Visibility) -> Self {
        self.tags.insert(tag.into(), visibility);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>, visibility: Visibility) -> Self {
        self.fields.insert(field.into(), visibility);
        self
    }

    pub fn with_allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains = Some(domains.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_fields(mut self, max: usize) -> Self {
        self.max_fields = Some(max);
        self
    }

    /// Entry-level decision (before field rules)
    pub fn entry_visibility(&self, entry: &MergedEntry) -> Visibility {
        if let Some(allowed) = &self.allowed_domains {
            let listed = allowed.contains(&entry.unit_id)
                || entry.capability_tags.iter().any(|t| allowed.contains(t));
            if !listed {
                return Visibility::Hidden;
            }
        }

        let mut tagged = None;
        for tag in &entry.capability_tags {
            match self.tags.get(tag) {
                Some(Visibility::Hidden) => return Visibility::Hidden,
                Some(Visibility::Visible) => tagged = Some(Visibility::Visible),
                None => {}
            }
        }

        tagged.unwrap_or(self.default_visibility)
    }

    /// Field rule for one top-level field; qualified rules win over bare ones
    pub fn field_visibility(&self, unit_id: &str, field: &str) -> Option<Visibility> {
        self.fields
            .get(&format!("{}.{}", unit_id, field))
            .or_else(|| self.fields.get(field))
            .copied()
    }

    pub fn filter(&self, document: &MergedDocument) -> (ReleasedDocument, LockedSummary) {
        filter(document, self)
    }
}

/// Named tier policies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierPolicySet {
    policies: BTreeMap<String, TierPolicy>,
}

impl TierPolicySet {
    /// Build from a list; duplicate names are rejected
    pub fn new(policies: Vec<TierPolicy>) -> Result<Self, String> {
        let mut map = BTreeMap::new();
        for policy in policies {
            let name = policy.name.clone();
            if map.insert(name.clone(), policy).is_some() {
                return Err(format!("duplicate tier '{}'", name));
            }
        }
        Ok(Self { policies: map })
    }

    pub fn get(&self, name: &str) -> Option<&TierPolicy> {
        self.policies.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// What the caller receives
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleasedDocument {
    /// unit id → released payload
    pub entries: BTreeMap<UnitId, Payload>,
    /// Leaf values released
    pub fields: usize,
}

impl ReleasedDocument {
    pub fn get(&self, unit_id: &str) -> Option<&Payload> {
        self.entries.get(unit_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedGroup {
    /// Entries withheld entirely
    pub entries: usize,
    /// Leaf values withheld (including those of partially released entries)
    pub fields: usize,
}

/// Counts of withheld content, grouped by capability tag. Never values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedSummary {
    pub groups: BTreeMap<String, LockedGroup>,
    pub locked_entries: usize,
    pub locked_fields: usize,
}

impl LockedSummary {
    fn record(&mut self, group: &str, entry_locked: bool, fields: usize) {
        if !entry_locked && fields == 0 {
            return;
        }
        let slot = self.groups.entry(group.to_string()).or_default();
        if entry_locked {
            slot.entries += 1;
            self.locked_entries += 1;
        }
        slot.fields += fields;
        self.locked_fields += fields;
    }

    pub fn is_empty(&self) -> bool {
        self.locked_entries == 0 && self.locked_fields == 0
    }
}

/// Split a merged document into released and locked parts
pub fn filter(document: &MergedDocument, policy: &TierPolicy) -> (ReleasedDocument, LockedSummary) {
    let mut released = ReleasedDocument::default();
    let mut locked = LockedSummary::default();
    let mut budget = policy.max_fields;

    for (unit_id, entry) in &document.entries {
        let group = entry.group();

        if policy.entry_visibility(entry) == Visibility::Hidden {
            locked.record(group, true, entry.field_count);
            continue;
        }

        let mut kept = Payload::new();
        let mut kept_fields = 0;
        let mut withheld_fields = 0;

        for (field, value) in &entry.payload {
            let leaves = count_value(value);

            if policy.field_visibility(unit_id, field) == Some(Visibility::Hidden) {
                withheld_fields += leaves;
                continue;
            }

            if let Some(remaining) = budget.as_mut() {
                if leaves > *remaining {
                    withheld_fields += leaves;
                    continue;
                }
                *remaining -= leaves;
            }

            kept.insert(field.clone(), value.clone());
            kept_fields += leaves;
        }

        if kept.is_empty() && !entry.payload.is_empty() {
            locked.record(group, true, withheld_fields);
            continue;
        }

        locked.record(group, false, withheld_fields);
        released.fields += kept_fields;
        released.entries.insert(unit_id.clone(), kept);
    }

    debug!(
        "Tier '{}': released {} entries / {} fields, locked {} entries / {} fields",
        policy.name,
        released.entries.len(),
        released.fields,
        locked.locked_entries,
        locked.locked_fields
    );

    (released, locked)
}
