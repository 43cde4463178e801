use crate::error::ErrorCategory;
use crate::registry::{Catalog, RegisteredUnit};
use crate::unit::{UnitDescriptor, UnitId};
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// Why a unit was left out of the execution plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanIssue {
    /// Declares dependencies that are not in the catalog
    MissingDependency { missing: Vec<UnitId> },
    /// Depends on a unit that was itself excluded
    DependencyExcluded { via: Vec<UnitId> },
    /// Member of a dependency cycle (chain closes back on its first id)
    Cycle { chain: Vec<UnitId> },
    /// Depends (transitively) on a cycle member
    BlockedByCycle { via: Vec<UnitId> },
}

/// Plan-time dependency error for one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDiagnostic {
    pub unit_id: UnitId,
    pub issue: PlanIssue,
    pub category: ErrorCategory,
}

impl PlanDiagnostic {
    fn new(unit_id: UnitId, issue: PlanIssue) -> Self {
        Self {
            unit_id,
            issue,
            category: ErrorCategory::Dependency,
        }
    }

    /// Ids this diagnostic points at (missing ids, blocking units, cycle chain)
    pub fn referenced_ids(&self) -> &[UnitId] {
        match &self.issue {
            PlanIssue::MissingDependency { missing } => missing,
            PlanIssue::DependencyExcluded { via } => via,
            PlanIssue::Cycle { chain } => chain,
            PlanIssue::BlockedByCycle { via } => via,
        }
    }

    pub fn describe(&self) -> String {
        match &self.issue {
            PlanIssue::MissingDependency { missing } => {
                format!("{}: missing dependency {}", self.unit_id, missing.join(", "))
            }
            PlanIssue::DependencyExcluded { via } => {
                format!("{}: dependency excluded ({})", self.unit_id, via.join(", "))
            }
            PlanIssue::Cycle { chain } => {
                format!("{}: dependency cycle {}", self.unit_id, chain.join(" -> "))
            }
            PlanIssue::BlockedByCycle { via } => {
                format!("{}: blocked by cycle via {}", self.unit_id, via.join(", "))
            }
        }
    }
}

/// A set of units with no dependency edge between them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub index: usize,
    /// Sorted ascending
    pub units: Vec<UnitId>,
}

/// Ordered layers for one run, built from one catalog snapshot
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    layers: Vec<Layer>,
    units: BTreeMap<UnitId, RegisteredUnit>,
    diagnostics: Vec<PlanDiagnostic>,
    excluded: BTreeMap<UnitId, Arc<UnitDescriptor>>,
    catalog_generation: u64,
}

impl ExecutionPlan {
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn unit(&self, id: &str) -> Option<&RegisteredUnit> {
        self.units.get(id)
    }

    /// Units excluded at plan time, sorted by id
    pub fn diagnostics(&self) -> &[PlanDiagnostic] {
        &self.diagnostics
    }

    /// Descriptor of a unit excluded at plan time
    pub fn excluded_descriptor(&self, id: &str) -> Option<&Arc<UnitDescriptor>> {
        self.excluded.get(id)
    }

    pub fn catalog_generation(&self) -> u64 {
        self.catalog_generation
    }

    /// Number of units placed in layers
    pub fn runnable_count(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Layer index of a planned unit
    pub fn layer_of(&self, id: &str) -> Option<usize> {
        self.layers
            .iter()
            .find(|layer| layer.units.iter().any(|u| u == id))
            .map(|layer| layer.index)
    }

    /// Get execution plan as string (for logging)
    pub fn describe(&self) -> String {
        self.layers
            .iter()
            .map(|layer| {
                if layer.units.len() > 1 {
                    format!(
                        "Layer {}: {} (parallel)",
                        layer.index + 1,
                        layer.units.join(" ∥ ")
                    )
                } else {
                    format!("Layer {}: {}", layer.index + 1, layer.units.join(""))
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Turns a catalog into an execution plan
pub struct PlanBuilder;

impl PlanBuilder {
    pub fn build(catalog: &Catalog) -> ExecutionPlan {
        let mut excluded: BTreeMap<UnitId, PlanIssue> = BTreeMap::new();

        // Missing dependencies, then everything downstream of them
        for (id, unit) in catalog.iter() {
            let missing: Vec<UnitId> = unit
                .descriptor
                .dependency_ids
                .iter()
                .filter(|dep| !catalog.contains(dep))
                .cloned()
                .collect();
            if !missing.is_empty() {
                excluded.insert(id.clone(), PlanIssue::MissingDependency { missing });
            }
        }
        Self::propagate_exclusions(catalog, &mut excluded, |via| PlanIssue::DependencyExcluded {
            via,
        });

        let candidates: BTreeMap<&UnitId, &RegisteredUnit> = catalog
            .iter()
            .filter(|(id, _)| !excluded.contains_key(*id))
            .collect();

        let (layers, unplaced) = Self::layer(&candidates);

        if !unplaced.is_empty() {
            Self::classify_cycles(&candidates, &unplaced, &mut excluded);
        }

        let units: BTreeMap<UnitId, RegisteredUnit> = layers
            .iter()
            .flat_map(|layer| layer.units.iter())
            .filter_map(|id| catalog.get(id).map(|u| (id.clone(), u.clone())))
            .collect();

        let excluded_descriptors = excluded
            .keys()
            .filter_map(|id| catalog.get(id).map(|u| (id.clone(), u.descriptor.clone())))
            .collect();

        let diagnostics: Vec<PlanDiagnostic> = excluded
            .into_iter()
            .map(|(id, issue)| PlanDiagnostic::new(id, issue))
            .collect();

        for diag in &diagnostics {
            warn!("Plan: excluded {}", diag.describe());
        }

        let plan = ExecutionPlan {
            layers,
            units,
            diagnostics,
            excluded: excluded_descriptors,
            catalog_generation: catalog.generation(),
        };

        info!(
            "Execution plan (catalog gen {}): {} units in {} layers, {} excluded",
            plan.catalog_generation,
            plan.runnable_count(),
            plan.layers.len(),
            plan.diagnostics.len()
        );
        plan
    }

    /// Exclude every unit that depends on an already excluded unit, until fixpoint
    fn propagate_exclusions(
        catalog: &Catalog,
        excluded: &mut BTreeMap<UnitId, PlanIssue>,
        issue: impl Fn(Vec<UnitId>) -> PlanIssue,
    ) {
        let mut queue: VecDeque<UnitId> = excluded.keys().cloned().collect();
        while let Some(blocked) = queue.pop_front() {
            for (id, unit) in catalog.iter() {
                if excluded.contains_key(id) || !unit.descriptor.dependency_ids.contains(&blocked)
                {
                    continue;
                }
                let via: Vec<UnitId> = unit
                    .descriptor
                    .dependency_ids
                    .iter()
                    .filter(|dep| excluded.contains_key(*dep))
                    .cloned()
                    .collect();
                excluded.insert(id.clone(), issue(via));
                queue.push_back(id.clone());
            }
        }
    }

    /// Kahn's algorithm, one layer per round
    fn layer(candidates: &BTreeMap<&UnitId, &RegisteredUnit>) -> (Vec<Layer>, BTreeSet<UnitId>) {
        let mut in_degree: BTreeMap<&UnitId, usize> = candidates
            .iter()
            .map(|(id, unit)| (*id, unit.descriptor.dependency_ids.len()))
            .collect();

        let mut dependents: HashMap<&str, Vec<&UnitId>> = HashMap::new();
        for (id, unit) in candidates {
            for dep in &unit.descriptor.dependency_ids {
                dependents.entry(dep.as_str()).or_default().push(*id);
            }
        }

        let mut layers = Vec::new();
        loop {
            // BTreeMap iteration keeps each layer sorted by id
            let ready: Vec<&UnitId> = in_degree
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(&id, _)| id)
                .collect();

            if ready.is_empty() {
                break;
            }

            for id in &ready {
                in_degree.remove(*id);
                if let Some(children) = dependents.get(id.as_str()) {
                    for child in children {
                        if let Some(degree) = in_degree.get_mut(*child) {
                            *degree = degree.saturating_sub(1);
                        }
                    }
                }
            }

            layers.push(Layer {
                index: layers.len(),
                units: ready.into_iter().cloned().collect(),
            });
        }

        let unplaced = in_degree.into_keys().cloned().collect();
        (layers, unplaced)
    }

    /// Split leftover units into cycle members and units stuck behind a cycle
    fn classify_cycles(
        candidates: &BTreeMap<&UnitId, &RegisteredUnit>,
        unplaced: &BTreeSet<UnitId>,
        excluded: &mut BTreeMap<UnitId, PlanIssue>,
    ) {
        let mut graph = DiGraph::<&str, ()>::new();
        let mut index = HashMap::new();
        for id in unplaced {
            index.insert(id.as_str(), graph.add_node(id.as_str()));
        }
        for id in unplaced {
            let unit = candidates[id];
            for dep in &unit.descriptor.dependency_ids {
                if let Some(&dep_idx) = index.get(dep.as_str()) {
                    graph.add_edge(index[id.as_str()], dep_idx, ());
                }
            }
        }

        let mut in_cycle = BTreeSet::new();
        for component in tarjan_scc(&graph) {
            let self_loop = component.len() == 1
                && graph.contains_edge(component[0], component[0]);
            if component.len() < 2 && !self_loop {
                continue;
            }
            let members: BTreeSet<&str> = component.iter().map(|&n| graph[n]).collect();
            for &member in &members {
                let chain = Self::cycle_chain(member, &members, candidates);
                excluded.insert(member.to_string(), PlanIssue::Cycle { chain });
                in_cycle.insert(member.to_string());
            }
        }

        for id in unplaced {
            if in_cycle.contains(id) {
                continue;
            }
            let via: Vec<UnitId> = candidates[id]
                .descriptor
                .dependency_ids
                .iter()
                .filter(|dep| unplaced.contains(*dep))
                .cloned()
                .collect();
            excluded.insert(id.clone(), PlanIssue::BlockedByCycle { via });
        }
    }

    /// Shortest dependency path from `start` back to itself inside one
    /// strongly connected component. Breadth-first over ids in ascending
    /// order, so the chain is deterministic and always closes on `start`.
    fn cycle_chain(
        start: &str,
        members: &BTreeSet<&str>,
        candidates: &BTreeMap<&UnitId, &RegisteredUnit>,
    ) -> Vec<UnitId> {
        let deps_of: HashMap<&str, &BTreeSet<UnitId>> = candidates
            .iter()
            .filter(|(id, _)| members.contains(id.as_str()))
            .map(|(id, unit)| (id.as_str(), &unit.descriptor.dependency_ids))
            .collect();

        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut visited: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        visited.insert(start);
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            let Some(deps) = deps_of.get(current) else {
                continue;
            };
            for dep in deps.iter().map(String::as_str) {
                if !members.contains(dep) {
                    continue;
                }
                if dep == start {
                    let mut path = vec![current];
                    let mut node = current;
                    while node != start {
                        node = parent[node];
                        path.push(node);
                    }
                    let mut chain: Vec<UnitId> = path.into_iter().rev().map(str::to_string).collect();
                    chain.push(start.to_string());
                    return chain;
                }
                if visited.insert(dep) {
                    parent.insert(dep, current);
                    queue.push_back(dep);
                }
            }
        }

        vec![start.to_string()]
    }
}
