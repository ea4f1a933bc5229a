//! Dependency graph derivation and structural validation.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{Error, Result};
use crate::sql::object_key;
use crate::unit::MigrationUnit;

/// Maps each unit (by ordinal) to the units it depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<u32, BTreeSet<u32>>,
}

impl DependencyGraph {
    /// Derive and validate the graph for an ordered set of units.
    ///
    /// `baseline` names objects that exist before the first unit runs.
    /// Fails with [`Error::Dependency`] on cycles, duplicate identities, or
    /// requirements nothing provides, and with [`Error::Order`] when a unit
    /// depends on a later one.
    pub fn build(units: &[MigrationUnit], baseline: &[String]) -> Result<Self> {
        check_identities(units)?;

        let baseline: HashSet<String> = baseline.iter().map(|o| object_key(o)).collect();

        // object -> ordinals of units creating it, ascending
        let mut providers: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for unit in units {
            for object in unit.created_objects() {
                providers
                    .entry(object_key(object))
                    .or_default()
                    .push(unit.ordinal());
            }
        }
        for list in providers.values_mut() {
            list.sort_unstable();
        }

        let mut graph = DependencyGraph::default();
        // Edge (unit, provider) -> object that induced it, for error reporting.
        let mut reasons: BTreeMap<(u32, u32), String> = BTreeMap::new();

        for unit in units {
            let deps = graph.edges.entry(unit.ordinal()).or_default();
            for required in unit.required_objects() {
                let key = object_key(required);
                let candidates: Vec<u32> = providers
                    .get(&key)
                    .map(|list| {
                        list.iter()
                            .copied()
                            .filter(|&o| o != unit.ordinal())
                            .collect()
                    })
                    .unwrap_or_default();

                let earlier = candidates.iter().copied().filter(|&o| o < unit.ordinal()).max();
                let later = candidates.iter().copied().filter(|&o| o > unit.ordinal()).min();

                let provider = match (earlier, later) {
                    (Some(o), _) => o,
                    (None, _) if baseline.contains(&key) => continue,
                    (None, Some(o)) => o,
                    (None, None) => {
                        let creates_itself = unit
                            .created_objects()
                            .iter()
                            .any(|c| object_key(c) == key);
                        let reason = if creates_itself {
                            format!("requires '{}' which only it creates", required)
                        } else {
                            format!("requires undeclared object '{}'", required)
                        };
                        return Err(Error::Dependency {
                            unit: unit.name().to_string(),
                            reason,
                        });
                    }
                };

                deps.insert(provider);
                reasons
                    .entry((unit.ordinal(), provider))
                    .or_insert_with(|| required.clone());
            }
        }

        let names: BTreeMap<u32, &str> = units.iter().map(|u| (u.ordinal(), u.name())).collect();

        if let Some(cycle) = graph.find_cycle() {
            let path: Vec<&str> = cycle
                .iter()
                .map(|o| names.get(o).copied().unwrap_or("?"))
                .collect();
            return Err(Error::Dependency {
                unit: path.first().copied().unwrap_or("?").to_string(),
                reason: format!("dependency cycle: {}", path.join(" -> ")),
            });
        }

        for (&unit, deps) in &graph.edges {
            if let Some(&provider) = deps.iter().find(|&&p| p > unit) {
                return Err(Error::Order {
                    unit: names.get(&unit).copied().unwrap_or("?").to_string(),
                    ordinal: unit,
                    object: reasons.get(&(unit, provider)).cloned().unwrap_or_default(),
                    provider: names.get(&provider).copied().unwrap_or("?").to_string(),
                    provider_ordinal: provider,
                });
            }
        }

        Ok(graph)
    }

    /// Ordinals of the units `ordinal` depends on.
    pub fn dependencies_of(&self, ordinal: u32) -> impl Iterator<Item = u32> + '_ {
        self.edges.get(&ordinal).into_iter().flatten().copied()
    }

    /// Ordinals of units that depend on `ordinal`.
    pub fn dependents_of(&self, ordinal: u32) -> Vec<u32> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.contains(&ordinal))
            .map(|(&unit, _)| unit)
            .collect()
    }

    /// Number of units in the graph.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no units.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Return one cycle as a closed path of ordinals, if any exists.
    fn find_cycle(&self) -> Option<Vec<u32>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            node: u32,
            marks: &mut BTreeMap<u32, Mark>,
            stack: &mut Vec<u32>,
        ) -> Option<Vec<u32>> {
            match marks.get(&node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|&n| n == node).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(node);
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            stack.push(node);
            for dep in graph.dependencies_of(node) {
                if let Some(cycle) = visit(graph, dep, marks, stack) {
                    return Some(cycle);
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for &node in self.edges.keys() {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(self, node, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }
}

fn check_identities(units: &[MigrationUnit]) -> Result<()> {
    let mut ordinals = HashSet::new();
    let mut names = HashSet::new();
    for unit in units {
        if !ordinals.insert(unit.ordinal()) {
            return Err(Error::Dependency {
                unit: unit.name().to_string(),
                reason: format!("duplicate ordinal {}", unit.ordinal()),
            });
        }
        if !names.insert(unit.name()) {
            return Err(Error::Dependency {
                unit: unit.name().to_string(),
                reason: "duplicate unit name".to_string(),
            });
        }
    }
    Ok(())
}
