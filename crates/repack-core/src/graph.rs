//! Target dependency graph built from a request's kits.
//!
//! Building happens in three steps, each testable on its own:
//! 1. index every target and reject duplicate identities
//! 2. expand kit-level dependencies: every target of a dependency kit
//!    precedes every target of the dependent kit
//! 3. union explicit target-level edges, reject unknown references, and
//!    check the result is acyclic (reporting the full cycle when it is not)
//!
//! The topological order is a dispatch-priority hint only. The engine
//! recomputes readiness from statuses, never from a position in this order.

use crate::error::{Error, Result};
use crate::types::{Kit, KitTarget, RepackRequest, TargetId, ID_SEPARATOR};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// Validated DAG over all targets of a request. Nodes are indexed in declaration order.
#[derive(Debug, Clone)]
pub struct KitGraph {
    targets: Vec<KitTarget>,
    index: HashMap<TargetId, usize>,
    /// deps[i]: nodes that must be DONE before i runs. Sorted, no duplicates.
    deps: Vec<Vec<usize>>,
    /// dependents[i]: nodes that list i among their deps.
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl KitGraph {
    pub fn build(request: &RepackRequest) -> Result<Self> {
        Self::from_kits(&request.kits)
    }

    pub fn from_kits(kits: &[Kit]) -> Result<Self> {
        let mut seen_kits = HashSet::new();
        for kit in kits {
            if kit.name.is_empty() {
                return Err(Error::config("kit name must not be empty"));
            }
            if kit.name.contains(ID_SEPARATOR) {
                return Err(Error::config(format!(
                    "kit name '{}' must not contain '{ID_SEPARATOR}'",
                    kit.name
                )));
            }
            if !seen_kits.insert(kit.name.as_str()) {
                return Err(Error::config(format!("duplicate kit '{}'", kit.name)));
            }
        }

        let mut targets = Vec::new();
        let mut index = HashMap::new();
        for kit in kits {
            for target in &kit.targets {
                if target.id.kit() != kit.name {
                    return Err(Error::config(format!(
                        "target {} is declared inside kit '{}'",
                        target.id, kit.name
                    )));
                }
                if !target.id.is_well_formed() {
                    return Err(Error::config(format!(
                        "target name '{}' in kit '{}' is not a valid identity (empty, or clashes with '{ID_SEPARATOR}')",
                        target.id.target(),
                        kit.name
                    )));
                }
                if target.command.is_empty() {
                    return Err(Error::config(format!("target {} has an empty command", target.id)));
                }
                if index.insert(target.id.clone(), targets.len()).is_some() {
                    return Err(Error::config(format!("duplicate target {}", target.id)));
                }
                targets.push(target.clone());
            }
        }

        let mut deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); targets.len()];
        for (dependency, dependent) in expand_kit_dependencies(kits)? {
            deps[index[&dependent]].insert(index[&dependency]);
        }
        for (i, target) in targets.iter().enumerate() {
            for dep in &target.depends_on {
                let Some(&j) = index.get(dep) else {
                    return Err(Error::config(format!(
                        "target {} depends on unknown target {}",
                        target.id, dep
                    )));
                };
                deps[i].insert(j);
            }
        }
        let deps: Vec<Vec<usize>> = deps.into_iter().map(|d| d.into_iter().collect()).collect();

        if let Some(cycle) = find_cycle(&deps) {
            return Err(Error::CycleError {
                cycle: cycle.into_iter().map(|i| targets[i].id.clone()).collect(),
            });
        }

        let mut dependents = vec![Vec::new(); targets.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }
        let order = topological_order(&deps, &dependents);

        Ok(Self {
            targets,
            index,
            deps,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn target(&self, idx: usize) -> &KitTarget {
        &self.targets[idx]
    }

    pub fn targets(&self) -> &[KitTarget] {
        &self.targets
    }

    pub fn index_of(&self, id: &TargetId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Dependencies before dependents; ties broken by declaration order.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Every edge as `(dependency, dependent)`.
    pub fn edges(&self) -> impl Iterator<Item = (&TargetId, &TargetId)> + '_ {
        self.deps.iter().enumerate().flat_map(move |(i, ds)| {
            ds.iter()
                .map(move |&d| (&self.targets[d].id, &self.targets[i].id))
        })
    }
}

/// Broadcast kit-level dependencies to target pairs.
///
/// Returns `(dependency, dependent)` edges: for each kit K depending on kit D,
/// every target of D paired with every target of K. Explicit target-level
/// edges are not included.
pub fn expand_kit_dependencies(kits: &[Kit]) -> Result<Vec<(TargetId, TargetId)>> {
    let by_name: HashMap<&str, &Kit> = kits.iter().map(|k| (k.name.as_str(), k)).collect();
    let mut edges = Vec::new();
    for kit in kits {
        let mut seen = HashSet::new();
        for dep_name in &kit.depends_on_kits {
            if !seen.insert(dep_name.as_str()) {
                continue;
            }
            let Some(dep_kit) = by_name.get(dep_name.as_str()) else {
                return Err(Error::config(format!(
                    "kit '{}' depends on unknown kit '{}'",
                    kit.name, dep_name
                )));
            };
            for producer in &dep_kit.targets {
                for consumer in &kit.targets {
                    edges.push((producer.id.clone(), consumer.id.clone()));
                }
            }
        }
    }
    Ok(edges)
}

/// Depth-first search with an explicit recursion stack.
///
/// On a back-edge returns the cycle as node indices, first node repeated at
/// the end (`[a, b, a]`). Roots are tried in declaration order so the
/// reported cycle is deterministic.
fn find_cycle(deps: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Finished,
    }

    let mut mark = vec![Mark::Unvisited; deps.len()];
    // (node, next dependency to visit)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..deps.len() {
        if mark[root] != Mark::Unvisited {
            continue;
        }
        mark[root] = Mark::OnStack;
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let Some(&dep) = deps[node].get(frame.1) else {
                mark[node] = Mark::Finished;
                stack.pop();
                continue;
            };
            frame.1 += 1;
            match mark[dep] {
                Mark::Unvisited => {
                    mark[dep] = Mark::OnStack;
                    stack.push((dep, 0));
                }
                Mark::OnStack => {
                    let start = stack.iter().position(|&(n, _)| n == dep)?;
                    let mut cycle: Vec<usize> = stack[start..].iter().map(|&(n, _)| n).collect();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Mark::Finished => {}
            }
        }
    }
    None
}

/// Kahn's algorithm with a min-heap on declaration index for a stable order.
fn topological_order(deps: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut heap: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(deps.len());
    while let Some(Reverse(i)) = heap.pop() {
        order.push(i);
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                heap.push(Reverse(next));
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CommandSpec;

    fn kit(name: &str, targets: &[&str]) -> Kit {
        targets.iter().fold(Kit::new(name), |k, t| {
            k.target(t, CommandSpec::shell("true"), format!("out/{name}/{t}"))
        })
    }

    fn id(kit: &str, target: &str) -> TargetId {
        TargetId::new(kit, target)
    }

    #[test]
    fn kit_dependency_broadcasts_to_all_pairs() {
        let kits = vec![
            kit("Lib", &["ss", "ff"]),
            kit("Lef", &["ss", "ff"]).depends_on("Lib"),
        ];
        let edges = expand_kit_dependencies(&kits).unwrap();
        assert_eq!(edges.len(), 4);
        for producer in ["ss", "ff"] {
            for consumer in ["ss", "ff"] {
                assert!(edges.contains(&(id("Lib", producer), id("Lef", consumer))));
            }
        }
    }

    #[test]
    fn expansion_ignores_explicit_edges() {
        let a = Kit::new("A").target("x", CommandSpec::shell("true"), "x");
        let b = Kit::new("B").with_target(
            KitTarget::new("B", "y", CommandSpec::shell("true"), "y").after(id("A", "x")),
        );
        assert!(expand_kit_dependencies(&[a, b]).unwrap().is_empty());
    }

    #[test]
    fn unknown_kit_dependency_is_config_error() {
        let kits = vec![kit("A", &["x"]).depends_on("Missing")];
        let err = KitGraph::from_kits(&kits).unwrap_err();
        assert!(matches!(err, Error::ConfigError(ref m) if m.contains("Missing")));
    }

    #[test]
    fn duplicate_target_is_config_error() {
        let kits = vec![kit("A", &["x", "x"])];
        let err = KitGraph::from_kits(&kits).unwrap_err();
        assert!(matches!(err, Error::ConfigError(ref m) if m.contains("duplicate target A::x")));
    }

    #[test]
    fn duplicate_kit_is_config_error() {
        let kits = vec![kit("A", &["x"]), kit("A", &["y"])];
        assert!(matches!(
            KitGraph::from_kits(&kits),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn unknown_target_dependency_is_config_error() {
        let a = Kit::new("A").with_target(
            KitTarget::new("A", "x", CommandSpec::shell("true"), "x").after(id("B", "nope")),
        );
        let err = KitGraph::from_kits(&[a]).unwrap_err();
        assert!(matches!(err, Error::ConfigError(ref m) if m.contains("B::nope")));
    }

    #[test]
    fn two_node_cycle_reports_full_path() {
        let k = Kit::new("K")
            .with_target(KitTarget::new("K", "A", CommandSpec::shell("true"), "a").after(id("K", "B")))
            .with_target(KitTarget::new("K", "B", CommandSpec::shell("true"), "b").after(id("K", "A")));
        match KitGraph::from_kits(&[k]) {
            Err(Error::CycleError { cycle }) => {
                assert_eq!(cycle, vec![id("K", "A"), id("K", "B"), id("K", "A")]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn cycle_through_kit_dependencies() {
        let kits = vec![
            kit("A", &["x"]).depends_on("C"),
            kit("B", &["y"]).depends_on("A"),
            kit("C", &["z"]).depends_on("B"),
        ];
        match KitGraph::from_kits(&kits) {
            Err(Error::CycleError { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let k = Kit::new("K")
            .with_target(KitTarget::new("K", "A", CommandSpec::shell("true"), "a").after(id("K", "A")));
        match KitGraph::from_kits(&[k]) {
            Err(Error::CycleError { cycle }) => assert_eq!(cycle, vec![id("K", "A"), id("K", "A")]),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn order_respects_edges_and_declaration_ties() {
        let kits = vec![
            kit("B", &["b1", "b2"]).depends_on("A"),
            kit("A", &["a1"]),
            kit("C", &["c1"]),
        ];
        let graph = KitGraph::from_kits(&kits).unwrap();
        let names: Vec<String> = graph
            .topological_order()
            .iter()
            .map(|&i| graph.target(i).id.to_string())
            .collect();
        // B's targets are declared first, so they win ties once A::a1 is out.
        assert_eq!(names, vec!["A::a1", "B::b1", "B::b2", "C::c1"]);
    }

    #[test]
    fn dependents_mirror_dependencies() {
        let kits = vec![kit("A", &["a"]), kit("B", &["b"]).depends_on("A")];
        let graph = KitGraph::from_kits(&kits).unwrap();
        let a = graph.index_of(&id("A", "a")).unwrap();
        let b = graph.index_of(&id("B", "b")).unwrap();
        assert_eq!(graph.dependencies(b), &[a]);
        assert_eq!(graph.dependents(a), &[b]);
        assert_eq!(graph.edges().count(), 1);
    }

    #[test]
    fn separator_in_kit_name_is_config_error() {
        let kits = vec![kit("Lib::v2", &["synth"])];
        let err = KitGraph::from_kits(&kits).unwrap_err();
        assert!(matches!(err, Error::ConfigError(ref m) if m.contains("Lib::v2")));
    }

    #[test]
    fn empty_target_name_is_config_error() {
        let kits = vec![kit("K", &[""])];
        assert!(matches!(KitGraph::from_kits(&kits), Err(Error::ConfigError(_))));
    }

    #[test]
    fn names_that_merge_with_the_separator_are_rejected() {
        for (k, t) in [("A:", "b"), ("A", ":b"), ("A", "b::c")] {
            let kits = vec![kit(k, &[t])];
            assert!(
                matches!(KitGraph::from_kits(&kits), Err(Error::ConfigError(_))),
                "{k:?} / {t:?} should be rejected"
            );
        }
    }

    #[test]
    fn single_colons_inside_names_are_accepted() {
        let kits = vec![kit("lib:v2", &["synth:ss"])];
        assert_eq!(KitGraph::from_kits(&kits).unwrap().len(), 1);
    }

    #[test]
    fn empty_command_is_config_error() {
        let k = Kit::new("K").target("t", CommandSpec::shell(""), "t");
        assert!(matches!(KitGraph::from_kits(&[k]), Err(Error::ConfigError(_))));
    }
}
