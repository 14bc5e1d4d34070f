//! Dependency graph over complete migrations.
//!
//! An edge `A -> B` means B depends on A, so A must be applied first.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use super::definitions::{Migration, Version};
use crate::error::DependencyError;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    depends_on: Vec<Version>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Visiting,
    Visited,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeMap<Version, Node>,
    dependents: BTreeMap<Version, BTreeSet<Version>>,
}

impl DependencyGraph {
    /// Build the graph, failing on the first reference to an unknown version.
    ///
    /// Migrations are visited in ascending version order, so the reported
    /// error is deterministic.
    pub fn build<'a, I>(migrations: I) -> Result<Self, DependencyError>
    where
        I: IntoIterator<Item = &'a Migration>,
    {
        let mut graph = Self::default();
        for migration in migrations {
            let mut depends_on = Vec::with_capacity(migration.depends_on.len());
            for dependency in &migration.depends_on {
                if !depends_on.contains(dependency) {
                    depends_on.push(*dependency);
                }
            }
            graph.nodes.insert(
                migration.version,
                Node {
                    name: migration.name.clone(),
                    depends_on,
                },
            );
            graph.dependents.entry(migration.version).or_default();
        }

        for (version, node) in &graph.nodes {
            for dependency in &node.depends_on {
                if !graph.nodes.contains_key(dependency) {
                    return Err(DependencyError::Unknown {
                        migration: *version,
                        missing: *dependency,
                    });
                }
            }
        }

        for (version, node) in &graph.nodes {
            for dependency in &node.depends_on {
                graph
                    .dependents
                    .entry(*dependency)
                    .or_default()
                    .insert(*version);
            }
        }

        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, version: Version) -> bool {
        self.nodes.contains_key(&version)
    }

    pub fn versions(&self) -> impl Iterator<Item = Version> + '_ {
        self.nodes.keys().copied()
    }

    pub fn name(&self, version: Version) -> Option<&str> {
        self.nodes.get(&version).map(|n| n.name.as_str())
    }

    pub fn dependencies(&self, version: Version) -> &[Version] {
        self.nodes
            .get(&version)
            .map(|n| n.depends_on.as_slice())
            .unwrap_or_default()
    }

    /// Migrations that declare a dependency on `version`, ascending
    pub fn dependents(&self, version: Version) -> Vec<Version> {
        self.dependents
            .get(&version)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every cycle reachable by depth-first search, each as a closed chain in
    /// apply direction (`[a, b, a]` when b depends on a and a on b).
    pub fn detect_cycles(&self) -> Vec<Vec<Version>> {
        let mut colors: HashMap<Version, Color> = HashMap::new();
        let mut stack = Vec::new();
        let mut cycles = Vec::new();

        for version in self.nodes.keys() {
            if !colors.contains_key(version) {
                self.visit(*version, &mut colors, &mut stack, &mut cycles);
            }
        }

        cycles
    }

    fn visit(
        &self,
        version: Version,
        colors: &mut HashMap<Version, Color>,
        stack: &mut Vec<Version>,
        cycles: &mut Vec<Vec<Version>>,
    ) {
        colors.insert(version, Color::Visiting);
        stack.push(version);

        for next in self.dependents(version) {
            match colors.get(&next) {
                None => self.visit(next, colors, stack, cycles),
                Some(Color::Visiting) => {
                    if let Some(start) = stack.iter().position(|v| *v == next) {
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next);
                        cycles.push(cycle);
                    }
                }
                Some(Color::Visited) => {}
            }
        }

        stack.pop();
        colors.insert(version, Color::Visited);
    }

    /// Fail with the first detected cycle, if any
    pub fn ensure_acyclic(&self) -> Result<(), DependencyError> {
        match self.detect_cycles().into_iter().next() {
            Some(cycle) => Err(DependencyError::Cycle { cycle }),
            None => Ok(()),
        }
    }

    /// Kahn's algorithm with ties broken by ascending version.
    pub fn topological_order(&self) -> Result<Vec<Version>, DependencyError> {
        let mut in_degree: HashMap<Version, usize> = self
            .nodes
            .iter()
            .map(|(version, node)| (*version, node.depends_on.len()))
            .collect();

        let mut ready: BinaryHeap<Reverse<Version>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(version, _)| Reverse(*version))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(version)) = ready.pop() {
            order.push(version);
            for dependent in self.dependents(version) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(dependent));
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            self.ensure_acyclic()?;
        }

        Ok(order)
    }

    /// Exact reverse of [`topological_order`](Self::topological_order)
    pub fn rollback_order(&self) -> Result<Vec<Version>, DependencyError> {
        let mut order = self.topological_order()?;
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn migration(version: i64, deps: &[i64]) -> Migration {
        Migration::new(Version::new(version), format!("m{}", version))
            .with_up("up", "SELECT 1;")
            .with_down("down", "SELECT 1;")
            .with_dependencies(deps.iter().map(|d| Version::new(*d)).collect())
    }

    fn versions(order: &[Version]) -> Vec<i64> {
        order.iter().map(|v| v.as_i64()).collect()
    }

    #[test]
    fn test_independent_migrations_apply_in_version_order() {
        let ms = vec![migration(3, &[]), migration(1, &[]), migration(2, &[])];
        let graph = DependencyGraph::build(&ms).unwrap();
        assert_eq!(versions(&graph.topological_order().unwrap()), vec![1, 2, 3]);
        assert_eq!(versions(&graph.rollback_order().unwrap()), vec![3, 2, 1]);
    }

    #[test]
    fn test_dependency_overrides_version_order() {
        // 1 depends on 3, so 3 must come first; 2 is free and sorts by version
        let ms = vec![migration(1, &[3]), migration(2, &[]), migration(3, &[])];
        let graph = DependencyGraph::build(&ms).unwrap();
        assert_eq!(versions(&graph.topological_order().unwrap()), vec![2, 3, 1]);
    }

    #[test]
    fn test_diamond() {
        let ms = vec![
            migration(1, &[]),
            migration(2, &[1]),
            migration(3, &[1]),
            migration(4, &[2, 3]),
            migration(5, &[]),
        ];
        let graph = DependencyGraph::build(&ms).unwrap();
        assert_eq!(versions(&graph.topological_order().unwrap()), vec![1, 2, 3, 4, 5]);
        assert_eq!(versions(&graph.dependents(Version::new(1))), vec![2, 3]);
        assert_eq!(versions(graph.dependencies(Version::new(4))), vec![2, 3]);
    }

    #[test]
    fn test_unknown_dependency_names_both_sides() {
        let ms = vec![migration(20250101000000, &[99999999999999])];
        let err = DependencyGraph::build(&ms).unwrap_err();
        match &err {
            DependencyError::Unknown { migration, missing } => {
                assert_eq!(migration.as_i64(), 20250101000000);
                assert_eq!(missing.as_i64(), 99999999999999);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("depends on unknown migration 99999999999999"));
    }

    #[test]
    fn test_cycle_is_detected() {
        let ms = vec![migration(1, &[3]), migration(2, &[1]), migration(3, &[2]), migration(4, &[])];
        let graph = DependencyGraph::build(&ms).unwrap();

        let cycles = graph.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(versions(&cycles[0]), vec![1, 2, 3, 1]);

        let err = graph.topological_order().unwrap_err();
        assert!(matches!(err, DependencyError::Cycle { .. }));
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let ms = vec![migration(1, &[1])];
        let graph = DependencyGraph::build(&ms).unwrap();
        assert_eq!(versions(&graph.detect_cycles()[0]), vec![1, 1]);
        assert!(graph.ensure_acyclic().is_err());
    }

    fn acyclic_graph() -> impl Strategy<Value = Vec<Migration>> {
        (1usize..30).prop_flat_map(|n| {
            prop::collection::vec(prop::collection::vec(any::<prop::sample::Index>(), 0..4), n)
                .prop_map(move |picks| {
                    // Versions are shuffled relative to position so dependencies
                    // can point at both lower and higher versions.
                    let ids: Vec<i64> = (0..n as i64).map(|i| (i * 7919) % 1009 + 1).collect();
                    picks
                        .iter()
                        .enumerate()
                        .map(|(i, deps)| {
                            let deps: Vec<i64> = if i == 0 {
                                Vec::new()
                            } else {
                                deps.iter().map(|d| ids[d.index(i)]).collect()
                            };
                            migration(ids[i], &deps)
                        })
                        .collect()
                })
        })
    }

    proptest! {
        #[test]
        fn prop_order_respects_dependencies(ms in acyclic_graph()) {
            let graph = DependencyGraph::build(&ms).unwrap();
            let order = graph.topological_order().unwrap();
            prop_assert_eq!(order.len(), ms.len());

            let position: HashMap<Version, usize> =
                order.iter().enumerate().map(|(i, v)| (*v, i)).collect();
            for m in &ms {
                for dep in &m.depends_on {
                    prop_assert!(position[dep] < position[&m.version]);
                }
            }
        }

        #[test]
        fn prop_ready_ties_break_by_version(ms in acyclic_graph()) {
            let graph = DependencyGraph::build(&ms).unwrap();
            let order = graph.topological_order().unwrap();

            // Replaying the order, each pick must be the smallest version whose
            // dependencies were already placed.
            let mut placed = BTreeSet::new();
            for chosen in &order {
                let smallest_ready = graph
                    .versions()
                    .filter(|v| !placed.contains(v))
                    .find(|v| graph.dependencies(*v).iter().all(|d| placed.contains(d)));
                prop_assert_eq!(smallest_ready, Some(*chosen));
                placed.insert(*chosen);
            }
        }

        #[test]
        fn prop_cycle_always_detected(ms in acyclic_graph(), pick in any::<prop::sample::Index>()) {
            prop_assume!(ms.len() > 1);
            // Tie the first migration and a later one together in both directions
            let mut ms = ms;
            let k = pick.index(ms.len() - 1) + 1;
            let first = ms[0].version;
            let other = ms[k].version;
            if !ms[k].depends_on.contains(&first) {
                ms[k].depends_on.push(first);
            }
            ms[0].depends_on.push(other);

            let graph = DependencyGraph::build(&ms).unwrap();
            let cycles = graph.detect_cycles();
            prop_assert!(!cycles.is_empty());
            for cycle in &cycles {
                prop_assert_eq!(cycle.first(), cycle.last());
            }
            prop_assert!(graph.topological_order().is_err());
        }
    }
}
