//! Directed code reference graph with forward and reverse adjacency.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::Address;

/// Control transfers (calls and jumps) between addresses.
///
/// Every edge lives in both `refs_from` and `refs_to`; `add_code_ref` is the
/// only way in, so the two maps can never disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeRefGraph {
    refs_from: BTreeMap<Address, BTreeSet<Address>>,
    refs_to: BTreeMap<Address, BTreeSet<Address>>,
    edge_count: usize,
}

impl CodeRefGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the edge `from -> to`. Returns false if it was already present.
    pub fn add_code_ref(&mut self, from: Address, to: Address) -> bool {
        if !self.refs_from.entry(from).or_default().insert(to) {
            return false;
        }
        self.refs_to.entry(to).or_default().insert(from);
        self.edge_count += 1;
        true
    }

    /// Addresses `address` transfers control to
    pub fn out_refs(&self, address: Address) -> impl Iterator<Item = Address> + '_ {
        self.refs_from
            .get(&address)
            .into_iter()
            .flat_map(|targets| targets.iter().copied())
    }

    /// Addresses that transfer control to `address`
    pub fn in_refs(&self, address: Address) -> impl Iterator<Item = Address> + '_ {
        self.refs_to
            .get(&address)
            .into_iter()
            .flat_map(|sources| sources.iter().copied())
    }

    pub fn contains(&self, from: Address, to: Address) -> bool {
        self.refs_from
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    /// All edges, ordered by source then target
    pub fn edges(&self) -> impl Iterator<Item = (Address, Address)> + '_ {
        self.refs_from
            .iter()
            .flat_map(|(&from, targets)| targets.iter().map(move |&to| (from, to)))
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn is_empty(&self) -> bool {
        self.edge_count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_are_symmetric() {
        let mut graph = CodeRefGraph::new();
        graph.add_code_ref(0x1000, 0x2000);
        graph.add_code_ref(0x1000, 0x3000);
        graph.add_code_ref(0x4000, 0x2000);

        assert_eq!(graph.out_refs(0x1000).collect::<Vec<_>>(), vec![0x2000, 0x3000]);
        assert_eq!(graph.in_refs(0x2000).collect::<Vec<_>>(), vec![0x1000, 0x4000]);
        for (from, to) in graph.edges() {
            assert!(graph.in_refs(to).any(|source| source == from));
        }
    }

    #[test]
    fn test_insertion_is_idempotent() {
        let mut graph = CodeRefGraph::new();

        assert!(graph.add_code_ref(0x10, 0x20));
        assert!(!graph.add_code_ref(0x10, 0x20));
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edges().count(), 1);
        assert_eq!(graph.in_refs(0x20).count(), 1);
    }

    #[test]
    fn test_unknown_address_has_no_neighbours() {
        let graph = CodeRefGraph::new();

        assert!(graph.is_empty());
        assert_eq!(graph.out_refs(0x10).count(), 0);
        assert_eq!(graph.in_refs(0x10).count(), 0);
        assert!(!graph.contains(0x10, 0x20));
    }

    #[test]
    fn test_self_edge() {
        let mut graph = CodeRefGraph::new();
        graph.add_code_ref(0x10, 0x10);

        assert!(graph.contains(0x10, 0x10));
        assert_eq!(graph.in_refs(0x10).collect::<Vec<_>>(), vec![0x10]);
    }
}
