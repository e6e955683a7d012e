//! Directed routing graph over peer identifiers.
//!
//! An edge `a → b` means "MIDI received from `a` is forwarded to `b`".
//! The router adds edges when it takes routing decisions and walks the
//! outgoing edges of a peer on every message it emits. Duplicate edges are
//! allowed (it is a multigraph); a peer forwarding to itself is never
//! useful, so self-loops are dropped on insert.

use std::collections::HashMap;

/// Stable identifier for any routable peer: local port, outbound client,
/// inbound server connection or export server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

#[derive(Debug, Default)]
pub struct PeerGraph {
    edges: HashMap<PeerId, Vec<PeerId>>,
}

impl PeerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `from → to`. Self-loops are silently dropped.
    pub fn add_edge(&mut self, from: PeerId, to: PeerId) {
        if from == to {
            tracing::debug!(peer = from.0, "dropping self-loop edge");
            return;
        }
        self.edges.entry(from).or_default().push(to);
    }

    /// Outgoing edges of `from`. Empty when the peer has none.
    pub fn targets(&self, from: PeerId) -> &[PeerId] {
        self.edges.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove `peer` both as a source and as a target of every edge.
    pub fn remove_peer(&mut self, peer: PeerId) {
        self.edges.remove(&peer);
        for targets in self.edges.values_mut() {
            targets.retain(|t| *t != peer);
        }
        self.edges.retain(|_, targets| !targets.is_empty());
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_drive_targets() {
        let mut graph = PeerGraph::new();
        graph.add_edge(PeerId(1), PeerId(2));
        graph.add_edge(PeerId(1), PeerId(3));
        assert_eq!(graph.targets(PeerId(1)), &[PeerId(2), PeerId(3)]);
        assert!(graph.targets(PeerId(2)).is_empty());
    }

    #[test]
    fn self_loops_dropped() {
        let mut graph = PeerGraph::new();
        graph.add_edge(PeerId(1), PeerId(1));
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.targets(PeerId(1)).is_empty());
    }

    #[test]
    fn multigraph_keeps_duplicate_edges() {
        let mut graph = PeerGraph::new();
        graph.add_edge(PeerId(1), PeerId(2));
        graph.add_edge(PeerId(1), PeerId(2));
        assert_eq!(graph.targets(PeerId(1)), &[PeerId(2), PeerId(2)]);
    }

    #[test]
    fn remove_peer_clears_both_directions() {
        let mut graph = PeerGraph::new();
        graph.add_edge(PeerId(1), PeerId(2));
        graph.add_edge(PeerId(2), PeerId(1));
        graph.add_edge(PeerId(3), PeerId(2));
        graph.remove_peer(PeerId(2));
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.targets(PeerId(1)).is_empty());
        assert!(graph.targets(PeerId(3)).is_empty());
    }
}
