//! Accumulator of waiters woken by notify
//!
//! Built incrementally while one transaction's notifies are processed, then
//! consumed once to tell each node which of its threads were woken.

use crate::context::ServerLockContext;
use std::collections::BTreeMap;
use tessera_core::NodeId;

/// Notified waiter contexts bucketed by destination node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifiedWaiters {
    by_node: BTreeMap<NodeId, Vec<ServerLockContext>>,
}

impl NotifiedWaiters {
    /// An empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one woken waiter
    pub fn add(&mut self, context: ServerLockContext) {
        let bucket = self.by_node.entry(context.node()).or_default();
        if !bucket.contains(&context) {
            bucket.push(context);
        }
    }

    /// Contexts woken on `node`, in notification order
    pub fn contexts_for(&self, node: &NodeId) -> &[ServerLockContext] {
        self.by_node.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with at least one woken waiter
    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.by_node.keys()
    }

    /// All woken contexts, grouped by node
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &[ServerLockContext])> {
        self.by_node.iter().map(|(n, v)| (n, v.as_slice()))
    }

    /// Total number of woken waiters
    pub fn len(&self) -> usize {
        self.by_node.values().map(Vec::len).sum()
    }

    /// True when nobody was woken
    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    /// Consume into the per-node map
    pub fn into_map(self) -> BTreeMap<NodeId, Vec<ServerLockContext>> {
        self.by_node
    }
}
