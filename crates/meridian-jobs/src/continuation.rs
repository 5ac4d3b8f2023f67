//! Parent/child continuation edges.
//!
//! The graph is plain data owned by a job store so that "parent
//! succeeded" and "children released" change inside the same transaction.
//! Every child has at most one parent, so the edges form a forest.

use crate::job::JobId;
use std::collections::HashMap;

/// Parent -> children edges with child -> parent back-edges.
#[derive(Debug, Default, Clone)]
pub struct ContinuationGraph {
    children: HashMap<JobId, Vec<JobId>>,
    parents: HashMap<JobId, JobId>,
}

impl ContinuationGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if linking `child` under `parent` would close a cycle,
    /// i.e. `child` is `parent` or one of its ancestors.
    pub fn would_cycle(&self, parent: &JobId, child: &JobId) -> bool {
        let mut current = Some(parent);
        while let Some(id) = current {
            if id == child {
                return true;
            }
            current = self.parents.get(id);
        }
        false
    }

    /// Records the edge. Callers check `would_cycle` and existing parents
    /// first.
    pub fn link(&mut self, parent: &JobId, child: &JobId) {
        self.children
            .entry(parent.clone())
            .or_default()
            .push(child.clone());
        self.parents.insert(child.clone(), parent.clone());
    }

    /// Direct children of `parent`, in link order.
    pub fn children_of(&self, parent: &JobId) -> &[JobId] {
        self.children.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Parent of `child`, if it is a continuation.
    pub fn parent_of(&self, child: &JobId) -> Option<&JobId> {
        self.parents.get(child)
    }

    /// Number of parents with at least one child.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Returns true if no edges are recorded.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
