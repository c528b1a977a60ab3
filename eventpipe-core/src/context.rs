//! Context snapshots
//!
//! Every tracked event is stamped with the id of the context that was current
//! when it was captured. The snapshot itself is looked up again at batch build
//! time, so an id must stay resolvable for as long as any queue still holds an
//! event tagged with it.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;

use crate::types::ContextId;

#[derive(Debug)]
struct Inner {
    current: ContextId,
    snapshots: HashMap<ContextId, Value>,
}

/// Current context id plus every snapshot still referenced.
#[derive(Debug)]
pub struct ContextStore {
    inner: RwLock<Inner>,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(Value::Object(Default::default()))
    }
}

impl ContextStore {
    /// Start with `initial` as the current context.
    pub fn new(initial: Value) -> Self {
        let current = ContextId::new();
        let mut snapshots = HashMap::new();
        snapshots.insert(current, initial);
        Self {
            inner: RwLock::new(Inner { current, snapshots }),
        }
    }

    pub fn current_id(&self) -> ContextId {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).current
    }

    /// Install a new snapshot and make it current. Returns the new id.
    pub fn update_context(&self, context: Value) -> ContextId {
        let id = ContextId::new();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.snapshots.insert(id, context);
        inner.current = id;
        tracing::debug!(context_id = %id, "Context updated");
        id
    }

    pub fn snapshot(&self, id: &ContextId) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshots
            .get(id)
            .cloned()
    }

    /// Drop snapshots not in `keep`. The current context is always kept.
    ///
    /// Returns the number of snapshots removed.
    pub fn prune<'a>(&self, keep: impl IntoIterator<Item = &'a ContextId>) -> usize {
        let mut keep: HashSet<ContextId> = keep.into_iter().copied().collect();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        keep.insert(inner.current);

        let before = inner.snapshots.len();
        inner.snapshots.retain(|id, _| keep.contains(id));
        before - inner.snapshots.len()
    }

    /// Number of snapshots held, including the current one.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
