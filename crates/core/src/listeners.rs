//! Listener registry
//!
//! Listeners subscribe once and get a [`SubscriptionId`] back; removing them
//! is a keyed O(1) removal. Notification iterates a snapshot taken under the
//! read lock, so listeners may subscribe or unsubscribe from inside a
//! callback.

use crate::ids::SubscriptionId;
use crate::sequence::Sequence;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Id-keyed set of listeners of type `L`
pub struct ListenerRegistry<L: ?Sized> {
    listeners: RwLock<FxHashMap<SubscriptionId, Arc<L>>>,
    ids: Sequence,
}

impl<L: ?Sized> ListenerRegistry<L> {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(FxHashMap::default()),
            ids: Sequence::new(),
        }
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<L>) -> SubscriptionId {
        let id = SubscriptionId::new(self.ids.next_value());
        self.listeners.write().insert(id, listener);
        id
    }

    /// Remove a listener; false if the id was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// True when nobody is subscribed
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Call `f` once for every listener registered at the time of the call
    ///
    /// Listeners are visited in subscription order.
    pub fn for_each(&self, mut f: impl FnMut(&L)) {
        let mut snapshot: Vec<(SubscriptionId, Arc<L>)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();
        snapshot.sort_by_key(|(id, _)| *id);
        for (_, listener) in snapshot {
            f(listener.as_ref());
        }
    }
}

impl<L: ?Sized> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}
