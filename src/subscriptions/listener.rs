//! Listeners and the registries that hold them.

use crate::context::Context;
use crate::cursor::EnvelopesQuery;
use crate::types::{Envelope, NodeId, Topic};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

/// One batch handed to a listener.
pub type Delivery = Vec<Arc<Envelope>>;

/// Unique within a [`super::ListenerRegistry`].
pub type ListenerId = u64;

/// What a listener is registered under. Exactly one mode per listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerFilter {
    Global,
    Topics(HashSet<Topic>),
    Originators(HashSet<NodeId>),
}

impl ListenerFilter {
    /// Topics win over originators; neither means global.
    pub fn from_query(query: &EnvelopesQuery) -> Self {
        if !query.topics.is_empty() {
            ListenerFilter::Topics(query.topics.iter().cloned().collect())
        } else if !query.originators.is_empty() {
            ListenerFilter::Originators(query.originators.iter().copied().collect())
        } else {
            ListenerFilter::Global
        }
    }

    pub fn topics(topics: impl IntoIterator<Item = Topic>) -> Self {
        ListenerFilter::Topics(topics.into_iter().collect())
    }

    pub fn originators(originators: impl IntoIterator<Item = NodeId>) -> Self {
        ListenerFilter::Originators(originators.into_iter().collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// The channel is at capacity; the listener must be evicted.
    Full,
    /// Closed by us earlier, or the receiving side is gone.
    Closed,
}

pub struct Listener {
    id: ListenerId,
    ctx: Context,
    filter: ListenerFilter,
    /// `None` once closed; dropping it ends the receiver's stream.
    sender: Mutex<Option<Sender<Delivery>>>,
}

impl Listener {
    pub fn new(id: ListenerId, ctx: Context, filter: ListenerFilter, sender: Sender<Delivery>) -> Self {
        Self {
            id,
            ctx,
            filter,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn filter(&self) -> &ListenerFilter {
        &self.filter
    }

    /// The subscriber's scope has ended.
    pub fn is_cancelled(&self) -> bool {
        self.ctx.is_done()
    }

    /// Non-blocking send.
    pub fn try_deliver(&self, batch: Delivery) -> DeliveryOutcome {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return DeliveryOutcome::Closed;
        };
        match sender.try_send(batch) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(_)) => DeliveryOutcome::Full,
            Err(TrySendError::Disconnected(_)) => DeliveryOutcome::Closed,
        }
    }

    /// Close the channel. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Unordered set of listeners.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<HashMap<ListenerId, Arc<Listener>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, listener: Arc<Listener>) {
        self.listeners.write().insert(listener.id(), listener);
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Copy of the members, so delivery runs without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<Listener>> {
        self.listeners.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Listener sets keyed by topic or originator.
///
/// Adds and removes are serialized so a removal that empties a key can't
/// race an add into the set it is dropping.
pub struct ListenersMap<K> {
    data: RwLock<HashMap<K, Arc<ListenerSet>>>,
}

impl<K: Eq + Hash + Clone> ListenersMap<K> {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn add<'a>(&self, keys: impl IntoIterator<Item = &'a K>, listener: &Arc<Listener>)
    where
        K: 'a,
    {
        let mut data = self.data.write();
        for key in keys {
            data.entry(key.clone())
                .or_default()
                .insert(Arc::clone(listener));
        }
    }

    pub fn remove<'a>(&self, keys: impl IntoIterator<Item = &'a K>, id: ListenerId)
    where
        K: 'a,
    {
        let mut data = self.data.write();
        for key in keys {
            let Some(set) = data.get(key) else {
                continue;
            };
            set.remove(id);
            if set.is_empty() {
                data.remove(key);
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<ListenerSet>> {
        self.data.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<(K, Arc<ListenerSet>)> {
        self.data
            .read()
            .iter()
            .map(|(k, set)| (k.clone(), Arc::clone(set)))
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.data.read().contains_key(key)
    }
}

impl<K: Eq + Hash + Clone> Default for ListenersMap<K> {
    fn default() -> Self {
        Self::new()
    }
}
