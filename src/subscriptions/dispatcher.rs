//! Live delivery: per-originator polling merged into one stream and
//! dispatched to registered listeners.

use super::funnel::Funnel;
use super::listener::{
    Delivery, DeliveryOutcome, Listener, ListenerFilter, ListenerId, ListenerSet, ListenersMap,
};
use super::poll::{PollingOptions, PollingSubscription};
use crate::config::SubscribeConfig;
use crate::context::Context;
use crate::cursor::VectorClock;
use crate::error::{Error, Result};
use crate::service::NodeRegistry;
use crate::storage::EnvelopeStore;
use crate::types::{Envelope, NodeId, SequenceId, Topic};
use crossbeam_channel::{bounded, never, select, Receiver};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Registry sizes, for monitoring and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenerCounts {
    pub global: usize,
    pub topics: usize,
    pub originators: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: usize,
    pub evicted: usize,
}

/// Listeners grouped by how they filter, and the dispatch over them.
///
/// Delivery never blocks: a listener whose channel is full, whose receiver
/// is gone, or whose context is done is closed and removed in the same pass.
pub struct ListenerRegistry {
    next_id: AtomicU64,
    closed: AtomicBool,
    globals: ListenerSet,
    by_topic: ListenersMap<Topic>,
    by_originator: ListenersMap<NodeId>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            globals: ListenerSet::new(),
            by_topic: ListenersMap::new(),
            by_originator: ListenersMap::new(),
        }
    }

    /// Register a listener and return its stream of deliveries.
    ///
    /// The stream ends when the listener is evicted or the registry closes.
    pub fn listen(&self, ctx: &Context, filter: ListenerFilter, buffer: usize) -> Receiver<Delivery> {
        let (sender, receiver) = bounded(buffer.max(1));
        if self.closed.load(Ordering::SeqCst) {
            return receiver;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let listener = Arc::new(Listener::new(id, ctx.clone(), filter, sender));
        match listener.filter() {
            ListenerFilter::Global => self.globals.insert(Arc::clone(&listener)),
            ListenerFilter::Topics(topics) => self.by_topic.add(topics, &listener),
            ListenerFilter::Originators(originators) => {
                self.by_originator.add(originators, &listener)
            }
        }
        debug!(listener = id, filter = ?listener.filter(), "listener registered");

        // Lost a race with close_all.
        if self.closed.load(Ordering::SeqCst) {
            self.evict(&listener);
        }
        receiver
    }

    /// Deliver one batch. Originator listeners get the envelopes of their
    /// originators, topic listeners get each matching envelope on its own,
    /// global listeners get the whole batch.
    pub fn dispatch(&self, batch: &[Arc<Envelope>]) -> DispatchStats {
        let mut stats = DispatchStats::default();
        if batch.is_empty() {
            return stats;
        }
        let mut evicted: HashMap<ListenerId, Arc<Listener>> = HashMap::new();

        for (originator, listeners) in self.by_originator.snapshot() {
            let filtered: Delivery = batch
                .iter()
                .filter(|env| env.originator_id == originator)
                .cloned()
                .collect();
            if !filtered.is_empty() {
                self.deliver(&listeners, &filtered, &mut stats, &mut evicted);
            }
        }

        for env in batch {
            if let Some(listeners) = self.by_topic.get(&env.topic) {
                self.deliver(&listeners, &[Arc::clone(env)], &mut stats, &mut evicted);
            }
        }

        self.deliver(&self.globals, batch, &mut stats, &mut evicted);

        for listener in evicted.values() {
            self.evict(listener);
        }
        stats.evicted = evicted.len();
        trace!(envelopes = batch.len(), delivered = stats.delivered, evicted = stats.evicted, "dispatched batch");
        stats
    }

    fn deliver(
        &self,
        listeners: &ListenerSet,
        envelopes: &[Arc<Envelope>],
        stats: &mut DispatchStats,
        evicted: &mut HashMap<ListenerId, Arc<Listener>>,
    ) {
        for listener in listeners.snapshot() {
            if evicted.contains_key(&listener.id()) || listener.is_closed() {
                continue;
            }
            if listener.is_cancelled() {
                debug!(listener = listener.id(), "stream closed, removing listener");
                listener.close();
                evicted.insert(listener.id(), listener);
                continue;
            }
            match listener.try_deliver(envelopes.to_vec()) {
                DeliveryOutcome::Delivered => stats.delivered += 1,
                DeliveryOutcome::Full => {
                    debug!(listener = listener.id(), "channel full, removing listener");
                    listener.close();
                    evicted.insert(listener.id(), listener);
                }
                DeliveryOutcome::Closed => {
                    debug!(listener = listener.id(), "receiver gone, removing listener");
                    listener.close();
                    evicted.insert(listener.id(), listener);
                }
            }
        }
    }

    /// Close a listener and drop it from whichever registry holds it.
    fn evict(&self, listener: &Listener) {
        listener.close();
        match listener.filter() {
            ListenerFilter::Global => {
                self.globals.remove(listener.id());
            }
            ListenerFilter::Topics(topics) => self.by_topic.remove(topics, listener.id()),
            ListenerFilter::Originators(originators) => {
                self.by_originator.remove(originators, listener.id())
            }
        }
    }

    /// Close every listener and refuse new ones.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let mut all: HashMap<ListenerId, Arc<Listener>> = HashMap::new();
        for listener in self.globals.snapshot() {
            all.insert(listener.id(), listener);
        }
        for (_, set) in self.by_topic.snapshot() {
            all.extend(set.snapshot().into_iter().map(|l| (l.id(), l)));
        }
        for (_, set) in self.by_originator.snapshot() {
            all.extend(set.snapshot().into_iter().map(|l| (l.id(), l)));
        }
        for listener in all.values() {
            self.evict(listener);
        }
        info!(closed = all.len(), "listener registry closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn counts(&self) -> ListenerCounts {
        ListenerCounts {
            global: self.globals.len(),
            topics: self.by_topic.key_count(),
            originators: self.by_originator.key_count(),
        }
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One polling subscription per originator, merged through a [`Funnel`].
pub struct OriginatorPollers {
    ctx: Context,
    store: Arc<EnvelopeStore>,
    interval: Duration,
    page_size: usize,
    /// How far each originator's poller has read; a re-added poller resumes here.
    progress: Arc<Mutex<VectorClock>>,
    pollers: Mutex<HashMap<NodeId, Context>>,
    funnel: Funnel<Delivery>,
}

impl OriginatorPollers {
    pub fn new(
        ctx: Context,
        store: Arc<EnvelopeStore>,
        start: VectorClock,
        interval: Duration,
        page_size: usize,
    ) -> Self {
        Self {
            ctx,
            store,
            interval,
            page_size,
            progress: Arc::new(Mutex::new(start)),
            pollers: Mutex::new(HashMap::new()),
            funnel: Funnel::new(),
        }
    }

    /// Start polling `originator`. Returns `false` if it is already polled.
    pub fn add(&self, originator: NodeId) -> Result<bool> {
        let mut pollers = self.pollers.lock();
        if pollers.contains_key(&originator) || self.ctx.is_done() {
            return Ok(false);
        }

        let child = self.ctx.child();
        let cursor = self.progress.lock().get(originator);
        let store = Arc::clone(&self.store);
        let progress = Arc::clone(&self.progress);
        let query = move |last: &SequenceId, limit: usize| -> Result<(Delivery, SequenceId)> {
            let rows = store.select_by_originator(originator, *last, limit)?;
            let mut next = *last;
            for env in &rows {
                if env.sequence_id < next {
                    error!(
                        originator,
                        sequence = env.sequence_id,
                        last = next,
                        "system invariant broken: unsorted envelope stream"
                    );
                    return Err(Error::InvariantViolation(format!(
                        "unsorted envelope stream for originator {}: {} after {}",
                        originator, env.sequence_id, next
                    )));
                }
                next = env.sequence_id;
            }
            progress.lock().advance(originator, next);
            Ok((rows, next))
        };

        let options = PollingOptions::new(self.interval, self.page_size)
            .with_notifier(self.store.commit_notifier());
        let output = PollingSubscription::new(
            child.clone(),
            format!("originator-{}", originator),
            query,
            cursor,
            options,
        )
        .start()?;

        if !self.funnel.add_channel(output) {
            child.cancel();
            return Ok(false);
        }
        pollers.insert(originator, child);
        debug!(originator, cursor, "originator poller started");
        Ok(true)
    }

    /// Stop polling `originator`. Returns `false` if it wasn't polled.
    pub fn remove(&self, originator: NodeId) -> bool {
        match self.pollers.lock().remove(&originator) {
            Some(ctx) => {
                ctx.cancel();
                debug!(originator, "originator poller stopped");
                true
            }
            None => false,
        }
    }

    pub fn originators(&self) -> Vec<NodeId> {
        let mut originators: Vec<_> = self.pollers.lock().keys().copied().collect();
        originators.sort_unstable();
        originators
    }

    /// Merged stream of every poller.
    pub fn output(&self) -> Receiver<Delivery> {
        self.funnel.output()
    }

    /// Stop every poller and wait for the forwarders feeding the merged stream.
    ///
    /// Items not yet taken from [`OriginatorPollers::output`] are dropped.
    pub fn close(&self) {
        for (_, ctx) in self.pollers.lock().drain() {
            ctx.cancel();
        }
        self.funnel.shutdown();
    }
}

enum Membership {
    Stop,
    Added(Vec<NodeId>),
    Removed(Vec<NodeId>),
    AddedClosed,
    RemovedClosed,
}

/// Owns the live-delivery pipeline of a node.
pub struct SubscribeWorker {
    listeners: Arc<ListenerRegistry>,
    pollers: Arc<OriginatorPollers>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SubscribeWorker {
    /// Start polling every known originator from the store's current vector
    /// clock, and follow registry membership changes.
    pub fn start(
        ctx: &Context,
        store: Arc<EnvelopeStore>,
        registry: Arc<dyn NodeRegistry>,
        config: &SubscribeConfig,
    ) -> Result<Self> {
        info!("starting subscribe worker");
        let start = store.vector_clock();

        let mut originators: HashSet<NodeId> = start.originators().collect();
        originators.extend(registry.originator_ids()?);

        let pollers = Arc::new(OriginatorPollers::new(
            ctx.clone(),
            store,
            start,
            config.poll_interval(),
            config.poll_page_size,
        ));
        for originator in originators {
            pollers.add(originator)?;
        }

        let listeners = Arc::new(ListenerRegistry::new());
        let dispatch = Self::spawn_dispatch(ctx.clone(), Arc::clone(&listeners), Arc::clone(&pollers))?;
        let membership = Self::spawn_membership(ctx.clone(), registry, Arc::clone(&pollers))?;

        debug!(originators = ?pollers.originators(), "subscribe worker started");
        Ok(Self {
            listeners,
            pollers,
            handles: Mutex::new(vec![dispatch, membership]),
        })
    }

    fn spawn_dispatch(
        ctx: Context,
        listeners: Arc<ListenerRegistry>,
        pollers: Arc<OriginatorPollers>,
    ) -> Result<JoinHandle<()>> {
        let merged = pollers.output();
        let handle = thread::Builder::new()
            .name("subscribe-dispatch".into())
            .spawn(move || {
                let done = ctx.done().clone();
                loop {
                    let batch = select! {
                        recv(done) -> _ => None,
                        recv(merged) -> batch => match batch {
                            Ok(batch) => Some(batch),
                            Err(_) => {
                                error!("merged originator stream closed");
                                None
                            }
                        },
                    };
                    match batch {
                        Some(batch) => {
                            listeners.dispatch(&batch);
                        }
                        None => break,
                    }
                }
                listeners.close_all();
                pollers.close();
                debug!("subscribe dispatch stopped");
            })?;
        Ok(handle)
    }

    fn spawn_membership(
        ctx: Context,
        registry: Arc<dyn NodeRegistry>,
        pollers: Arc<OriginatorPollers>,
    ) -> Result<JoinHandle<()>> {
        let mut added = registry.on_new_nodes();
        let mut removed = registry.on_removed_nodes();
        let handle = thread::Builder::new()
            .name("subscribe-membership".into())
            .spawn(move || {
                let done = ctx.done().clone();
                loop {
                    let change = select! {
                        recv(done) -> _ => Membership::Stop,
                        recv(added) -> nodes => nodes.map_or(Membership::AddedClosed, Membership::Added),
                        recv(removed) -> nodes => nodes.map_or(Membership::RemovedClosed, Membership::Removed),
                    };
                    match change {
                        Membership::Stop => break,
                        Membership::Added(nodes) => {
                            for node in nodes {
                                if let Err(e) = pollers.add(node) {
                                    warn!(originator = node, error = %e, "failed to start originator poller");
                                }
                            }
                        }
                        Membership::Removed(nodes) => {
                            for node in nodes {
                                pollers.remove(node);
                            }
                        }
                        Membership::AddedClosed => added = never(),
                        Membership::RemovedClosed => removed = never(),
                    }
                }
            })?;
        Ok(handle)
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    pub fn pollers(&self) -> &Arc<OriginatorPollers> {
        &self.pollers
    }

    /// Register a live listener. See [`ListenerRegistry::listen`].
    pub fn listen(&self, ctx: &Context, filter: ListenerFilter, buffer: usize) -> Receiver<Delivery> {
        self.listeners.listen(ctx, filter, buffer)
    }

    /// Wait for the worker threads; call after cancelling the context.
    pub fn join(&self) {
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("subscribe worker thread panicked");
            }
        }
    }
}
