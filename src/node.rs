//! Node wiring: one store, the background workers around it, and the
//! message service on top.

use crate::config::NodeConfig;
use crate::context::Context;
use crate::error::Result;
use crate::service::{
    AcceptAll, FeeCalculator, MessageService, NodeRegistry, PayloadValidator, PublishWorker, Signer,
};
use crate::storage::{EnvelopeStore, PartitionWorker};
use crate::subscriptions::SubscribeWorker;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info};

/// External services a node is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub signer: Arc<dyn Signer>,
    pub fees: Arc<dyn FeeCalculator>,
    pub registry: Arc<dyn NodeRegistry>,
    pub validator: Arc<dyn PayloadValidator>,
}

impl Collaborators {
    /// Collaborators that accept every payload.
    pub fn new(
        signer: Arc<dyn Signer>,
        fees: Arc<dyn FeeCalculator>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        Self {
            signer,
            fees,
            registry,
            validator: Arc::new(AcceptAll),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = validator;
        self
    }
}

/// A running node. Dropping it cancels every worker; [`Node::shutdown`]
/// also waits for them.
pub struct Node {
    ctx: Context,
    store: Arc<EnvelopeStore>,
    service: Arc<MessageService>,
    partition_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    pub fn start(config: NodeConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let ctx = Context::background();
        // Cancels whatever already started if a later step fails.
        let guard = ctx.cancel_on_drop();

        let store = Arc::new(EnvelopeStore::open_or_create(config.store.clone())?);
        info!(
            path = %store.path().display(),
            node = collaborators.signer.node_id(),
            "starting node"
        );

        let partition_worker =
            PartitionWorker::new(Arc::clone(&store), config.partitions.clone()).start(ctx.child())?;

        let subscriber = Arc::new(SubscribeWorker::start(
            &ctx,
            Arc::clone(&store),
            Arc::clone(&collaborators.registry),
            &config.subscribe,
        )?);

        let publisher = Arc::new(PublishWorker::start(
            &ctx,
            Arc::clone(&store),
            Arc::clone(&collaborators.signer),
            collaborators.fees,
            config.publish.clone(),
        )?);

        let service = Arc::new(MessageService::new(
            ctx.clone(),
            Arc::clone(&store),
            collaborators.signer,
            collaborators.registry,
            collaborators.validator,
            publisher,
            subscriber,
            config.subscribe,
            config.publish,
        ));

        guard.disarm();
        Ok(Self {
            ctx,
            store,
            service,
            partition_worker: Mutex::new(Some(partition_worker)),
        })
    }

    pub fn service(&self) -> &Arc<MessageService> {
        &self.service
    }

    pub fn store(&self) -> &Arc<EnvelopeStore> {
        &self.store
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Stop every worker and wait for them. Open subscription streams end
    /// cleanly. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.ctx.cancel();
        self.service.publisher().join();
        self.service.subscriber().join();
        if let Some(handle) = self.partition_worker.lock().take() {
            if handle.join().is_err() {
                error!("partition worker thread panicked");
            }
        }
        self.store.sync()?;
        info!("node stopped");
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}
