//! Interfaces the node consumes from the outside world, plus small
//! in-process implementations.

use crate::error::{Error, Result};
use crate::types::{
    NodeId, OriginatorEnvelope, PayerEnvelope, PicoDollars, StagedEnvelope, Timestamp,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::debug;

/// Assigns the final sequence number and signs for this node.
pub trait Signer: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Produce the originator envelope for a staged row. Its sequence ID is
    /// the staged id.
    fn sign_staged_envelope(
        &self,
        staged: &StagedEnvelope,
        base_fee: PicoDollars,
        congestion_fee: PicoDollars,
        retention_days: u32,
    ) -> Result<OriginatorEnvelope>;
}

pub trait FeeCalculator: Send + Sync {
    fn calculate_base_fee(
        &self,
        time: Timestamp,
        message_size: usize,
        retention_days: u32,
    ) -> Result<PicoDollars>;

    /// `recent_messages` is what `originator` accepted over the congestion window.
    fn calculate_congestion_fee(
        &self,
        time: Timestamp,
        originator: NodeId,
        recent_messages: u64,
    ) -> Result<PicoDollars>;
}

/// The set of known originators and changes to it.
pub trait NodeRegistry: Send + Sync {
    fn originator_ids(&self) -> Result<Vec<NodeId>>;

    /// Each message lists nodes that just joined.
    fn on_new_nodes(&self) -> Receiver<Vec<NodeId>>;

    /// Each message lists nodes that just left.
    fn on_removed_nodes(&self) -> Receiver<Vec<NodeId>>;
}

/// Payload-specific checks run before a publish is accepted, e.g. key
/// package validation.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, envelope: &PayerEnvelope) -> Result<()>;
}

/// Accepts every payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate(&self, _envelope: &PayerEnvelope) -> Result<()> {
        Ok(())
    }
}

/// Linear fees: per byte-day of storage plus per recent message of congestion.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlatFees {
    pub per_byte_day: PicoDollars,
    pub per_recent_message: PicoDollars,
}

impl FeeCalculator for FlatFees {
    fn calculate_base_fee(
        &self,
        _time: Timestamp,
        message_size: usize,
        retention_days: u32,
    ) -> Result<PicoDollars> {
        (message_size as u64)
            .checked_mul(u64::from(retention_days))
            .and_then(|byte_days| byte_days.checked_mul(self.per_byte_day))
            .ok_or_else(|| Error::Fees("base fee overflow".into()))
    }

    fn calculate_congestion_fee(
        &self,
        _time: Timestamp,
        _originator: NodeId,
        recent_messages: u64,
    ) -> Result<PicoDollars> {
        recent_messages
            .checked_mul(self.per_recent_message)
            .ok_or_else(|| Error::Fees("congestion fee overflow".into()))
    }
}

/// An in-process registry whose membership is changed by hand.
#[derive(Default)]
pub struct StaticNodeRegistry {
    nodes: Mutex<BTreeSet<NodeId>>,
    new_watchers: Mutex<Vec<Sender<Vec<NodeId>>>>,
    removed_watchers: Mutex<Vec<Sender<Vec<NodeId>>>>,
}

impl StaticNodeRegistry {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            nodes: Mutex::new(nodes.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Returns `false` if the node was already known.
    pub fn add_node(&self, node: NodeId) -> bool {
        if !self.nodes.lock().insert(node) {
            return false;
        }
        debug!(node, "node added");
        Self::broadcast(&self.new_watchers, node);
        true
    }

    /// Returns `false` if the node was unknown.
    pub fn remove_node(&self, node: NodeId) -> bool {
        if !self.nodes.lock().remove(&node) {
            return false;
        }
        debug!(node, "node removed");
        Self::broadcast(&self.removed_watchers, node);
        true
    }

    fn broadcast(watchers: &Mutex<Vec<Sender<Vec<NodeId>>>>, node: NodeId) {
        watchers.lock().retain(|tx| tx.send(vec![node]).is_ok());
    }

    fn watch(watchers: &Mutex<Vec<Sender<Vec<NodeId>>>>) -> Receiver<Vec<NodeId>> {
        let (tx, rx) = unbounded();
        watchers.lock().push(tx);
        rx
    }
}

impl NodeRegistry for StaticNodeRegistry {
    fn originator_ids(&self) -> Result<Vec<NodeId>> {
        Ok(self.nodes.lock().iter().copied().collect())
    }

    fn on_new_nodes(&self) -> Receiver<Vec<NodeId>> {
        Self::watch(&self.new_watchers)
    }

    fn on_removed_nodes(&self) -> Receiver<Vec<NodeId>> {
        Self::watch(&self.removed_watchers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_registry_notifies() {
        let registry = StaticNodeRegistry::new([100]);
        let added = registry.on_new_nodes();
        let removed = registry.on_removed_nodes();

        assert!(registry.add_node(200));
        assert!(!registry.add_node(200));
        assert_eq!(added.try_recv().unwrap(), vec![200]);
        assert!(added.try_recv().is_err());

        assert!(registry.remove_node(100));
        assert!(!registry.remove_node(100));
        assert_eq!(removed.try_recv().unwrap(), vec![100]);
        assert_eq!(registry.originator_ids().unwrap(), vec![200]);
    }

    #[test]
    fn test_flat_fees() {
        let fees = FlatFees {
            per_byte_day: 2,
            per_recent_message: 5,
        };
        let now = Timestamp::now();
        assert_eq!(fees.calculate_base_fee(now, 10, 3).unwrap(), 60);
        assert_eq!(fees.calculate_congestion_fee(now, 1, 4).unwrap(), 20);
        assert!(matches!(
            fees.calculate_base_fee(now, usize::MAX, u32::MAX),
            Err(Error::Fees(_))
        ));
    }
}
