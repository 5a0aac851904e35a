//! Core types for the envelope log.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Numeric identity of a network node (the originator of envelopes).
pub type NodeId = u32;

/// Position of an envelope in its originator's log.
pub type SequenceId = u64;

/// Identifier of a payer in the usage ledger.
pub type PayerId = u32;

/// Fee amounts, in picodollars.
pub type PicoDollars = u64;

/// Microseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn from_unix_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    pub fn unix_secs(self) -> i64 {
        self.0 / 1_000_000
    }

    /// Whole minutes since the epoch; the bucket used by usage counters.
    pub fn minutes_since_epoch(self) -> u32 {
        (self.unix_secs().max(0) / 60) as u32
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// The kind of a topic, stored in its first byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TopicKind {
    GroupMessages,
    WelcomeMessages,
    IdentityUpdates,
    KeyPackages,
    PayerReports,
    PayerReportAttestations,
}

impl TopicKind {
    pub fn as_byte(self) -> u8 {
        match self {
            TopicKind::GroupMessages => 0,
            TopicKind::WelcomeMessages => 1,
            TopicKind::IdentityUpdates => 2,
            TopicKind::KeyPackages => 3,
            TopicKind::PayerReports => 4,
            TopicKind::PayerReportAttestations => 5,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => TopicKind::GroupMessages,
            1 => TopicKind::WelcomeMessages,
            2 => TopicKind::IdentityUpdates,
            3 => TopicKind::KeyPackages,
            4 => TopicKind::PayerReports,
            5 => TopicKind::PayerReportAttestations,
            _ => return None,
        })
    }

    /// Reserved kinds are produced by nodes themselves and carry no fees.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            TopicKind::PayerReports | TopicKind::PayerReportAttestations
        )
    }
}

/// Routing key of an envelope: a kind byte followed by an identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Topic(pub Vec<u8>);

impl Topic {
    pub fn new(kind: TopicKind, identifier: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(identifier.len() + 1);
        bytes.push(kind.as_byte());
        bytes.extend_from_slice(identifier);
        Topic(bytes)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Topic(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `None` for empty topics and unknown kind bytes.
    pub fn kind(&self) -> Option<TopicKind> {
        self.0.first().copied().and_then(TopicKind::from_byte)
    }

    pub fn is_reserved(&self) -> bool {
        self.kind().map_or(false, TopicKind::is_reserved)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", hex::encode(&self.0))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// A durable envelope, immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub originator_id: NodeId,
    pub sequence_id: SequenceId,
    pub topic: Topic,
    /// Signed originator envelope bytes; opaque to the log.
    pub payload: Vec<u8>,
    /// Time the envelope was accepted by this node.
    pub insert_time: Timestamp,
    /// Unix seconds after which the envelope may be dropped.
    pub expiry: Option<i64>,
    pub payer_id: Option<PayerId>,
}

/// Input for inserting an envelope.
#[derive(Clone, Debug)]
pub struct NewEnvelope {
    pub originator_id: NodeId,
    pub sequence_id: SequenceId,
    pub topic: Topic,
    pub payload: Vec<u8>,
    /// Defaults to the commit time when `None`.
    pub insert_time: Option<Timestamp>,
    pub expiry: Option<i64>,
    pub payer_id: Option<PayerId>,
    /// Spend charged to `payer_id` when the row is actually inserted.
    pub spend: PicoDollars,
}

impl NewEnvelope {
    pub fn new(
        originator_id: NodeId,
        sequence_id: SequenceId,
        topic: Topic,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            originator_id,
            sequence_id,
            topic,
            payload: payload.into(),
            insert_time: None,
            expiry: None,
            payer_id: None,
            spend: 0,
        }
    }

    pub fn with_expiry(mut self, expiry: i64) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_payer(mut self, payer_id: PayerId, spend: PicoDollars) -> Self {
        self.payer_id = Some(payer_id);
        self.spend = spend;
        self
    }

    pub(crate) fn into_envelope(self, now: Timestamp) -> Envelope {
        Envelope {
            originator_id: self.originator_id,
            sequence_id: self.sequence_id,
            topic: self.topic,
            payload: self.payload,
            insert_time: self.insert_time.unwrap_or(now),
            expiry: self.expiry,
            payer_id: self.payer_id,
        }
    }
}

/// An envelope as submitted by a payer, before the node sequences it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerEnvelope {
    /// Address recovered from the payer signature by the transport layer.
    pub payer_address: String,
    pub target_originator: NodeId,
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub retention_days: u32,
    pub signature: Vec<u8>,
}

impl PayerEnvelope {
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// A payer envelope sequenced and signed by its originator node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginatorEnvelope {
    pub originator_id: NodeId,
    pub sequence_id: SequenceId,
    pub originator_time: Timestamp,
    pub topic: Topic,
    pub payer_envelope: Vec<u8>,
    pub base_fee: PicoDollars,
    pub congestion_fee: PicoDollars,
    pub expiry: Option<i64>,
    pub signature: Vec<u8>,
}

impl OriginatorEnvelope {
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn total_fee(&self) -> PicoDollars {
        self.base_fee.saturating_add(self.congestion_fee)
    }
}

/// A write-ahead row holding a payer envelope until it is durably published.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedEnvelope {
    /// Also the sequence ID the envelope is published under.
    pub id: SequenceId,
    pub originator_time: Timestamp,
    pub topic: Topic,
    pub payer_envelope: Vec<u8>,
}
