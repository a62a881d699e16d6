//! Event Publisher - Emits escrow events to notification collaborators
//!
//! Publication is fire-and-forget. Every sink runs on its own spawned
//! task; a failing or slow sink is logged and never blocks or rolls back
//! the escrow transition that produced the event.

use crate::models::{ListingId, ResolveAction, Transaction, TransactionRecord, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Event kinds consumed by the notification and email services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EscrowEventKind {
    #[serde(rename = "transaction.completed")]
    TransactionCompleted,
    #[serde(rename = "transaction.disputed")]
    TransactionDisputed,
    #[serde(rename = "transaction.refunded")]
    TransactionRefunded,
    #[serde(rename = "transaction.resolved")]
    TransactionResolved,
    #[serde(rename = "listing.boosted")]
    ListingBoosted,
}

impl EscrowEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransactionCompleted => "transaction.completed",
            Self::TransactionDisputed => "transaction.disputed",
            Self::TransactionRefunded => "transaction.refunded",
            Self::TransactionResolved => "transaction.resolved",
            Self::ListingBoosted => "listing.boosted",
        }
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Transaction(TransactionRecord),
    Resolution {
        transaction: TransactionRecord,
        admin_id: UserId,
        action: ResolveAction,
    },
    Boost {
        listing_id: ListingId,
        boosted_until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscrowEvent {
    pub kind: EscrowEventKind,
    pub payload: EventPayload,
    pub occurred_at: DateTime<Utc>,
}

impl EscrowEvent {
    pub fn completed(txn: &Transaction) -> Self {
        Self::for_transaction(EscrowEventKind::TransactionCompleted, txn)
    }

    pub fn disputed(txn: &Transaction) -> Self {
        Self::for_transaction(EscrowEventKind::TransactionDisputed, txn)
    }

    pub fn refunded(txn: &Transaction) -> Self {
        Self::for_transaction(EscrowEventKind::TransactionRefunded, txn)
    }

    pub fn resolved(txn: &Transaction, admin_id: UserId, action: ResolveAction) -> Self {
        Self {
            kind: EscrowEventKind::TransactionResolved,
            payload: EventPayload::Resolution {
                transaction: TransactionRecord::from(txn.clone()),
                admin_id,
                action,
            },
            occurred_at: txn.updated_at(),
        }
    }

    pub fn boosted(listing_id: ListingId, boosted_until: DateTime<Utc>) -> Self {
        Self {
            kind: EscrowEventKind::ListingBoosted,
            payload: EventPayload::Boost {
                listing_id,
                boosted_until,
            },
            occurred_at: Utc::now(),
        }
    }

    fn for_transaction(kind: EscrowEventKind, txn: &Transaction) -> Self {
        Self {
            kind,
            payload: EventPayload::Transaction(TransactionRecord::from(txn.clone())),
            occurred_at: txn.updated_at(),
        }
    }
}

/// A consumer of escrow events
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, event: &EscrowEvent) -> anyhow::Result<()>;
}

/// Configuration for the event publisher
#[derive(Debug, Clone)]
pub struct EventPublisherConfig {
    /// Upper bound for a single sink delivery
    pub delivery_timeout: Duration,
}

impl Default for EventPublisherConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

/// Fans events out to every registered sink
#[derive(Clone, Default)]
pub struct EventPublisher {
    config: EventPublisherConfig,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventPublisher {
    pub fn new(config: EventPublisherConfig) -> Self {
        Self {
            config,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Hand the event to every sink without waiting for delivery
    pub fn publish(&self, event: EscrowEvent) {
        let event = Arc::new(event);
        for sink in &self.sinks {
            let sink = Arc::clone(sink);
            let event = Arc::clone(&event);
            let timeout = self.config.delivery_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, sink.deliver(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        sink = sink.name(),
                        kind = event.kind.as_str(),
                        "event delivery failed: {}",
                        e
                    ),
                    Err(_) => warn!(
                        sink = sink.name(),
                        kind = event.kind.as_str(),
                        "event delivery timed out"
                    ),
                }
            });
        }
    }
}

/// Logs every event
pub struct TracingSink;

#[async_trait::async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn deliver(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&event.payload)?;
        info!(kind = event.kind.as_str(), payload = %payload, "escrow event");
        Ok(())
    }
}

/// POSTs events as JSON to a webhook endpoint
pub struct WebhookSink {
    pub target_url: String,
    pub secret: Option<String>,
    pub client: reqwest::Client,
}

impl WebhookSink {
    pub fn new<S: Into<String>>(target_url: S, secret: Option<String>) -> Self {
        Self {
            target_url: target_url.into(),
            secret,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        let mut req = self
            .client
            .post(&self.target_url)
            .header("X-Event-Type", event.kind.as_str())
            .json(event);
        if let Some(secret) = &self.secret {
            req = req.header("X-Webhook-Secret", secret);
        }
        req.send().await?.error_for_status()?;
        Ok(())
    }
}

/// Forwards events into an in-process channel
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<EscrowEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EscrowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait::async_trait]
impl EventSink for ChannelSink {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn deliver(&self, event: &EscrowEvent) -> anyhow::Result<()> {
        self.sender
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))
    }
}
