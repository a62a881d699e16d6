//! Reconciliation pass against the payment gateway
//!
//! A crash between a successful gateway call and the local commit leaves
//! the row behind the gateway. This pass walks every open row, reads the
//! intent status and moves the row forward to match, under the same row
//! lock the lifecycle operations take. Combinations it cannot explain
//! are reported and left alone.

use crate::{
    escrow_engine::EscrowEngine,
    event_publisher::EscrowEvent,
    models::{EscrowState, PaymentStatus, Transaction, TransactionId},
    payment_gateway::IntentStatus,
    store::{Commit, RowKey},
    EscrowResult,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay between passes when run in the background
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// Row whose local state and intent status disagree in a way that is
/// not repaired automatically
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub transaction_id: TransactionId,
    pub local: PaymentStatus,
    pub gateway: IntentStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub checked: usize,
    pub repaired: Vec<TransactionId>,
    pub mismatches: Vec<Mismatch>,
    /// Rows skipped because the gateway or the commit failed
    pub failed: usize,
}

enum Repair {
    None,
    Capture,
    Cancel,
    Refund,
    Report,
}

fn repair_for(state: EscrowState, gateway: IntentStatus) -> Repair {
    match (state, gateway) {
        (_, IntentStatus::RequiresCapture) => Repair::None,
        (_, IntentStatus::Captured) => Repair::Capture,
        (EscrowState::Held { .. }, IntentStatus::Canceled) => Repair::Cancel,
        (EscrowState::DisputedPendingReview { .. }, IntentStatus::Canceled)
        | (EscrowState::DisputedPendingReview { .. }, IntentStatus::Refunded) => Repair::Refund,
        _ => Repair::Report,
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    engine: Arc<EscrowEngine>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, engine: Arc<EscrowEngine>) -> Self {
        Self { config, engine }
    }

    /// Check every HELD or DISPUTED row once
    pub async fn run_once(&self) -> EscrowResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        for txn in self.engine.store().list_open().await? {
            report.checked += 1;
            if let Err(e) = self.reconcile(txn.id(), &mut report).await {
                error!(transaction_id = %txn.id(), "reconciliation failed: {}", e);
                report.failed += 1;
            }
        }

        if !report.repaired.is_empty() || !report.mismatches.is_empty() {
            info!(
                checked = report.checked,
                repaired = report.repaired.len(),
                mismatches = report.mismatches.len(),
                "reconciliation pass finished"
            );
        }
        Ok(report)
    }

    async fn reconcile(
        &self,
        transaction_id: TransactionId,
        report: &mut ReconciliationReport,
    ) -> EscrowResult<()> {
        let _guard = self
            .engine
            .store()
            .lock_row(RowKey::Transaction(transaction_id))
            .await;

        // re-read under the lock; a lifecycle operation may have won
        let txn = match self.engine.store().get(transaction_id).await? {
            Some(txn) if txn.escrow().is_open() => txn,
            _ => return Ok(()),
        };

        let gateway_status = self
            .engine
            .call_gateway(
                "intent_status",
                self.engine.gateway().intent_status(txn.intent_id()),
            )
            .await?;

        let now = Utc::now();
        let state = txn.escrow();
        let (commit, event) = match repair_for(state, gateway_status) {
            Repair::None => {
                debug!(transaction_id = %transaction_id, "row matches gateway");
                return Ok(());
            }
            Repair::Report => {
                warn!(
                    transaction_id = %transaction_id,
                    intent_id = %txn.intent_id(),
                    local = txn.payment_status().as_str(),
                    gateway = ?gateway_status,
                    "unrepairable divergence from gateway"
                );
                report.mismatches.push(Mismatch {
                    transaction_id,
                    local: txn.payment_status(),
                    gateway: gateway_status,
                });
                return Ok(());
            }
            Repair::Capture => {
                let next = state.capture(now)?;
                (
                    Commit::update(txn.with_state(next, now), state).mark_listing_sold(),
                    EscrowEvent::completed as fn(&Transaction) -> EscrowEvent,
                )
            }
            Repair::Cancel => {
                let next = state.cancel()?;
                (
                    Commit::update(txn.with_state(next, now), state),
                    EscrowEvent::refunded as fn(&Transaction) -> EscrowEvent,
                )
            }
            Repair::Refund => {
                let next = state.refund()?;
                (
                    Commit::update(txn.with_state(next, now), state),
                    EscrowEvent::refunded as fn(&Transaction) -> EscrowEvent,
                )
            }
        };

        let receipt = self.engine.store().commit(commit).await?;
        warn!(
            transaction_id = %transaction_id,
            intent_id = %txn.intent_id(),
            from = state.payment_status().as_str(),
            to = receipt.transaction.payment_status().as_str(),
            "repaired row from gateway state"
        );
        self.engine.events().publish(event(&receipt.transaction));
        report.repaired.push(transaction_id);
        Ok(())
    }

    /// Run `run_once` every `interval` until the task is aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(self.config.interval);
            info!(
                "reconciler started with interval={}s",
                self.config.interval.as_secs()
            );
            loop {
                timer.tick().await;
                if let Err(e) = self.run_once().await {
                    error!("reconciliation pass failed: {}", e);
                }
            }
        })
    }
}
