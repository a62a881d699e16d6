//! Escrow Node - High-level API for the escrow system
//!
//! This module provides the main interface for interacting with the escrow system.
//! It wires the store, the lifecycle engine, arbitration, checkout, boost and
//! reconciliation together and exposes one method per boundary operation.

use crate::{
    arbitration::{AdminRegistry, DisputeArbiter},
    boost::{BoostConfig, BoostService},
    checkout::{ActiveTransaction, CheckoutConfig, CheckoutQuote, CheckoutService},
    error::EscrowError,
    escrow_engine::{
        AuthorizeOutcome, DisputeResult, EscrowEngine, EscrowEngineConfig, HandoffOutcome,
        HoldSource,
    },
    event_publisher::EventPublisher,
    models::{AuditEntry, Listing, ListingId, Transaction, TransactionId, UserId},
    payment_gateway::{CheckoutSession, PaymentGateway},
    reconciler::{Reconciler, ReconcilerConfig, ReconciliationReport},
    store::TransactionStore,
    EscrowResult,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Configuration for the escrow node
#[derive(Debug, Clone, Default)]
pub struct EscrowNodeConfig {
    /// Lifecycle engine configuration
    pub escrow_config: EscrowEngineConfig,
    /// Hosted checkout configuration
    pub checkout_config: CheckoutConfig,
    /// Listing boost configuration
    pub boost_config: BoostConfig,
    /// Reconciliation configuration
    pub reconciler_config: ReconcilerConfig,
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    store: Arc<TransactionStore>,
    /// Lifecycle engine for escrow transitions
    engine: Arc<EscrowEngine>,
    /// Admin-only dispute resolution
    arbiter: DisputeArbiter,
    checkout: CheckoutService,
    boost: BoostService,
    reconciler: Arc<Reconciler>,
}

/// Transaction with its resolution history
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub transaction: Transaction,
    pub audit: Vec<AuditEntry>,
}

impl EscrowNode {
    /// Create a new escrow node with all components initialized
    pub fn new(
        config: EscrowNodeConfig,
        gateway: Arc<dyn PaymentGateway>,
        admins: Arc<dyn AdminRegistry>,
        events: EventPublisher,
    ) -> Self {
        info!(
            gateway = gateway.name(),
            sinks = events.sink_count(),
            "Initializing escrow node"
        );

        let store = Arc::new(TransactionStore::new());
        let engine = Arc::new(EscrowEngine::new(
            config.escrow_config,
            store.clone(),
            gateway,
            events,
        ));

        Self {
            arbiter: DisputeArbiter::new(engine.clone(), admins),
            checkout: CheckoutService::new(config.checkout_config, engine.clone()),
            boost: BoostService::new(config.boost_config, engine.clone()),
            reconciler: Arc::new(Reconciler::new(config.reconciler_config, engine.clone())),
            store,
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<EscrowEngine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    /// Register or update a listing (called by the listing service)
    pub async fn upsert_listing(&self, listing: Listing) {
        self.store.upsert_listing(listing).await;
    }

    /// Merge a listing-service update without clearing escrow-owned flags
    pub async fn sync_listing(&self, listing: Listing) -> Listing {
        self.store.sync_listing(listing).await
    }

    pub async fn listing(&self, listing_id: ListingId) -> EscrowResult<Listing> {
        self.store
            .listing(listing_id)
            .await
            .ok_or_else(|| EscrowError::not_found(format!("Listing {} not found", listing_id)))
    }

    /// Quote and open a hosted Secure-Pay checkout
    pub async fn create_checkout(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
    ) -> EscrowResult<CheckoutQuote> {
        self.checkout.create_checkout(listing_id, buyer_id).await
    }

    /// Turn an authorized checkout session into a HELD transaction
    pub async fn activate_checkout(
        &self,
        listing_id: ListingId,
        session_id: &str,
        buyer_id: UserId,
    ) -> EscrowResult<AuthorizeOutcome> {
        self.checkout.activate(listing_id, session_id, buyer_id).await
    }

    /// Hold funds against a saved payment method
    pub async fn authorize(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        payment_method: String,
    ) -> EscrowResult<AuthorizeOutcome> {
        self.engine
            .authorize(listing_id, buyer_id, HoldSource::PaymentMethod(payment_method))
            .await
    }

    pub async fn confirm_handoff(
        &self,
        transaction_id: TransactionId,
        seller_id: UserId,
    ) -> EscrowResult<HandoffOutcome> {
        self.engine.confirm_handoff(transaction_id, seller_id).await
    }

    pub async fn confirm_receipt(
        &self,
        transaction_id: TransactionId,
        buyer_id: UserId,
    ) -> EscrowResult<Transaction> {
        self.engine.confirm_receipt(transaction_id, buyer_id).await
    }

    pub async fn dispute(
        &self,
        transaction_id: TransactionId,
        buyer_id: UserId,
    ) -> EscrowResult<DisputeResult> {
        self.engine.dispute(transaction_id, buyer_id).await
    }

    /// Admin resolution; `action` must be `release` or `refund`
    pub async fn resolve(
        &self,
        transaction_id: TransactionId,
        user_id: UserId,
        action: &str,
    ) -> EscrowResult<Transaction> {
        self.arbiter.resolve(transaction_id, user_id, action).await
    }

    /// Open escrow row on a listing for one of its parties
    pub async fn active_for(
        &self,
        listing_id: ListingId,
        user_id: UserId,
    ) -> EscrowResult<Option<ActiveTransaction>> {
        self.checkout.active_for(listing_id, user_id).await
    }

    /// Transaction details, visible to its parties and admins
    pub async fn transaction_info(
        &self,
        transaction_id: TransactionId,
        user_id: UserId,
    ) -> EscrowResult<TransactionInfo> {
        let transaction = self.engine.get(transaction_id).await?;
        if !transaction.is_party(user_id) {
            self.arbiter.authenticate(user_id).await?;
        }
        let audit = self.store.audit_for(transaction_id).await;
        Ok(TransactionInfo { transaction, audit })
    }

    pub async fn create_boost_session(
        &self,
        listing_id: ListingId,
        seller_id: UserId,
    ) -> EscrowResult<CheckoutSession> {
        self.boost.create_session(listing_id, seller_id).await
    }

    pub async fn activate_boost(
        &self,
        listing_id: ListingId,
        session_id: &str,
        seller_id: UserId,
    ) -> EscrowResult<Listing> {
        self.boost.activate(listing_id, session_id, seller_id).await
    }

    /// Single reconciliation pass against the gateway
    pub async fn reconcile(&self) -> EscrowResult<ReconciliationReport> {
        self.reconciler.run_once().await
    }

    /// Start periodic reconciliation in the background
    pub fn spawn_reconciler(&self) -> JoinHandle<()> {
        self.reconciler.clone().spawn()
    }
}
