//! Escrow Engine - buyer, seller and admin driven escrow transitions
//!
//! Every public operation is one atomic business transition:
//!
//! 1. take the row lock for the transaction,
//! 2. look the row up together with the state the operation requires
//!    (a row in any other state is `NotFound`, i.e. already handled),
//! 3. call the payment gateway, bounded by a timeout,
//! 4. commit the new state only if the gateway reported success,
//! 5. publish an event without waiting for its consumers.
//!
//! A gateway failure or timeout leaves the row untouched and surfaces to
//! the caller, who may retry the whole operation.

use crate::{
    arbitration::AdminIdentity,
    error::{EscrowError, GatewayError},
    event_publisher::{EscrowEvent, EventPublisher},
    models::{
        DisputeOutcome, EscrowState, IntentId, ListingId, Money, ResolveAction, Transaction,
        TransactionId, UserId,
    },
    payment_gateway::{GatewayResult, HoldRequest, PaymentGateway},
    pricing::FeeSchedule,
    store::{Commit, RowGuard, RowKey, TransactionStore},
    EscrowResult,
};
use chrono::Utc;
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

/// Namespace for deterministic transaction ids
const TRANSACTION_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_8d3b_4c5a_9e7f_1b2d_3c4e_5f60);

/// Configuration for the escrow engine
#[derive(Debug, Clone)]
pub struct EscrowEngineConfig {
    /// Upper bound for a single gateway call
    pub gateway_timeout: Duration,
    /// Service fee applied on top of the listing price
    pub fees: FeeSchedule,
}

impl Default for EscrowEngineConfig {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(10),
            fees: FeeSchedule::default(),
        }
    }
}

/// Where the buyer's hold comes from
#[derive(Debug, Clone)]
pub enum HoldSource {
    /// Place a new hold against a saved payment method
    PaymentMethod(String),
    /// Adopt a hold the buyer already authorized on a hosted checkout page.
    /// `amount` is what the gateway reports as held.
    AuthorizedIntent { intent_id: IntentId, amount: Money },
}

/// Result of `authorize`
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeOutcome {
    pub transaction: Transaction,
    /// A HELD row for the pair already existed and was returned as is
    pub already_exists: bool,
}

/// Result of `confirm_handoff`
#[derive(Debug, Clone, Serialize)]
pub struct HandoffOutcome {
    pub transaction: Transaction,
    pub already_confirmed: bool,
}

/// Result of `dispute`
#[derive(Debug, Clone, Serialize)]
pub struct DisputeResult {
    pub transaction: Transaction,
    /// False: refunded immediately. True: funds held for admin review.
    pub admin_review: bool,
}

/// Who must be acting on the transaction
#[derive(Debug, Clone, Copy)]
enum Actor {
    Buyer(UserId),
    Seller(UserId),
    /// Holders of an `AdminIdentity` may act on any transaction
    Admin,
}

/// Main escrow engine coordinating store and gateway
pub struct EscrowEngine {
    config: EscrowEngineConfig,
    store: Arc<TransactionStore>,
    gateway: Arc<dyn PaymentGateway>,
    events: EventPublisher,
}

impl EscrowEngine {
    /// Create a new escrow engine with the given configuration
    pub fn new(
        config: EscrowEngineConfig,
        store: Arc<TransactionStore>,
        gateway: Arc<dyn PaymentGateway>,
        events: EventPublisher,
    ) -> Self {
        Self {
            config,
            store,
            gateway,
            events,
        }
    }

    pub fn config(&self) -> &EscrowEngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn PaymentGateway> {
        &self.gateway
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Hold buyer funds for a listing. Idempotent per (listing, buyer):
    /// while a HELD row exists for the pair it is returned unchanged.
    pub async fn authorize(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
        source: HoldSource,
    ) -> EscrowResult<AuthorizeOutcome> {
        let _guard = self
            .store
            .lock_row(RowKey::Checkout(listing_id, buyer_id))
            .await;

        if let Some(existing) = self.store.find_held(listing_id, buyer_id).await? {
            info!(
                transaction_id = %existing.id(),
                "hold already exists for listing {} and buyer {}",
                listing_id,
                buyer_id
            );
            return Ok(AuthorizeOutcome {
                transaction: existing,
                already_exists: true,
            });
        }

        let listing = self
            .store
            .listing(listing_id)
            .await
            .ok_or_else(|| EscrowError::not_found(format!("Listing {} not found", listing_id)))?;
        if listing.seller_id == buyer_id {
            return Err(EscrowError::validation("Cannot buy your own listing"));
        }
        if listing.is_sold {
            return Err(EscrowError::validation(format!(
                "Listing {} is already sold",
                listing_id
            )));
        }

        let quote = self.config.fees.quote(listing.price)?;
        let attempt = self.store.count_for_pair(listing_id, buyer_id).await;
        let transaction_id = transaction_id_for(listing_id, buyer_id, attempt);

        let (intent_id, amount) = match source {
            HoldSource::AuthorizedIntent { intent_id, amount } => {
                if amount != quote.amount {
                    warn!(
                        intent_id = %intent_id,
                        "authorized {} {} but listing {} now costs {} {}",
                        amount.amount_minor,
                        amount.currency,
                        listing_id,
                        quote.amount.amount_minor,
                        quote.amount.currency
                    );
                    return Err(EscrowError::validation(format!(
                        "Authorized amount no longer matches the price of listing {}",
                        listing_id
                    )));
                }
                (intent_id, amount)
            }
            HoldSource::PaymentMethod(payment_method) => {
                let request = HoldRequest {
                    amount: quote.amount.clone(),
                    idempotency_key: idempotency_key_for(
                        listing_id,
                        buyer_id,
                        attempt,
                        &payment_method,
                    ),
                    payment_method,
                    description: format!("Secure-Pay: {}", listing.title),
                };
                let intent_id = self
                    .call_gateway("authorize_hold", self.gateway.authorize_hold(request))
                    .await?;
                (intent_id, quote.amount)
            }
        };

        let now = Utc::now();
        let txn = Transaction::new_held(
            transaction_id,
            listing_id,
            buyer_id,
            listing.seller_id,
            intent_id,
            amount,
            now,
        )?;
        let receipt = self.commit(Commit::insert(txn)).await?;

        info!(
            transaction_id = %receipt.id(),
            intent_id = %receipt.intent_id(),
            "funds held for listing {}",
            listing_id
        );

        Ok(AuthorizeOutcome {
            transaction: receipt,
            already_exists: false,
        })
    }

    /// Seller attests the physical handoff. Repeat calls succeed without
    /// changing the original confirmation time.
    pub async fn confirm_handoff(
        &self,
        transaction_id: TransactionId,
        seller_id: UserId,
    ) -> EscrowResult<HandoffOutcome> {
        let (_guard, txn) = self
            .load(transaction_id, Actor::Seller(seller_id), EscrowState::is_held)
            .await?;

        if txn.seller_confirmed_at().is_some() {
            return Ok(HandoffOutcome {
                transaction: txn,
                already_confirmed: true,
            });
        }

        let now = Utc::now();
        let next = txn.escrow().confirm_handoff(now)?;
        let updated = self
            .commit(Commit::update(txn.with_state(next, now), txn.escrow()))
            .await?;

        info!(transaction_id = %transaction_id, "seller confirmed handoff");

        Ok(HandoffOutcome {
            transaction: updated,
            already_confirmed: false,
        })
    }

    /// Buyer confirms receipt: capture the hold, complete the transaction
    /// and mark the listing sold.
    pub async fn confirm_receipt(
        &self,
        transaction_id: TransactionId,
        buyer_id: UserId,
    ) -> EscrowResult<Transaction> {
        let (_guard, txn) = self
            .load(transaction_id, Actor::Buyer(buyer_id), EscrowState::is_held)
            .await?;
        let _listing_guard = self.require_unsold_listing(&txn).await?;

        self.call_gateway("capture", self.gateway.capture(txn.intent_id()))
            .await?;

        let now = Utc::now();
        let next = txn.escrow().capture(now)?;
        let updated = self
            .commit(Commit::update(txn.with_state(next, now), txn.escrow()).mark_listing_sold())
            .await?;

        info!(transaction_id = %transaction_id, "payment captured, transaction completed");
        self.events.publish(EscrowEvent::completed(&updated));

        Ok(updated)
    }

    /// Buyer disputes a held transaction. Before handoff confirmation the
    /// hold is cancelled and the buyer refunded. After it, the funds stay
    /// held and the transaction waits for an admin.
    pub async fn dispute(
        &self,
        transaction_id: TransactionId,
        buyer_id: UserId,
    ) -> EscrowResult<DisputeResult> {
        let (_guard, txn) = self
            .load(transaction_id, Actor::Buyer(buyer_id), EscrowState::is_held)
            .await?;

        let (next, outcome) = txn.escrow().dispute()?;
        if outcome == DisputeOutcome::Refunded {
            self.call_gateway("cancel", self.gateway.cancel(txn.intent_id()))
                .await?;
        }

        let now = Utc::now();
        let updated = self
            .commit(Commit::update(txn.with_state(next, now), txn.escrow()))
            .await?;

        let admin_review = outcome == DisputeOutcome::AdminReview;
        if admin_review {
            warn!(transaction_id = %transaction_id, "dispute escalated for admin review");
            self.events.publish(EscrowEvent::disputed(&updated));
        } else {
            info!(transaction_id = %transaction_id, "dispute before handoff, hold cancelled");
            self.events.publish(EscrowEvent::refunded(&updated));
        }

        Ok(DisputeResult {
            transaction: updated,
            admin_review,
        })
    }

    /// Admin decision on a disputed transaction. The audit entry is
    /// written in the same commit as the state change.
    pub async fn resolve(
        &self,
        transaction_id: TransactionId,
        admin: &AdminIdentity,
        action: ResolveAction,
    ) -> EscrowResult<Transaction> {
        let (_guard, txn) = self
            .load(transaction_id, Actor::Admin, EscrowState::is_disputed)
            .await?;

        let now = Utc::now();
        let (commit, _listing_guard) = match action {
            ResolveAction::Release => {
                let listing_guard = self.require_unsold_listing(&txn).await?;
                self.call_gateway("capture", self.gateway.capture(txn.intent_id()))
                    .await?;
                let next = txn.escrow().capture(now)?;
                (
                    Commit::update(txn.with_state(next, now), txn.escrow()).mark_listing_sold(),
                    Some(listing_guard),
                )
            }
            ResolveAction::Refund => {
                self.call_gateway("refund", self.gateway.refund(txn.intent_id()))
                    .await?;
                let next = txn.escrow().refund()?;
                (Commit::update(txn.with_state(next, now), txn.escrow()), None)
            }
        };

        let receipt = self
            .store
            .commit(commit.with_audit(admin.user_id(), action))
            .await
            .inspect_err(|e| self.log_commit_failure(transaction_id, e))?;
        let updated = receipt.transaction;

        info!(
            transaction_id = %transaction_id,
            admin_id = %admin.user_id(),
            action = action.as_str(),
            "dispute resolved"
        );
        self.events
            .publish(EscrowEvent::resolved(&updated, admin.user_id(), action));

        Ok(updated)
    }

    /// Read-only lookup
    pub async fn get(&self, transaction_id: TransactionId) -> EscrowResult<Transaction> {
        self.store
            .get(transaction_id)
            .await?
            .ok_or_else(|| not_found(transaction_id))
    }

    /// Lock the row, then check actor and required state
    async fn load(
        &self,
        transaction_id: TransactionId,
        actor: Actor,
        precondition: fn(&EscrowState) -> bool,
    ) -> EscrowResult<(RowGuard, Transaction)> {
        let guard = self
            .store
            .lock_row(RowKey::Transaction(transaction_id))
            .await;

        let txn = self
            .store
            .get(transaction_id)
            .await?
            .ok_or_else(|| not_found(transaction_id))?;

        let allowed = match actor {
            Actor::Buyer(user) => txn.buyer_id() == user,
            Actor::Seller(user) => txn.seller_id() == user,
            Actor::Admin => true,
        };
        if !allowed {
            return Err(EscrowError::authorization(format!(
                "Caller is not permitted to act on transaction {}",
                transaction_id
            )));
        }

        if !precondition(&txn.escrow()) {
            return Err(EscrowError::not_found(format!(
                "Transaction {} not found in the required state (currently {}, {})",
                transaction_id,
                txn.payment_status().as_str(),
                txn.status().as_str()
            )));
        }

        Ok((guard, txn))
    }

    /// Lock the listing for a capture. Another buyer's escrow may already
    /// have sold it, in which case nothing is captured.
    async fn require_unsold_listing(&self, txn: &Transaction) -> EscrowResult<RowGuard> {
        let guard = self
            .store
            .lock_row(RowKey::Listing(txn.listing_id()))
            .await;
        let listing = self.store.listing(txn.listing_id()).await.ok_or_else(|| {
            EscrowError::not_found(format!("Listing {} not found", txn.listing_id()))
        })?;
        if listing.is_sold {
            warn!(
                transaction_id = %txn.id(),
                "listing {} was sold through another transaction",
                listing.id
            );
            return Err(EscrowError::validation(format!(
                "Listing {} is already sold",
                listing.id
            )));
        }
        Ok(guard)
    }

    async fn commit(&self, commit: Commit) -> EscrowResult<Transaction> {
        let transaction_id = commit.transaction.id();
        self.store
            .commit(commit)
            .await
            .map(|receipt| receipt.transaction)
            .inspect_err(|e| self.log_commit_failure(transaction_id, e))
    }

    fn log_commit_failure(&self, transaction_id: TransactionId, err: &EscrowError) {
        tracing::error!(
            transaction_id = %transaction_id,
            "local commit failed after gateway call: {}",
            err
        );
    }

    /// Run a gateway call under the configured timeout. A timeout is a
    /// failure; success is never assumed.
    pub(crate) async fn call_gateway<T, F>(&self, op: &'static str, call: F) -> EscrowResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        match tokio::time::timeout(self.config.gateway_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op, gateway = self.gateway.name(), "gateway call failed: {}", e);
                Err(e.into())
            }
            Err(_) => {
                warn!(op, gateway = self.gateway.name(), "gateway call timed out");
                Err(GatewayError::Timeout.into())
            }
        }
    }
}

fn not_found(transaction_id: TransactionId) -> EscrowError {
    EscrowError::not_found(format!("Transaction {} not found", transaction_id))
}

/// Deterministic per-attempt id. A retried authorization for the same
/// pair gets the same id.
fn transaction_id_for(listing_id: ListingId, buyer_id: UserId, attempt: usize) -> TransactionId {
    let name = format!("{}:{}:{}", listing_id, buyer_id, attempt);
    TransactionId(Uuid::new_v5(&TRANSACTION_NAMESPACE, name.as_bytes()))
}

/// Gateway key for one hold attempt. Retrying with the same card reuses
/// the key; switching cards is a different request and gets a new one.
fn idempotency_key_for(
    listing_id: ListingId,
    buyer_id: UserId,
    attempt: usize,
    payment_method: &str,
) -> String {
    let name = format!("{}:{}:{}:{}", listing_id, buyer_id, attempt, payment_method);
    format!(
        "authorize-{}",
        Uuid::new_v5(&TRANSACTION_NAMESPACE, name.as_bytes())
    )
}
