//! Transaction store
//!
//! In-memory persistence for escrow rows, the listing flags the core
//! flips, and the append-only resolution audit log. Rows are kept in
//! their flat `TransactionRecord` form and re-validated on every read.
//!
//! Mutual exclusion is per row: `lock_row` hands out an owned async
//! mutex guard keyed by transaction (or by listing/buyer pair during
//! authorization). Unrelated keys never contend. `commit` additionally
//! compares the stored state with the state the caller read, so a stale
//! writer fails with `NotFound` instead of overwriting.

use crate::{
    error::EscrowError,
    models::{
        AuditEntry, EscrowState, Listing, ListingId, ResolveAction, Transaction, TransactionId,
        TransactionRecord, UserId,
    },
    EscrowResult,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedMutexGuard, RwLock};

/// Unit of mutual exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKey {
    Transaction(TransactionId),
    /// Serializes authorization for one (listing, buyer) pair
    Checkout(ListingId, UserId),
    Listing(ListingId),
}

/// Held for the duration of one transition
pub type RowGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
struct RowLocks {
    locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl RowLocks {
    async fn acquire(&self, key: RowKey) -> RowGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // drop entries nobody is holding or waiting on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Audit entry to append with a commit
#[derive(Debug, Clone, Copy)]
pub struct AuditRecord {
    pub admin_id: UserId,
    pub action: ResolveAction,
}

/// One atomic write: the transaction row plus its side effects
#[derive(Debug, Clone)]
pub struct Commit {
    pub transaction: Transaction,
    /// State the caller read; `None` inserts a new row
    pub expected: Option<EscrowState>,
    pub mark_listing_sold: bool,
    pub audit: Option<AuditRecord>,
}

impl Commit {
    pub fn insert(transaction: Transaction) -> Self {
        Self {
            transaction,
            expected: None,
            mark_listing_sold: false,
            audit: None,
        }
    }

    pub fn update(transaction: Transaction, expected: EscrowState) -> Self {
        Self {
            transaction,
            expected: Some(expected),
            mark_listing_sold: false,
            audit: None,
        }
    }

    pub fn mark_listing_sold(mut self) -> Self {
        self.mark_listing_sold = true;
        self
    }

    pub fn with_audit(mut self, admin_id: UserId, action: ResolveAction) -> Self {
        self.audit = Some(AuditRecord { admin_id, action });
        self
    }
}

/// What a successful commit wrote
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub transaction: Transaction,
    pub audit_entry: Option<AuditEntry>,
}

#[derive(Debug, Default)]
struct StoreState {
    transactions: HashMap<TransactionId, TransactionRecord>,
    listings: HashMap<ListingId, Listing>,
    audit_log: Vec<AuditEntry>,
    /// Paid boost sessions that already started a window
    boost_sessions: HashSet<String>,
}

/// Escrow persistence
#[derive(Debug, Default)]
pub struct TransactionStore {
    state: RwLock<StoreState>,
    row_locks: RowLocks,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive lock for `key`
    pub async fn lock_row(&self, key: RowKey) -> RowGuard {
        self.row_locks.acquire(key).await
    }

    /// Insert or replace a listing (owned by the listing service)
    pub async fn upsert_listing(&self, listing: Listing) {
        self.state.write().await.listings.insert(listing.id, listing);
    }

    /// Apply listing-service fields to a listing, creating it if needed.
    /// Sale and boost flags set by escrow are kept.
    pub async fn sync_listing(&self, update: Listing) -> Listing {
        let mut state = self.state.write().await;
        let listing = state
            .listings
            .entry(update.id)
            .or_insert_with(|| update.clone());
        listing.seller_id = update.seller_id;
        listing.title = update.title;
        listing.price = update.price;
        listing.is_sold |= update.is_sold;
        listing.clone()
    }

    pub async fn listing(&self, listing_id: ListingId) -> Option<Listing> {
        self.state.read().await.listings.get(&listing_id).cloned()
    }

    /// Start or restart a listing's boost window, paid by `session_id`.
    /// Each session starts at most one window; the bool reports whether
    /// this call did.
    pub async fn boost_listing(
        &self,
        listing_id: ListingId,
        session_id: &str,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> EscrowResult<(Listing, bool)> {
        let mut state = self.state.write().await;
        let StoreState {
            listings,
            boost_sessions,
            ..
        } = &mut *state;
        let listing = listings
            .get_mut(&listing_id)
            .ok_or_else(|| EscrowError::not_found(format!("Listing {} not found", listing_id)))?;
        let fresh = boost_sessions.insert(session_id.to_string());
        if fresh {
            listing.boost(now, window);
        }
        Ok((listing.clone(), fresh))
    }

    pub async fn get(&self, id: TransactionId) -> EscrowResult<Option<Transaction>> {
        let record = self.state.read().await.transactions.get(&id).cloned();
        record.map(Transaction::try_from).transpose()
    }

    /// The HELD row for a (listing, buyer) pair, if any
    pub async fn find_held(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
    ) -> EscrowResult<Option<Transaction>> {
        let rows = self
            .matching(|txn| {
                txn.listing_id() == listing_id && txn.buyer_id() == buyer_id && txn.escrow().is_held()
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Number of rows ever created for a (listing, buyer) pair
    pub async fn count_for_pair(&self, listing_id: ListingId, buyer_id: UserId) -> usize {
        self.state
            .read()
            .await
            .transactions
            .values()
            .filter(|r| r.listing_id == listing_id && r.buyer_id == buyer_id)
            .count()
    }

    /// Most recent HELD or DISPUTED row on a listing where `user` is a party
    pub async fn active_for(
        &self,
        listing_id: ListingId,
        user: UserId,
    ) -> EscrowResult<Option<Transaction>> {
        let rows = self
            .matching(|txn| {
                txn.listing_id() == listing_id && txn.is_party(user) && txn.escrow().is_open()
            })
            .await?;
        Ok(rows.into_iter().max_by_key(|txn| txn.created_at()))
    }

    /// Every row whose funds are still in custody
    pub async fn list_open(&self) -> EscrowResult<Vec<Transaction>> {
        self.matching(|txn| txn.escrow().is_open()).await
    }

    async fn matching<F>(&self, filter: F) -> EscrowResult<Vec<Transaction>>
    where
        F: Fn(&Transaction) -> bool,
    {
        let state = self.state.read().await;
        let mut rows = Vec::new();
        for record in state.transactions.values() {
            let txn = Transaction::try_from(record.clone())?;
            if filter(&txn) {
                rows.push(txn);
            }
        }
        Ok(rows)
    }

    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.state.read().await.audit_log.clone()
    }

    pub async fn audit_for(&self, transaction_id: TransactionId) -> Vec<AuditEntry> {
        self.state
            .read()
            .await
            .audit_log
            .iter()
            .filter(|entry| entry.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    /// Apply a commit atomically. Every check runs before anything is
    /// written, so either all parts land or none do.
    pub async fn commit(&self, commit: Commit) -> EscrowResult<CommitReceipt> {
        let mut state = self.state.write().await;
        let txn = &commit.transaction;

        match commit.expected {
            None => {
                if state.transactions.contains_key(&txn.id()) {
                    return Err(EscrowError::internal(format!(
                        "Transaction {} already exists",
                        txn.id()
                    )));
                }
                if txn.escrow().is_held() {
                    let duplicate = state.transactions.values().any(|r| {
                        r.listing_id == txn.listing_id()
                            && r.buyer_id == txn.buyer_id()
                            && r.payment_status == Some(crate::models::PaymentStatus::Held)
                    });
                    if duplicate {
                        return Err(EscrowError::not_found(format!(
                            "A held transaction already exists for listing {} and buyer {}",
                            txn.listing_id(),
                            txn.buyer_id()
                        )));
                    }
                }
            }
            Some(expected) => {
                let current = state
                    .transactions
                    .get(&txn.id())
                    .cloned()
                    .map(Transaction::try_from)
                    .transpose()?;
                match current {
                    Some(current)
                        if current.escrow() == expected
                            && current.intent_id() == txn.intent_id() => {}
                    _ => {
                        return Err(EscrowError::not_found(format!(
                            "Transaction {} is no longer in the expected state",
                            txn.id()
                        )))
                    }
                }
            }
        }

        if commit.mark_listing_sold && !state.listings.contains_key(&txn.listing_id()) {
            return Err(EscrowError::not_found(format!(
                "Listing {} not found",
                txn.listing_id()
            )));
        }

        if commit.mark_listing_sold {
            if let Some(listing) = state.listings.get_mut(&txn.listing_id()) {
                listing.is_sold = true;
            }
        }

        let audit_entry = commit.audit.map(|audit| AuditEntry {
            id: state.audit_log.len() as u64 + 1,
            admin_id: audit.admin_id,
            action: audit.action,
            transaction_id: txn.id(),
            created_at: txn.updated_at(),
        });
        if let Some(entry) = &audit_entry {
            state.audit_log.push(entry.clone());
        }

        state
            .transactions
            .insert(txn.id(), TransactionRecord::from(txn.clone()));

        Ok(CommitReceipt {
            transaction: commit.transaction,
            audit_entry,
        })
    }
}
