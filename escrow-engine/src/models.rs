//! Core data models for the escrow system
//!
//! A Secure-Pay transaction carries two lifecycles, the business
//! workflow (`TransactionStatus`) and funds custody (`PaymentStatus`).
//! They are never stored independently: `EscrowState` is the single
//! source of truth and both statuses are derived from it, so only the
//! allowed combinations can exist in memory. `TransactionRecord` is the
//! flat row form used on the wire and in storage; converting it back
//! into a `Transaction` rejects anything off the table.

use crate::error::EscrowError;
use crate::EscrowResult;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Marketplace user id (owned by the external user service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Listing id (owned by the external listing service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(pub i64);

/// Escrow transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

/// Opaque payment-intent reference issued by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl IntentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Amount in currency minor units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: String,
}

impl Money {
    pub fn new<S: Into<String>>(amount_minor: i64, currency: S) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
        }
    }
}

/// Business workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Buyer expressed interest (escrow: funds held)
    Interested,
    /// Buyer and seller agreed on terms (cash workflow only)
    Agreed,
    /// Goods exchanged, funds released
    Completed,
    /// Transaction abandoned, funds returned
    Cancelled,
    /// Awaiting admin arbitration
    Disputed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "interested",
            Self::Agreed => "agreed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Disputed => "disputed",
        }
    }

    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Funds custody state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Held,
    Captured,
    Refunded,
    Disputed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Captured => "captured",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
        }
    }
}

/// How the buyer pays. Cash rows belong to the external workflow CRUD
/// and never enter the escrow core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    SecurePay,
}

/// Combined escrow state. Each variant implies both statuses.
/// `seller_confirmed_at` travels with every variant because it is
/// never cleared once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowState {
    /// (HELD, INTERESTED)
    Held {
        seller_confirmed_at: Option<DateTime<Utc>>,
    },
    /// (CAPTURED, COMPLETED)
    Captured {
        seller_confirmed_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    },
    /// (REFUNDED, CANCELLED)
    Refunded {
        seller_confirmed_at: Option<DateTime<Utc>>,
    },
    /// (DISPUTED, DISPUTED), only reachable after handoff confirmation
    DisputedPendingReview { seller_confirmed_at: DateTime<Utc> },
}

/// Result of a buyer dispute on a held transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeOutcome {
    /// Seller never confirmed handoff; hold cancelled, buyer refunded
    Refunded,
    /// Seller confirmed handoff; funds stay held for admin review
    AdminReview,
}

impl EscrowState {
    pub fn status(&self) -> TransactionStatus {
        match self {
            Self::Held { .. } => TransactionStatus::Interested,
            Self::Captured { .. } => TransactionStatus::Completed,
            Self::Refunded { .. } => TransactionStatus::Cancelled,
            Self::DisputedPendingReview { .. } => TransactionStatus::Disputed,
        }
    }

    pub fn payment_status(&self) -> PaymentStatus {
        match self {
            Self::Held { .. } => PaymentStatus::Held,
            Self::Captured { .. } => PaymentStatus::Captured,
            Self::Refunded { .. } => PaymentStatus::Refunded,
            Self::DisputedPendingReview { .. } => PaymentStatus::Disputed,
        }
    }

    pub fn seller_confirmed_at(&self) -> Option<DateTime<Utc>> {
        match *self {
            Self::Held { seller_confirmed_at }
            | Self::Captured {
                seller_confirmed_at,
                ..
            }
            | Self::Refunded { seller_confirmed_at } => seller_confirmed_at,
            Self::DisputedPendingReview { seller_confirmed_at } => Some(seller_confirmed_at),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match *self {
            Self::Captured { completed_at, .. } => Some(completed_at),
            _ => None,
        }
    }

    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }

    pub fn is_disputed(&self) -> bool {
        matches!(self, Self::DisputedPendingReview { .. })
    }

    /// HELD or DISPUTED: funds still in custody
    pub fn is_open(&self) -> bool {
        self.is_held() || self.is_disputed()
    }

    /// Seller attests handoff. Repeat calls keep the first timestamp.
    pub fn confirm_handoff(self, now: DateTime<Utc>) -> EscrowResult<Self> {
        match self {
            Self::Held {
                seller_confirmed_at: None,
            } => Ok(Self::Held {
                seller_confirmed_at: Some(now),
            }),
            Self::Held { .. } => Ok(self),
            other => Err(precondition("confirm handoff", &other)),
        }
    }

    /// Funds released to the seller, from HELD (buyer receipt) or
    /// DISPUTED (admin release).
    pub fn capture(self, now: DateTime<Utc>) -> EscrowResult<Self> {
        match self {
            Self::Held {
                seller_confirmed_at,
            } => Ok(Self::Captured {
                seller_confirmed_at,
                completed_at: now,
            }),
            Self::DisputedPendingReview {
                seller_confirmed_at,
            } => Ok(Self::Captured {
                seller_confirmed_at: Some(seller_confirmed_at),
                completed_at: now,
            }),
            other => Err(precondition("capture", &other)),
        }
    }

    /// Buyer dispute on a held transaction
    pub fn dispute(self) -> EscrowResult<(Self, DisputeOutcome)> {
        match self {
            Self::Held {
                seller_confirmed_at: None,
            } => Ok((
                Self::Refunded {
                    seller_confirmed_at: None,
                },
                DisputeOutcome::Refunded,
            )),
            Self::Held {
                seller_confirmed_at: Some(confirmed),
            } => Ok((
                Self::DisputedPendingReview {
                    seller_confirmed_at: confirmed,
                },
                DisputeOutcome::AdminReview,
            )),
            other => Err(precondition("dispute", &other)),
        }
    }

    /// Hold released without a dispute, e.g. cancelled at the gateway
    pub fn cancel(self) -> EscrowResult<Self> {
        match self {
            Self::Held {
                seller_confirmed_at,
            } => Ok(Self::Refunded {
                seller_confirmed_at,
            }),
            other => Err(precondition("cancel", &other)),
        }
    }

    /// Admin refund of a disputed transaction
    pub fn refund(self) -> EscrowResult<Self> {
        match self {
            Self::DisputedPendingReview {
                seller_confirmed_at,
            } => Ok(Self::Refunded {
                seller_confirmed_at: Some(seller_confirmed_at),
            }),
            other => Err(precondition("refund", &other)),
        }
    }

    /// Rebuild the typed state from persisted columns
    pub fn from_columns(
        status: TransactionStatus,
        payment_status: PaymentStatus,
        seller_confirmed_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> EscrowResult<Self> {
        use PaymentStatus as P;
        use TransactionStatus as S;

        let state = match (payment_status, status, seller_confirmed_at, completed_at) {
            (P::Held, S::Interested, confirmed, None) => Self::Held {
                seller_confirmed_at: confirmed,
            },
            (P::Captured, S::Completed, confirmed, Some(completed_at)) => Self::Captured {
                seller_confirmed_at: confirmed,
                completed_at,
            },
            (P::Refunded, S::Cancelled, confirmed, None) => Self::Refunded {
                seller_confirmed_at: confirmed,
            },
            (P::Disputed, S::Disputed, Some(confirmed), None) => Self::DisputedPendingReview {
                seller_confirmed_at: confirmed,
            },
            _ => {
                return Err(EscrowError::invalid_state(
                    status.as_str(),
                    payment_status.as_str(),
                ))
            }
        };
        Ok(state)
    }
}

fn precondition(action: &str, state: &EscrowState) -> EscrowError {
    EscrowError::not_found(format!(
        "cannot {} a transaction in state ({}, {})",
        action,
        state.payment_status().as_str(),
        state.status().as_str()
    ))
}

/// One escrowed buyer/seller/listing payment relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TransactionRecord", try_from = "TransactionRecord")]
pub struct Transaction {
    id: TransactionId,
    listing_id: ListingId,
    buyer_id: UserId,
    seller_id: UserId,
    intent_id: IntentId,
    amount: Money,
    escrow: EscrowState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a freshly authorized transaction in (HELD, INTERESTED)
    pub fn new_held(
        id: TransactionId,
        listing_id: ListingId,
        buyer_id: UserId,
        seller_id: UserId,
        intent_id: IntentId,
        amount: Money,
        now: DateTime<Utc>,
    ) -> EscrowResult<Self> {
        if buyer_id == seller_id {
            return Err(EscrowError::validation("Cannot buy your own listing"));
        }

        Ok(Self {
            id,
            listing_id,
            buyer_id,
            seller_id,
            intent_id,
            amount,
            escrow: EscrowState::Held {
                seller_confirmed_at: None,
            },
            created_at: now,
            updated_at: now,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn listing_id(&self) -> ListingId {
        self.listing_id
    }

    pub fn buyer_id(&self) -> UserId {
        self.buyer_id
    }

    pub fn seller_id(&self) -> UserId {
        self.seller_id
    }

    pub fn intent_id(&self) -> &IntentId {
        &self.intent_id
    }

    pub fn amount(&self) -> &Money {
        &self.amount
    }

    pub fn escrow(&self) -> EscrowState {
        self.escrow
    }

    pub fn status(&self) -> TransactionStatus {
        self.escrow.status()
    }

    pub fn payment_status(&self) -> PaymentStatus {
        self.escrow.payment_status()
    }

    pub fn payment_method(&self) -> PaymentMethod {
        PaymentMethod::SecurePay
    }

    pub fn seller_confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.escrow.seller_confirmed_at()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.escrow.completed_at()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_party(&self, user: UserId) -> bool {
        self.buyer_id == user || self.seller_id == user
    }

    /// Copy of this row moved to `next`. Identity and intent stay fixed.
    pub fn with_state(&self, next: EscrowState, now: DateTime<Utc>) -> Self {
        Self {
            escrow: next,
            updated_at: now,
            ..self.clone()
        }
    }
}

/// Flat row form of a transaction, as stored and as returned to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    pub status: TransactionStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: Option<PaymentStatus>,
    pub gateway_intent_id: Option<IntentId>,
    pub amount_minor: i64,
    pub currency: String,
    pub seller_confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionRecord {
    fn from(txn: Transaction) -> Self {
        Self {
            id: txn.id,
            listing_id: txn.listing_id,
            buyer_id: txn.buyer_id,
            seller_id: txn.seller_id,
            status: txn.status(),
            payment_method: PaymentMethod::SecurePay,
            payment_status: Some(txn.payment_status()),
            seller_confirmed_at: txn.seller_confirmed_at(),
            completed_at: txn.completed_at(),
            gateway_intent_id: Some(txn.intent_id),
            amount_minor: txn.amount.amount_minor,
            currency: txn.amount.currency,
            created_at: txn.created_at,
            updated_at: txn.updated_at,
        }
    }
}

impl TryFrom<TransactionRecord> for Transaction {
    type Error = EscrowError;

    fn try_from(record: TransactionRecord) -> Result<Self, Self::Error> {
        if record.payment_method != PaymentMethod::SecurePay {
            return Err(EscrowError::validation(
                "Cash transactions are not escrow transactions",
            ));
        }
        if record.buyer_id == record.seller_id {
            return Err(EscrowError::validation("Buyer and seller must differ"));
        }
        let payment_status = record
            .payment_status
            .ok_or_else(|| EscrowError::validation("Secure-Pay row without payment status"))?;
        let intent_id = record
            .gateway_intent_id
            .ok_or_else(|| EscrowError::validation("Secure-Pay row without gateway intent"))?;
        let escrow = EscrowState::from_columns(
            record.status,
            payment_status,
            record.seller_confirmed_at,
            record.completed_at,
        )?;

        Ok(Self {
            id: record.id,
            listing_id: record.listing_id,
            buyer_id: record.buyer_id,
            seller_id: record.seller_id,
            intent_id,
            amount: Money::new(record.amount_minor, record.currency),
            escrow,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Listing fields the escrow core reads or flips
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub seller_id: UserId,
    pub title: String,
    /// Price in major currency units
    pub price: Decimal,
    pub is_sold: bool,
    pub is_boosted: bool,
    pub boosted_at: Option<DateTime<Utc>>,
    pub boosted_until: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn new<S: Into<String>>(id: ListingId, seller_id: UserId, title: S, price: Decimal) -> Self {
        Self {
            id,
            seller_id,
            title: title.into(),
            price,
            is_sold: false,
            is_boosted: false,
            boosted_at: None,
            boosted_until: None,
        }
    }

    /// Boosted and the window has not elapsed
    pub fn is_boost_active(&self, now: DateTime<Utc>) -> bool {
        self.is_boosted && self.boosted_until.is_some_and(|until| until > now)
    }

    /// Start or restart the boost window
    pub fn boost(&mut self, now: DateTime<Utc>, window: Duration) {
        self.is_boosted = true;
        self.boosted_at = Some(now);
        self.boosted_until = Some(now + window);
    }
}

/// Admin arbitration decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolveAction {
    /// Capture held funds for the seller
    Release,
    /// Refund the buyer
    Refund,
}

impl ResolveAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Refund => "refund",
        }
    }
}

impl FromStr for ResolveAction {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "release" => Ok(Self::Release),
            "refund" => Ok(Self::Refund),
            other => Err(EscrowError::validation(format!(
                "Invalid resolve action '{}': expected 'release' or 'refund'",
                other
            ))),
        }
    }
}

/// Write-once record of an admin resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub admin_id: UserId,
    pub action: ResolveAction,
    pub transaction_id: TransactionId,
    pub created_at: DateTime<Utc>,
}
