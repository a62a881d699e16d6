//! Custodial escrow backend for a peer-to-peer marketplace
//!
//! This crate holds buyer funds with an external payment gateway until the
//! buyer confirms receipt, with a dispute path that refunds automatically
//! before the seller confirms handoff and escalates to an admin after:
//! - Manual-capture payment intents as the escrow primitive
//! - Per-row locking with compare-and-commit so money moves at most once
//! - Fire-and-forget events for notification services
//! - A reconciliation pass that repairs drift from gateway truth

pub mod arbitration;
pub mod boost;
pub mod checkout;
pub mod error;
pub mod escrow_engine;
pub mod event_publisher;
pub mod mock_gateway;
pub mod models;
pub mod node;
pub mod payment_gateway;
pub mod pricing;
pub mod reconciler;
pub mod store;
pub mod stripe_gateway;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
