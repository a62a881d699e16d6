//! Payment gateway adapter contract
//!
//! A narrow interface to an external custodial payment processor. The
//! adapter never touches local state; the lifecycle engine decides what
//! to commit based on whether a call succeeded.
//!
//! Capture, cancel and refund are idempotent per intent: calling them on
//! an intent that already reached the requested settled state succeeds.

use crate::error::GatewayError;
use crate::models::{IntentId, Money};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Request to place a hold on buyer funds
#[derive(Debug, Clone)]
pub struct HoldRequest {
    pub amount: Money,
    /// Stable key so a retried authorization reuses the same hold
    pub idempotency_key: String,
    /// Saved payment method to charge
    pub payment_method: String,
    pub description: String,
}

/// Gateway-side state of a payment intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Not yet authorized by the customer
    Pending,
    /// Authorized and held, awaiting capture
    RequiresCapture,
    Captured,
    Canceled,
    Refunded,
}

/// Hosted checkout page request
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub amount: Money,
    pub product_name: String,
    pub description: String,
    /// Authorize only (escrow) instead of charging immediately
    pub manual_capture: bool,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

/// Redirectable hosted checkout page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Payment progress of a checkout session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPaymentState {
    Unpaid,
    /// Manual-capture session whose intent is held
    Authorized,
    /// Immediate-capture session that charged successfully
    Paid,
}

/// Checkout session as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDetails {
    pub id: String,
    pub payment_state: SessionPaymentState,
    pub intent_id: Option<IntentId>,
    /// Amount the customer authorized or paid
    pub amount: Option<Money>,
    pub metadata: HashMap<String, String>,
}

impl SessionDetails {
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Place a manual-capture hold and return its intent id
    async fn authorize_hold(&self, request: HoldRequest) -> GatewayResult<IntentId>;

    /// Irrevocably transfer held funds
    async fn capture(&self, intent_id: &IntentId) -> GatewayResult<()>;

    /// Release an uncaptured hold back to the buyer
    async fn cancel(&self, intent_id: &IntentId) -> GatewayResult<()>;

    /// Return funds to the buyer. Uncaptured holds are cancelled instead.
    async fn refund(&self, intent_id: &IntentId) -> GatewayResult<()>;

    async fn intent_status(&self, intent_id: &IntentId) -> GatewayResult<IntentStatus>;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> GatewayResult<CheckoutSession>;

    async fn retrieve_session(&self, session_id: &str) -> GatewayResult<SessionDetails>;
}
