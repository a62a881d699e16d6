//! Checkout boundary - hosted Secure-Pay checkout and session activation
//!
//! The buyer is sent to a manual-capture hosted payment page. When they
//! come back, `activate` verifies the session with the gateway and turns
//! the authorized intent into a HELD escrow row.

use crate::{
    error::{EscrowError, GatewayError},
    escrow_engine::{AuthorizeOutcome, EscrowEngine, HoldSource},
    models::{ListingId, Transaction, UserId},
    payment_gateway::{CheckoutSession, CheckoutSessionRequest, SessionPaymentState},
    EscrowResult,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Configuration for the checkout boundary
#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Where the hosted page redirects back to
    pub frontend_url: String,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            frontend_url: "http://localhost:5173".to_string(),
        }
    }
}

/// Response of `create_checkout`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckoutQuote {
    pub checkout_session: CheckoutSession,
    /// Price plus fee, major units
    pub amount: Decimal,
    pub fee: Decimal,
}

/// Open escrow row on a listing as seen by one of its parties
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTransaction {
    pub transaction: Transaction,
    pub is_buyer: bool,
    pub is_seller: bool,
}

pub struct CheckoutService {
    config: CheckoutConfig,
    engine: Arc<EscrowEngine>,
}

impl CheckoutService {
    pub fn new(config: CheckoutConfig, engine: Arc<EscrowEngine>) -> Self {
        Self { config, engine }
    }

    /// Quote the escrow amount and open a manual-capture hosted page
    pub async fn create_checkout(
        &self,
        listing_id: ListingId,
        buyer_id: UserId,
    ) -> EscrowResult<CheckoutQuote> {
        let listing = self
            .engine
            .store()
            .listing(listing_id)
            .await
            .filter(|listing| !listing.is_sold)
            .ok_or_else(|| EscrowError::not_found(format!("Listing {} not found", listing_id)))?;
        if listing.seller_id == buyer_id {
            return Err(EscrowError::validation("Cannot buy your own listing"));
        }

        let quote = self.engine.config().fees.quote(listing.price)?;
        let frontend_url = self.config.frontend_url.trim_end_matches('/');

        let metadata = HashMap::from([
            ("listing_id".to_string(), listing_id.to_string()),
            ("buyer_id".to_string(), buyer_id.to_string()),
            ("seller_id".to_string(), listing.seller_id.to_string()),
        ]);
        let request = CheckoutSessionRequest {
            amount: quote.amount.clone(),
            product_name: listing.title.clone(),
            description: format!(
                "Secure-Pay escrow (includes {}% service fee of ${})",
                self.engine.config().fees.percent,
                quote.fee
            ),
            manual_capture: true,
            success_url: format!(
                "{}?secure_pay_success=1&listing_id={}&session_id={{CHECKOUT_SESSION_ID}}",
                frontend_url, listing_id
            ),
            cancel_url: format!("{}?secure_pay_cancel=1", frontend_url),
            metadata,
        };

        let session = self
            .engine
            .call_gateway(
                "create_checkout_session",
                self.engine.gateway().create_checkout_session(request),
            )
            .await?;

        info!(
            session_id = %session.id,
            "checkout session created for listing {} by buyer {}",
            listing_id,
            buyer_id
        );

        Ok(CheckoutQuote {
            checkout_session: session,
            amount: quote.total,
            fee: quote.fee,
        })
    }

    /// Turn an authorized checkout session into a HELD escrow row.
    /// Re-activating while the row is HELD returns it unchanged.
    pub async fn activate(
        &self,
        listing_id: ListingId,
        session_id: &str,
        buyer_id: UserId,
    ) -> EscrowResult<AuthorizeOutcome> {
        if session_id.trim().is_empty() {
            return Err(EscrowError::validation("Session id is required"));
        }

        let session = self
            .engine
            .call_gateway(
                "retrieve_session",
                self.engine.gateway().retrieve_session(session_id),
            )
            .await?;

        let intent_id = match (session.payment_state, session.intent_id.clone()) {
            (SessionPaymentState::Authorized, Some(intent_id)) => intent_id,
            _ => {
                return Err(GatewayError::SessionNotReady(session_id.to_string()).into())
            }
        };

        let buyer_matches = session.metadata_value("buyer_id") == Some(buyer_id.to_string().as_str());
        let listing_matches =
            session.metadata_value("listing_id") == Some(listing_id.to_string().as_str());
        if !buyer_matches || !listing_matches {
            warn!(
                session_id = %session_id,
                "checkout session does not belong to buyer {} and listing {}",
                buyer_id,
                listing_id
            );
            return Err(EscrowError::authorization("Session mismatch"));
        }

        let amount = session.amount.clone().ok_or_else(|| {
            GatewayError::invalid_response(format!("session {} reports no amount", session_id))
        })?;

        self.engine
            .authorize(
                listing_id,
                buyer_id,
                HoldSource::AuthorizedIntent { intent_id, amount },
            )
            .await
    }

    /// The open escrow row on a listing where `user` is buyer or seller
    pub async fn active_for(
        &self,
        listing_id: ListingId,
        user: UserId,
    ) -> EscrowResult<Option<ActiveTransaction>> {
        let active = self.engine.store().active_for(listing_id, user).await?;
        Ok(active.map(|transaction| ActiveTransaction {
            is_buyer: transaction.buyer_id() == user,
            is_seller: transaction.seller_id() == user,
            transaction,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow_engine::EscrowEngineConfig;
    use crate::event_publisher::EventPublisher;
    use crate::mock_gateway::MockGateway;
    use crate::models::Listing;
    use crate::payment_gateway::PaymentGateway;
    use crate::store::TransactionStore;

    const SELLER: UserId = UserId(1);
    const BUYER: UserId = UserId(2);
    const LISTING: ListingId = ListingId(10);

    async fn setup() -> (CheckoutService, Arc<MockGateway>) {
        let store = Arc::new(TransactionStore::new());
        store
            .upsert_listing(Listing::new(LISTING, SELLER, "Desk lamp", Decimal::new(2500, 2)))
            .await;
        let gateway = Arc::new(MockGateway::new());
        let engine = Arc::new(EscrowEngine::new(
            EscrowEngineConfig::default(),
            store,
            gateway.clone(),
            EventPublisher::default(),
        ));
        (CheckoutService::new(CheckoutConfig::default(), engine), gateway)
    }

    #[tokio::test]
    async fn test_create_checkout_quotes_fee() {
        let (checkout, gateway) = setup().await;
        let quote = checkout.create_checkout(LISTING, BUYER).await.unwrap();

        assert_eq!(quote.fee, Decimal::new(175, 2));
        assert_eq!(quote.amount, Decimal::new(2675, 2));
        let details = gateway
            .retrieve_session(&quote.checkout_session.id)
            .await
            .unwrap();
        assert_eq!(details.metadata_value("buyer_id"), Some("2"));
        assert_eq!(details.metadata_value("seller_id"), Some("1"));
    }

    #[tokio::test]
    async fn test_create_checkout_rejects_own_listing() {
        let (checkout, _gateway) = setup().await;
        let err = checkout.create_checkout(LISTING, SELLER).await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn test_activate_before_payment_is_not_ready() {
        let (checkout, _gateway) = setup().await;
        let quote = checkout.create_checkout(LISTING, BUYER).await.unwrap();

        let err = checkout
            .activate(LISTING, &quote.checkout_session.id, BUYER)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PAYMENT_NOT_COMPLETED");
    }

    #[tokio::test]
    async fn test_activate_then_active_for_both_parties() {
        let (checkout, gateway) = setup().await;
        let quote = checkout.create_checkout(LISTING, BUYER).await.unwrap();
        let intent_id = gateway.complete_session(&quote.checkout_session.id).unwrap();

        let outcome = checkout
            .activate(LISTING, &quote.checkout_session.id, BUYER)
            .await
            .unwrap();
        assert!(!outcome.already_exists);
        assert_eq!(outcome.transaction.intent_id(), &intent_id);
        assert_eq!(
            Some(outcome.transaction.amount().clone()),
            gateway.intent_amount(&intent_id)
        );

        let again = checkout
            .activate(LISTING, &quote.checkout_session.id, BUYER)
            .await
            .unwrap();
        assert!(again.already_exists);
        assert_eq!(again.transaction.id(), outcome.transaction.id());

        let for_seller = checkout.active_for(LISTING, SELLER).await.unwrap().unwrap();
        assert!(for_seller.is_seller && !for_seller.is_buyer);
        assert!(checkout.active_for(LISTING, UserId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activate_after_reprice_is_rejected() {
        let (checkout, gateway) = setup().await;
        let quote = checkout.create_checkout(LISTING, BUYER).await.unwrap();
        let intent_id = gateway.complete_session(&quote.checkout_session.id).unwrap();

        checkout
            .engine
            .store()
            .sync_listing(Listing::new(LISTING, SELLER, "Desk lamp", Decimal::new(5000, 2)))
            .await;

        let err = checkout
            .activate(LISTING, &quote.checkout_session.id, BUYER)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
        assert!(checkout.active_for(LISTING, BUYER).await.unwrap().is_none());
        assert_eq!(gateway.intent_amount(&intent_id).unwrap().amount_minor, 2675);
    }
}
