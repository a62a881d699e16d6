//! Listing boost - one-off paid promotion of a listing
//!
//! No custody here: the charge is captured immediately by the hosted page
//! and activation only checks that the session was paid.

use crate::{
    error::{EscrowError, GatewayError},
    escrow_engine::EscrowEngine,
    event_publisher::EscrowEvent,
    models::{Listing, ListingId, Money, UserId},
    payment_gateway::{CheckoutSession, CheckoutSessionRequest, SessionPaymentState},
    store::RowKey,
    EscrowResult,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for listing boosts
#[derive(Debug, Clone)]
pub struct BoostConfig {
    /// Fixed price in minor units
    pub price_minor: i64,
    pub currency: String,
    /// How long a boost lasts from activation
    pub window: chrono::Duration,
    pub frontend_url: String,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            price_minor: 200,
            currency: "cad".to_string(),
            window: chrono::Duration::hours(48),
            frontend_url: "http://localhost:5173".to_string(),
        }
    }
}

pub struct BoostService {
    config: BoostConfig,
    engine: Arc<EscrowEngine>,
}

impl BoostService {
    pub fn new(config: BoostConfig, engine: Arc<EscrowEngine>) -> Self {
        Self { config, engine }
    }

    async fn owned_listing(&self, listing_id: ListingId, seller_id: UserId) -> EscrowResult<Listing> {
        self.engine
            .store()
            .listing(listing_id)
            .await
            .filter(|listing| listing.seller_id == seller_id)
            .ok_or_else(|| EscrowError::not_found(format!("Listing {} not found", listing_id)))
    }

    /// Open a hosted page charging the boost price
    pub async fn create_session(
        &self,
        listing_id: ListingId,
        seller_id: UserId,
    ) -> EscrowResult<CheckoutSession> {
        let listing = self.owned_listing(listing_id, seller_id).await?;
        let frontend_url = self.config.frontend_url.trim_end_matches('/');

        let request = CheckoutSessionRequest {
            amount: Money::new(self.config.price_minor, self.config.currency.clone()),
            product_name: format!("Boost: {}", listing.title),
            description: format!(
                "Your listing appears at the top of Browse for {} hours",
                self.config.window.num_hours()
            ),
            manual_capture: false,
            success_url: format!(
                "{}?boost_success=1&listing_id={}&session_id={{CHECKOUT_SESSION_ID}}",
                frontend_url, listing_id
            ),
            cancel_url: format!("{}?boost_cancel=1", frontend_url),
            metadata: HashMap::from([
                ("listing_id".to_string(), listing_id.to_string()),
                ("user_id".to_string(), seller_id.to_string()),
            ]),
        };

        let session = self
            .engine
            .call_gateway(
                "create_checkout_session",
                self.engine.gateway().create_checkout_session(request),
            )
            .await?;
        info!(session_id = %session.id, "boost session created for listing {}", listing_id);
        Ok(session)
    }

    /// Verify the boost payment and (re)start the boost window. A new
    /// payment on an already boosted listing overwrites its expiry; a
    /// session that was already applied returns the listing unchanged.
    pub async fn activate(
        &self,
        listing_id: ListingId,
        session_id: &str,
        seller_id: UserId,
    ) -> EscrowResult<Listing> {
        let _guard = self.engine.store().lock_row(RowKey::Listing(listing_id)).await;
        self.owned_listing(listing_id, seller_id).await?;

        let session = self
            .engine
            .call_gateway(
                "retrieve_session",
                self.engine.gateway().retrieve_session(session_id),
            )
            .await?;

        if session.payment_state != SessionPaymentState::Paid {
            return Err(GatewayError::SessionNotReady(session_id.to_string()).into());
        }
        let listing_matches =
            session.metadata_value("listing_id") == Some(listing_id.to_string().as_str());
        let payer_matches =
            session.metadata_value("user_id") == Some(seller_id.to_string().as_str());
        if !listing_matches || !payer_matches {
            warn!(
                session_id = %session_id,
                "boost session does not belong to seller {} and listing {}",
                seller_id,
                listing_id
            );
            return Err(EscrowError::authorization("Session mismatch"));
        }

        let (listing, fresh) = self
            .engine
            .store()
            .boost_listing(listing_id, session_id, Utc::now(), self.config.window)
            .await?;

        match listing.boosted_until {
            Some(until) if fresh => {
                info!("listing {} boosted until {}", listing_id, until);
                self.engine.events().publish(EscrowEvent::boosted(listing_id, until));
            }
            _ => debug!(session_id = %session_id, "boost session already applied"),
        }

        Ok(listing)
    }
}
