pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::Router;
use escrow_engine::arbitration::StaticAdminRegistry;
use escrow_engine::event_publisher::{EventPublisher, EventPublisherConfig, TracingSink, WebhookSink};
use escrow_engine::mock_gateway::MockGateway;
use escrow_engine::models::UserId;
use escrow_engine::node::EscrowNode;
use escrow_engine::payment_gateway::PaymentGateway;
use escrow_engine::stripe_gateway::StripeGateway;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::{AppConfig, GatewayKind};

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<EscrowNode>,
}

/// Wire the escrow node from configuration
pub fn build_node(cfg: &AppConfig) -> EscrowNode {
    let gateway: Arc<dyn PaymentGateway> = match cfg.gateway.kind {
        GatewayKind::Stripe => Arc::new(StripeGateway::new(cfg.stripe_config())),
        GatewayKind::Mock => {
            warn!("using the mock payment gateway; no real money moves");
            Arc::new(MockGateway::new())
        }
    };

    let mut events =
        EventPublisher::new(EventPublisherConfig::default()).with_sink(Arc::new(TracingSink));
    for url in &cfg.webhooks.urls {
        events = events.with_sink(Arc::new(WebhookSink::new(
            url.clone(),
            cfg.webhooks.secret.clone(),
        )));
    }

    let admins = StaticAdminRegistry::new(cfg.admin_ids.iter().copied().map(UserId));
    EscrowNode::new(cfg.node_config(), gateway, Arc::new(admins), events)
}

async fn require_internal_api_key(
    State(expected): State<String>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("X-Internal-Api-Key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    if provided.is_empty() || provided != expected {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    next.run(request).await
}

pub fn router(state: AppState, internal_api_key: String) -> Router {
    let secure_pay = Router::new()
        .route("/create-session", post(routes::create_checkout))
        .route("/activate", post(routes::activate_checkout))
        .route("/authorize", post(routes::authorize))
        .route("/listing/:listing_id", get(routes::active_for_listing))
        .route("/:transaction_id", get(routes::transaction_info))
        .route("/:transaction_id/confirm-handoff", post(routes::confirm_handoff))
        .route("/:transaction_id/confirm-receipt", post(routes::confirm_receipt))
        .route("/:transaction_id/dispute", post(routes::dispute));

    let boost = Router::new()
        .route("/create-session", post(routes::create_boost_session))
        .route("/activate", post(routes::activate_boost));

    let internal = Router::new()
        .route("/listings/:listing_id", put(routes::upsert_listing))
        .layer(from_fn_with_state(internal_api_key, require_internal_api_key));

    Router::new()
        .route("/health", get(routes::health))
        .nest("/api/payments/secure-pay", secure_pay)
        .nest("/api/payments/boost", boost)
        .route(
            "/api/admin/transactions/:transaction_id/resolve",
            post(routes::resolve),
        )
        .nest("/api/internal", internal)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
