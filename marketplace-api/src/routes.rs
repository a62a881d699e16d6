use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use escrow_engine::checkout::{ActiveTransaction, CheckoutQuote};
use escrow_engine::escrow_engine::{AuthorizeOutcome, DisputeResult, HandoffOutcome};
use escrow_engine::models::{Listing, ListingId, Transaction, TransactionId, UserId};
use escrow_engine::node::TransactionInfo;
use escrow_engine::payment_gateway::CheckoutSession;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

/// Caller identity, set by the upstream session layer
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub UserId);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("X-User-Id")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(|id| CurrentUser(UserId(id)))
            .ok_or(ApiError::Unauthenticated)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListingRequest {
    pub listing_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub listing_id: i64,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub listing_id: i64,
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct UpsertListingRequest {
    pub seller_id: i64,
    pub title: String,
    pub price: Decimal,
    #[serde(default)]
    pub is_sold: bool,
}

#[derive(Debug, Serialize)]
pub struct BoostActivated {
    pub success: bool,
    pub listing: Listing,
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn create_checkout(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ListingRequest>,
) -> Result<Json<CheckoutQuote>, ApiError> {
    let quote = state
        .node
        .create_checkout(ListingId(req.listing_id), user)
        .await?;
    Ok(Json(quote))
}

pub async fn activate_checkout(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<SessionRequest>,
) -> Result<Json<AuthorizeOutcome>, ApiError> {
    let outcome = state
        .node
        .activate_checkout(ListingId(req.listing_id), &req.session_id, user)
        .await?;
    Ok(Json(outcome))
}

/// Hold against a saved payment method instead of the hosted page
pub async fn authorize(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<AuthorizeRequest>,
) -> Result<Json<AuthorizeOutcome>, ApiError> {
    let outcome = state
        .node
        .authorize(ListingId(req.listing_id), user, req.payment_method)
        .await?;
    Ok(Json(outcome))
}

pub async fn active_for_listing(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(listing_id): Path<i64>,
) -> Result<Json<Option<ActiveTransaction>>, ApiError> {
    let active = state.node.active_for(ListingId(listing_id), user).await?;
    Ok(Json(active))
}

pub async fn transaction_info(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<TransactionInfo>, ApiError> {
    let info = state
        .node
        .transaction_info(TransactionId(transaction_id), user)
        .await?;
    Ok(Json(info))
}

pub async fn confirm_handoff(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<HandoffOutcome>, ApiError> {
    let outcome = state
        .node
        .confirm_handoff(TransactionId(transaction_id), user)
        .await?;
    Ok(Json(outcome))
}

pub async fn confirm_receipt(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<Transaction>, ApiError> {
    let txn = state
        .node
        .confirm_receipt(TransactionId(transaction_id), user)
        .await?;
    Ok(Json(txn))
}

pub async fn dispute(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(transaction_id): Path<Uuid>,
) -> Result<Json<DisputeResult>, ApiError> {
    let result = state
        .node
        .dispute(TransactionId(transaction_id), user)
        .await?;
    Ok(Json(result))
}

pub async fn resolve(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(transaction_id): Path<Uuid>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Transaction>, ApiError> {
    let txn = state
        .node
        .resolve(TransactionId(transaction_id), user, &req.action)
        .await?;
    Ok(Json(txn))
}

pub async fn create_boost_session(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<ListingRequest>,
) -> Result<Json<CheckoutSession>, ApiError> {
    let session = state
        .node
        .create_boost_session(ListingId(req.listing_id), user)
        .await?;
    Ok(Json(session))
}

pub async fn activate_boost(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<SessionRequest>,
) -> Result<Json<BoostActivated>, ApiError> {
    let listing = state
        .node
        .activate_boost(ListingId(req.listing_id), &req.session_id, user)
        .await?;
    Ok(Json(BoostActivated {
        success: true,
        listing,
    }))
}

/// Listing sync from the listing service. Sale and boost flags already
/// set by escrow are never cleared.
pub async fn upsert_listing(
    State(state): State<AppState>,
    Path(listing_id): Path<i64>,
    Json(req): Json<UpsertListingRequest>,
) -> Result<Json<Listing>, ApiError> {
    let mut update = Listing::new(
        ListingId(listing_id),
        UserId(req.seller_id),
        req.title,
        req.price,
    );
    update.is_sold = req.is_sold;
    let listing = state.node.sync_listing(update).await;
    Ok(Json(listing))
}
