//! Stripe-compatible HTTP gateway
//!
//! Form-encoded calls against `/v1/payment_intents`, `/v1/refunds` and
//! `/v1/checkout/sessions`. Escrow holds are manual-capture intents.
//! When a settle call fails, the intent is re-read so an intent that
//! already reached the requested state reports success.

use crate::error::GatewayError;
use crate::models::{IntentId, Money};
use crate::payment_gateway::{
    CheckoutSession, CheckoutSessionRequest, GatewayResult, HoldRequest, IntentStatus,
    PaymentGateway, SessionDetails, SessionPaymentState,
};
use reqwest::RequestBuilder;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the Stripe gateway
#[derive(Debug, Clone)]
pub struct StripeGatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for StripeGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.stripe.com".to_string(),
            secret_key: String::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct StripeGateway {
    config: StripeGatewayConfig,
    client: reqwest::Client,
}

impl StripeGateway {
    pub fn new(config: StripeGatewayConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: RequestBuilder) -> GatewayResult<Value> {
        if self.config.secret_key.is_empty() {
            return Err(GatewayError::NotConfigured);
        }

        let response = request
            .bearer_auth(&self.config.secret_key)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::invalid_response(e.to_string()))?;

        if status.is_success() {
            return Ok(body);
        }

        let error = &body["error"];
        let code = error["code"]
            .as_str()
            .or_else(|| error["type"].as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("HTTP_{}", status.as_u16()));
        let message = error["message"]
            .as_str()
            .unwrap_or("request failed")
            .chars()
            .take(200)
            .collect::<String>();
        Err(GatewayError::declined(code, message))
    }

    async fn post(&self, path: &str, form: &[(String, String)]) -> GatewayResult<Value> {
        self.send(self.client.post(self.url(path)).form(form)).await
    }

    async fn retrieve_intent(&self, intent_id: &IntentId) -> GatewayResult<Value> {
        let path = format!("/v1/payment_intents/{}", intent_id);
        self.send(
            self.client
                .get(self.url(&path))
                .query(&[("expand[]", "latest_charge")]),
        )
        .await
    }

    /// Treat a failed settle call as success when the intent already sits
    /// in the requested state.
    async fn settled_or(
        &self,
        intent_id: &IntentId,
        wanted: IntentStatus,
        err: GatewayError,
    ) -> GatewayResult<()> {
        if matches!(err, GatewayError::Timeout | GatewayError::NotConfigured) {
            return Err(err);
        }
        match self.intent_status(intent_id).await {
            Ok(status) if status == wanted => {
                debug!(intent_id = %intent_id, ?status, "intent already settled");
                Ok(())
            }
            _ => Err(err),
        }
    }
}

fn intent_status_of(intent: &Value) -> GatewayResult<IntentStatus> {
    let status = intent["status"]
        .as_str()
        .ok_or_else(|| GatewayError::invalid_response("payment intent without status"))?;

    let mapped = match status {
        "requires_capture" => IntentStatus::RequiresCapture,
        "canceled" => IntentStatus::Canceled,
        "succeeded" => {
            if intent["latest_charge"]["refunded"].as_bool() == Some(true) {
                IntentStatus::Refunded
            } else {
                IntentStatus::Captured
            }
        }
        _ => IntentStatus::Pending,
    };
    Ok(mapped)
}

fn id_of(value: &Value) -> Option<String> {
    value
        .as_str()
        .or_else(|| value["id"].as_str())
        .map(ToString::to_string)
}

fn pair<K: Into<String>, V: Into<String>>(key: K, value: V) -> (String, String) {
    (key.into(), value.into())
}

#[async_trait::async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn authorize_hold(&self, request: HoldRequest) -> GatewayResult<IntentId> {
        let form = vec![
            pair("amount", request.amount.amount_minor.to_string()),
            pair("currency", request.amount.currency.clone()),
            pair("capture_method", "manual"),
            pair("confirm", "true"),
            pair("payment_method", request.payment_method.clone()),
            pair("description", request.description.clone()),
            pair("automatic_payment_methods[enabled]", "true"),
            pair("automatic_payment_methods[allow_redirects]", "never"),
        ];

        let intent = self
            .send(
                self.client
                    .post(self.url("/v1/payment_intents"))
                    .header("Idempotency-Key", &request.idempotency_key)
                    .form(&form),
            )
            .await?;

        let intent_id = id_of(&intent)
            .map(IntentId)
            .ok_or_else(|| GatewayError::invalid_response("payment intent without id"))?;

        match intent_status_of(&intent)? {
            IntentStatus::RequiresCapture => Ok(intent_id),
            other => {
                warn!(intent_id = %intent_id, ?other, "hold was not authorized");
                Err(GatewayError::declined(
                    "authorization_failed",
                    format!("Payment intent {} is {:?}", intent_id, other),
                ))
            }
        }
    }

    async fn capture(&self, intent_id: &IntentId) -> GatewayResult<()> {
        let path = format!("/v1/payment_intents/{}/capture", intent_id);
        match self.post(&path, &[]).await {
            Ok(_) => Ok(()),
            Err(err) => self.settled_or(intent_id, IntentStatus::Captured, err).await,
        }
    }

    async fn cancel(&self, intent_id: &IntentId) -> GatewayResult<()> {
        let path = format!("/v1/payment_intents/{}/cancel", intent_id);
        match self.post(&path, &[]).await {
            Ok(_) => Ok(()),
            Err(err) => self.settled_or(intent_id, IntentStatus::Canceled, err).await,
        }
    }

    async fn refund(&self, intent_id: &IntentId) -> GatewayResult<()> {
        match self.intent_status(intent_id).await? {
            IntentStatus::Refunded | IntentStatus::Canceled => Ok(()),
            IntentStatus::RequiresCapture | IntentStatus::Pending => self.cancel(intent_id).await,
            IntentStatus::Captured => {
                let form = [pair("payment_intent", intent_id.as_str())];
                match self.post("/v1/refunds", &form).await {
                    Ok(_) => Ok(()),
                    Err(err) => self.settled_or(intent_id, IntentStatus::Refunded, err).await,
                }
            }
        }
    }

    async fn intent_status(&self, intent_id: &IntentId) -> GatewayResult<IntentStatus> {
        let intent = self.retrieve_intent(intent_id).await?;
        intent_status_of(&intent)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> GatewayResult<CheckoutSession> {
        let mut form = vec![
            pair("mode", "payment"),
            pair("payment_method_types[0]", "card"),
            pair("line_items[0][quantity]", "1"),
            pair("line_items[0][price_data][currency]", request.amount.currency.clone()),
            pair(
                "line_items[0][price_data][unit_amount]",
                request.amount.amount_minor.to_string(),
            ),
            pair("line_items[0][price_data][product_data][name]", request.product_name.clone()),
            pair(
                "line_items[0][price_data][product_data][description]",
                request.description.clone(),
            ),
            pair("success_url", request.success_url.clone()),
            pair("cancel_url", request.cancel_url.clone()),
        ];
        if request.manual_capture {
            form.push(pair("payment_intent_data[capture_method]", "manual"));
        }
        for (key, value) in &request.metadata {
            form.push(pair(format!("metadata[{}]", key), value.clone()));
        }

        let session = self.post("/v1/checkout/sessions", &form).await?;
        let id = id_of(&session)
            .ok_or_else(|| GatewayError::invalid_response("checkout session without id"))?;
        let url = session["url"]
            .as_str()
            .ok_or_else(|| GatewayError::invalid_response("checkout session without url"))?
            .to_string();

        Ok(CheckoutSession { id, url })
    }

    async fn retrieve_session(&self, session_id: &str) -> GatewayResult<SessionDetails> {
        let path = format!("/v1/checkout/sessions/{}", session_id);
        let session = self
            .send(
                self.client
                    .get(self.url(&path))
                    .query(&[("expand[]", "payment_intent")]),
            )
            .await?;

        let intent = &session["payment_intent"];
        let intent_id = id_of(intent).map(IntentId);
        let payment_state = if intent["status"].as_str() == Some("requires_capture") {
            SessionPaymentState::Authorized
        } else if session["payment_status"].as_str() == Some("paid") {
            SessionPaymentState::Paid
        } else {
            SessionPaymentState::Unpaid
        };

        // the intent carries the held amount; the session total covers paid sessions
        let amount = money_of(intent, "amount").or_else(|| money_of(&session, "amount_total"));

        let metadata = session["metadata"]
            .as_object()
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();

        Ok(SessionDetails {
            id: session_id.to_string(),
            payment_state,
            intent_id,
            amount,
            metadata,
        })
    }
}

fn money_of(value: &Value, amount_key: &str) -> Option<Money> {
    let amount_minor = value[amount_key].as_i64()?;
    let currency = value["currency"].as_str()?;
    Some(Money::new(amount_minor, currency.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_intent_status_mapping() {
        let held = json!({ "id": "pi_1", "status": "requires_capture" });
        assert_eq!(intent_status_of(&held).unwrap(), IntentStatus::RequiresCapture);

        let captured = json!({ "status": "succeeded", "latest_charge": { "refunded": false } });
        assert_eq!(intent_status_of(&captured).unwrap(), IntentStatus::Captured);

        let refunded = json!({ "status": "succeeded", "latest_charge": { "refunded": true } });
        assert_eq!(intent_status_of(&refunded).unwrap(), IntentStatus::Refunded);

        let pending = json!({ "status": "requires_payment_method" });
        assert_eq!(intent_status_of(&pending).unwrap(), IntentStatus::Pending);

        assert!(intent_status_of(&json!({})).is_err());
    }

    #[test]
    fn test_id_of_accepts_string_or_object() {
        assert_eq!(id_of(&json!("pi_1")), Some("pi_1".to_string()));
        assert_eq!(id_of(&json!({ "id": "pi_2" })), Some("pi_2".to_string()));
        assert_eq!(id_of(&Value::Null), None);
    }

    #[test]
    fn test_money_of_reads_held_amount() {
        let intent = json!({ "id": "pi_1", "amount": 10700, "currency": "CAD" });
        assert_eq!(money_of(&intent, "amount"), Some(Money::new(10700, "cad")));
        assert_eq!(money_of(&json!("pi_1"), "amount"), None);

        let session = json!({ "amount_total": 200, "currency": "cad" });
        assert_eq!(money_of(&session, "amount_total"), Some(Money::new(200, "cad")));
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_refuses_calls() {
        let gateway = StripeGateway::new(StripeGatewayConfig::default());
        let result = gateway.capture(&IntentId("pi_1".to_string())).await;
        assert_eq!(result, Err(GatewayError::NotConfigured));
    }
}
