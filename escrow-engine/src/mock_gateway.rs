//! In-memory payment gateway
//!
//! Simulates holds, captures, cancellations, refunds and hosted checkout
//! sessions without a network. Every call is recorded so tests can assert
//! exactly which upstream operations ran, and failures or latency can be
//! injected per operation.

use crate::error::GatewayError;
use crate::models::{IntentId, Money};
use crate::payment_gateway::{
    CheckoutSession, CheckoutSessionRequest, GatewayResult, HoldRequest, IntentStatus,
    PaymentGateway, SessionDetails, SessionPaymentState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Gateway operation, used for call recording and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    AuthorizeHold,
    Capture,
    Cancel,
    Refund,
    IntentStatus,
    CreateSession,
    RetrieveSession,
}

/// One recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub op: GatewayOp,
    pub intent_id: Option<IntentId>,
}

#[derive(Debug, Clone)]
struct MockIntent {
    status: IntentStatus,
    amount: Money,
}

#[derive(Debug, Clone)]
struct MockSession {
    amount: Money,
    manual_capture: bool,
    details: SessionDetails,
}

#[derive(Debug, Default)]
struct MockState {
    intents: HashMap<IntentId, MockIntent>,
    holds_by_key: HashMap<String, IntentId>,
    /// Payment method and amount first sent under each idempotency key
    key_params: HashMap<String, (String, Money)>,
    sessions: HashMap<String, MockSession>,
    calls: Vec<GatewayCall>,
    failures: HashMap<GatewayOp, VecDeque<GatewayError>>,
    latency: Option<Duration>,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, op: GatewayOp, intent_id: Option<&IntentId>) {
        self.calls.push(GatewayCall {
            op,
            intent_id: intent_id.cloned(),
        });
    }

    /// Record the call and pop an injected failure, if any
    fn begin(&mut self, op: GatewayOp, intent_id: Option<&IntentId>) -> GatewayResult<()> {
        self.record(op, intent_id);
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn intent_mut(&mut self, intent_id: &IntentId) -> GatewayResult<&mut MockIntent> {
        self.intents.get_mut(intent_id).ok_or_else(|| {
            GatewayError::declined("resource_missing", format!("No such intent: {}", intent_id))
        })
    }
}

/// Gateway double with no network dependency
#[derive(Debug, Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `op` with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next(&self, op: GatewayOp, error: GatewayError) {
        self.state().failures.entry(op).or_default().push_back(error);
    }

    /// Delay every call. The effect is applied before the delay, like an
    /// upstream that succeeds but answers slowly.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn calls_for(&self, op: GatewayOp) -> Vec<GatewayCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    pub fn intent(&self, intent_id: &IntentId) -> Option<IntentStatus> {
        self.state().intents.get(intent_id).map(|intent| intent.status)
    }

    pub fn intent_amount(&self, intent_id: &IntentId) -> Option<Money> {
        self.state()
            .intents
            .get(intent_id)
            .map(|intent| intent.amount.clone())
    }

    /// Force an intent's upstream state, as if changed out-of-band
    pub fn set_intent_status(&self, intent_id: &IntentId, status: IntentStatus) {
        if let Some(intent) = self.state().intents.get_mut(intent_id) {
            intent.status = status;
        }
    }

    /// Simulate the customer finishing the hosted payment page. Manual
    /// capture sessions end `Authorized` with a held intent, the rest
    /// end `Paid`.
    pub fn complete_session(&self, session_id: &str) -> Option<IntentId> {
        let mut state = self.state();
        let n = state.next_id();
        let session = state.sessions.get_mut(session_id)?;

        let intent_id = IntentId(format!("pi_mock_{}", n));
        let (intent_status, payment_state) = if session.manual_capture {
            (IntentStatus::RequiresCapture, SessionPaymentState::Authorized)
        } else {
            (IntentStatus::Captured, SessionPaymentState::Paid)
        };
        session.details.payment_state = payment_state;
        session.details.intent_id = Some(intent_id.clone());
        let amount = session.amount.clone();

        state.intents.insert(
            intent_id.clone(),
            MockIntent {
                status: intent_status,
                amount,
            },
        );
        Some(intent_id)
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait::async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn authorize_hold(&self, request: HoldRequest) -> GatewayResult<IntentId> {
        let intent_id = {
            let mut state = self.state();
            // keys are bound to their first parameters, even when that request failed
            let params = (request.payment_method.clone(), request.amount.clone());
            let conflict = state
                .key_params
                .get(&request.idempotency_key)
                .map(|first| *first != params);
            match conflict {
                Some(true) => {
                    state.record(GatewayOp::AuthorizeHold, None);
                    return Err(GatewayError::declined(
                        "idempotency_key_in_use",
                        "Idempotency key was already used with different parameters",
                    ));
                }
                Some(false) => {}
                None => {
                    state
                        .key_params
                        .insert(request.idempotency_key.clone(), params);
                }
            }
            state.begin(GatewayOp::AuthorizeHold, None)?;

            if let Some(existing) = state.holds_by_key.get(&request.idempotency_key) {
                existing.clone()
            } else {
                if request.payment_method.trim().is_empty() {
                    return Err(GatewayError::declined(
                        "payment_method_required",
                        "A payment method is required to place a hold",
                    ));
                }
                let intent_id = IntentId(format!("pi_mock_{}", state.next_id()));
                state.intents.insert(
                    intent_id.clone(),
                    MockIntent {
                        status: IntentStatus::RequiresCapture,
                        amount: request.amount,
                    },
                );
                state
                    .holds_by_key
                    .insert(request.idempotency_key, intent_id.clone());
                intent_id
            }
        };
        self.delay().await;
        Ok(intent_id)
    }

    async fn capture(&self, intent_id: &IntentId) -> GatewayResult<()> {
        {
            let mut state = self.state();
            state.begin(GatewayOp::Capture, Some(intent_id))?;
            let intent = state.intent_mut(intent_id)?;
            match intent.status {
                IntentStatus::RequiresCapture => intent.status = IntentStatus::Captured,
                IntentStatus::Captured => {}
                other => {
                    return Err(GatewayError::declined(
                        "payment_intent_unexpected_state",
                        format!("Cannot capture intent in state {:?}", other),
                    ))
                }
            }
        }
        self.delay().await;
        Ok(())
    }

    async fn cancel(&self, intent_id: &IntentId) -> GatewayResult<()> {
        {
            let mut state = self.state();
            state.begin(GatewayOp::Cancel, Some(intent_id))?;
            let intent = state.intent_mut(intent_id)?;
            match intent.status {
                IntentStatus::Pending | IntentStatus::RequiresCapture => {
                    intent.status = IntentStatus::Canceled
                }
                IntentStatus::Canceled => {}
                other => {
                    return Err(GatewayError::declined(
                        "payment_intent_unexpected_state",
                        format!("Cannot cancel intent in state {:?}", other),
                    ))
                }
            }
        }
        self.delay().await;
        Ok(())
    }

    async fn refund(&self, intent_id: &IntentId) -> GatewayResult<()> {
        {
            let mut state = self.state();
            state.begin(GatewayOp::Refund, Some(intent_id))?;
            let intent = state.intent_mut(intent_id)?;
            match intent.status {
                IntentStatus::Captured => intent.status = IntentStatus::Refunded,
                IntentStatus::RequiresCapture => intent.status = IntentStatus::Canceled,
                IntentStatus::Refunded | IntentStatus::Canceled => {}
                IntentStatus::Pending => {
                    return Err(GatewayError::declined(
                        "payment_intent_unexpected_state",
                        "Cannot refund an unauthorized intent",
                    ))
                }
            }
        }
        self.delay().await;
        Ok(())
    }

    async fn intent_status(&self, intent_id: &IntentId) -> GatewayResult<IntentStatus> {
        let status = {
            let mut state = self.state();
            state.begin(GatewayOp::IntentStatus, Some(intent_id))?;
            state.intent_mut(intent_id)?.status
        };
        self.delay().await;
        Ok(status)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> GatewayResult<CheckoutSession> {
        let session = {
            let mut state = self.state();
            state.begin(GatewayOp::CreateSession, None)?;
            let id = format!("cs_mock_{}", state.next_id());
            state.sessions.insert(
                id.clone(),
                MockSession {
                    amount: request.amount.clone(),
                    manual_capture: request.manual_capture,
                    details: SessionDetails {
                        id: id.clone(),
                        payment_state: SessionPaymentState::Unpaid,
                        intent_id: None,
                        amount: Some(request.amount),
                        metadata: request.metadata,
                    },
                },
            );
            CheckoutSession {
                url: format!("https://checkout.mock.local/pay/{}", id),
                id,
            }
        };
        self.delay().await;
        Ok(session)
    }

    async fn retrieve_session(&self, session_id: &str) -> GatewayResult<SessionDetails> {
        let details = {
            let mut state = self.state();
            state.begin(GatewayOp::RetrieveSession, None)?;
            state
                .sessions
                .get(session_id)
                .map(|session| session.details.clone())
                .ok_or_else(|| {
                    GatewayError::declined(
                        "resource_missing",
                        format!("No such checkout session: {}", session_id),
                    )
                })?
        };
        self.delay().await;
        Ok(details)
    }
}
