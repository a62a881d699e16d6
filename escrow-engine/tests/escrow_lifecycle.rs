use escrow_engine::arbitration::StaticAdminRegistry;
use escrow_engine::error::{EscrowError, GatewayError};
use escrow_engine::escrow_engine::EscrowEngineConfig;
use escrow_engine::event_publisher::{
    ChannelSink, EscrowEvent, EscrowEventKind, EventPublisher, EventPublisherConfig, EventSink,
};
use escrow_engine::mock_gateway::{GatewayOp, MockGateway};
use escrow_engine::models::{
    Listing, ListingId, PaymentStatus, Transaction, TransactionStatus, UserId,
};
use escrow_engine::node::{EscrowNode, EscrowNodeConfig};
use escrow_engine::payment_gateway::IntentStatus;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

const SELLER: UserId = UserId(1);
const BUYER: UserId = UserId(2);
const ADMIN: UserId = UserId(900);
const LISTING: ListingId = ListingId(42);
const CARD: &str = "pm_card_visa";

struct Harness {
    node: EscrowNode,
    gateway: Arc<MockGateway>,
    events: UnboundedReceiver<EscrowEvent>,
}

async fn harness_with(config: EscrowNodeConfig) -> Harness {
    let gateway = Arc::new(MockGateway::new());
    let (sink, events) = ChannelSink::channel();
    let publisher = EventPublisher::new(EventPublisherConfig::default()).with_sink(Arc::new(sink));
    let node = EscrowNode::new(
        config,
        gateway.clone(),
        Arc::new(StaticAdminRegistry::new([ADMIN])),
        publisher,
    );
    node.upsert_listing(Listing::new(LISTING, SELLER, "Mini fridge", Decimal::new(10000, 2)))
        .await;
    Harness {
        node,
        gateway,
        events,
    }
}

async fn harness() -> Harness {
    harness_with(EscrowNodeConfig::default()).await
}

async fn hold(h: &Harness) -> Transaction {
    h.node
        .authorize(LISTING, BUYER, CARD.to_string())
        .await
        .unwrap()
        .transaction
}

async fn next_event(h: &mut Harness) -> EscrowEvent {
    tokio::time::timeout(Duration::from_secs(1), h.events.recv())
        .await
        .expect("event not delivered")
        .expect("event channel closed")
}

#[tokio::test]
async fn happy_path_captures_once_and_marks_listing_sold() {
    let mut h = harness().await;
    let txn = hold(&h).await;
    assert_eq!(txn.amount().amount_minor, 10700);
    assert_eq!(txn.payment_status(), PaymentStatus::Held);

    h.node.confirm_handoff(txn.id(), SELLER).await.unwrap();
    let done = h.node.confirm_receipt(txn.id(), BUYER).await.unwrap();

    assert_eq!(done.payment_status(), PaymentStatus::Captured);
    assert_eq!(done.status(), TransactionStatus::Completed);
    assert!(done.completed_at().is_some());
    assert!(h.node.listing(LISTING).await.unwrap().is_sold);

    let captures = h.gateway.calls_for(GatewayOp::Capture);
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].intent_id.as_ref(), Some(txn.intent_id()));

    let event = next_event(&mut h).await;
    assert_eq!(event.kind, EscrowEventKind::TransactionCompleted);
}

#[tokio::test]
async fn dispute_before_handoff_refunds_automatically() {
    let mut h = harness().await;
    let txn = hold(&h).await;

    let result = h.node.dispute(txn.id(), BUYER).await.unwrap();

    assert!(!result.admin_review);
    assert_eq!(result.transaction.payment_status(), PaymentStatus::Refunded);
    assert_eq!(result.transaction.status(), TransactionStatus::Cancelled);
    assert_eq!(h.gateway.calls_for(GatewayOp::Cancel).len(), 1);
    assert!(h.gateway.calls_for(GatewayOp::Capture).is_empty());
    assert_eq!(h.gateway.intent(txn.intent_id()), Some(IntentStatus::Canceled));
    assert_eq!(next_event(&mut h).await.kind, EscrowEventKind::TransactionRefunded);
}

#[tokio::test]
async fn dispute_after_handoff_waits_for_admin_refund() {
    let mut h = harness().await;
    let txn = hold(&h).await;
    h.node.confirm_handoff(txn.id(), SELLER).await.unwrap();

    let result = h.node.dispute(txn.id(), BUYER).await.unwrap();
    assert!(result.admin_review);
    assert_eq!(result.transaction.payment_status(), PaymentStatus::Disputed);
    assert_eq!(result.transaction.status(), TransactionStatus::Disputed);
    assert!(h.gateway.calls_for(GatewayOp::Cancel).is_empty());
    assert_eq!(next_event(&mut h).await.kind, EscrowEventKind::TransactionDisputed);

    let resolved = h.node.resolve(txn.id(), ADMIN, "refund").await.unwrap();
    assert_eq!(resolved.payment_status(), PaymentStatus::Refunded);
    assert_eq!(resolved.status(), TransactionStatus::Cancelled);
    assert_eq!(h.gateway.calls_for(GatewayOp::Refund).len(), 1);
    assert!(!h.node.listing(LISTING).await.unwrap().is_sold);

    let info = h.node.transaction_info(txn.id(), BUYER).await.unwrap();
    assert_eq!(info.audit.len(), 1);
    assert_eq!(info.audit[0].admin_id, ADMIN);
    assert_eq!(info.audit[0].action.as_str(), "refund");
    assert_eq!(next_event(&mut h).await.kind, EscrowEventKind::TransactionResolved);
}

#[tokio::test]
async fn admin_release_captures_for_seller() {
    let h = harness().await;
    let txn = hold(&h).await;
    h.node.confirm_handoff(txn.id(), SELLER).await.unwrap();
    h.node.dispute(txn.id(), BUYER).await.unwrap();

    let resolved = h.node.resolve(txn.id(), ADMIN, "release").await.unwrap();

    assert_eq!(resolved.payment_status(), PaymentStatus::Captured);
    assert_eq!(resolved.status(), TransactionStatus::Completed);
    assert!(h.node.listing(LISTING).await.unwrap().is_sold);
    assert_eq!(h.gateway.intent(txn.intent_id()), Some(IntentStatus::Captured));
    assert_eq!(h.node.store().audit_for(txn.id()).await.len(), 1);
}

#[tokio::test]
async fn resolve_rejects_non_admins_and_unknown_actions() {
    let h = harness().await;
    let txn = hold(&h).await;
    h.node.confirm_handoff(txn.id(), SELLER).await.unwrap();
    let disputed = h.node.dispute(txn.id(), BUYER).await.unwrap().transaction;

    let err = h.node.resolve(txn.id(), BUYER, "refund").await.unwrap_err();
    assert!(matches!(err, EscrowError::Authorization(_)));

    for action in ["approve", "Release", "", "refund "] {
        let err = h.node.resolve(txn.id(), ADMIN, action).await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)), "{:?}", action);
    }

    assert_eq!(h.node.engine().get(txn.id()).await.unwrap(), disputed);
    assert!(h.gateway.calls_for(GatewayOp::Refund).is_empty());
    assert!(h.node.store().audit_log().await.is_empty());
}

#[tokio::test]
async fn resolve_outside_dispute_is_not_found_and_mutates_nothing() {
    let h = harness().await;
    let held = hold(&h).await;

    for action in ["release", "refund"] {
        let err = h.node.resolve(held.id(), ADMIN, action).await.unwrap_err();
        assert!(err.is_already_handled());
    }
    assert_eq!(h.node.engine().get(held.id()).await.unwrap(), held);

    let captured = h.node.confirm_receipt(held.id(), BUYER).await.unwrap();
    for action in ["release", "refund"] {
        let err = h.node.resolve(held.id(), ADMIN, action).await.unwrap_err();
        assert!(err.is_already_handled());
    }
    assert_eq!(h.node.engine().get(held.id()).await.unwrap(), captured);
    assert_eq!(h.gateway.calls_for(GatewayOp::Capture).len(), 1);
    assert!(h.gateway.calls_for(GatewayOp::Refund).is_empty());
    assert!(h.node.store().audit_log().await.is_empty());
}

#[tokio::test]
async fn authorize_is_idempotent_for_the_pair() {
    let h = harness().await;
    let first = h.node.authorize(LISTING, BUYER, CARD.to_string()).await.unwrap();
    let second = h.node.authorize(LISTING, BUYER, CARD.to_string()).await.unwrap();

    assert!(!first.already_exists);
    assert!(second.already_exists);
    assert_eq!(first.transaction.id(), second.transaction.id());
    assert_eq!(h.gateway.calls_for(GatewayOp::AuthorizeHold).len(), 1);

    // a new hold after the first one is settled gets a fresh row
    h.node.dispute(first.transaction.id(), BUYER).await.unwrap();
    let third = h.node.authorize(LISTING, BUYER, CARD.to_string()).await.unwrap();
    assert!(!third.already_exists);
    assert_ne!(third.transaction.id(), first.transaction.id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_authorize_creates_one_hold() {
    let h = harness().await;
    h.gateway.set_latency(Some(Duration::from_millis(30)));

    let (a, b) = tokio::join!(
        h.node.authorize(LISTING, BUYER, CARD.to_string()),
        h.node.authorize(LISTING, BUYER, CARD.to_string()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.transaction.id(), b.transaction.id());
    assert!(a.already_exists != b.already_exists);
    assert_eq!(h.gateway.calls_for(GatewayOp::AuthorizeHold).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receipt_racing_dispute_moves_money_once() {
    for confirmed in [false, true] {
        for _ in 0..10 {
            let h = harness().await;
            let txn = hold(&h).await;
            if confirmed {
                h.node.confirm_handoff(txn.id(), SELLER).await.unwrap();
            }
            h.gateway.set_latency(Some(Duration::from_millis(20)));

            let (receipt, dispute) = tokio::join!(
                h.node.confirm_receipt(txn.id(), BUYER),
                h.node.dispute(txn.id(), BUYER),
            );

            assert!(
                receipt.is_ok() != dispute.is_ok(),
                "exactly one transition must win"
            );
            let loser = receipt.as_ref().err().or(dispute.as_ref().err()).unwrap();
            assert!(loser.is_already_handled());

            let captures = h.gateway.calls_for(GatewayOp::Capture).len();
            let cancels = h.gateway.calls_for(GatewayOp::Cancel).len();
            assert!(captures + cancels <= 1);

            let stored = h.node.engine().get(txn.id()).await.unwrap();
            match (receipt.is_ok(), confirmed) {
                (true, _) => assert_eq!(stored.payment_status(), PaymentStatus::Captured),
                (false, false) => assert_eq!(stored.payment_status(), PaymentStatus::Refunded),
                (false, true) => assert_eq!(stored.payment_status(), PaymentStatus::Disputed),
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_buyers_racing_receipt_capture_once() {
    let other_buyer = UserId(3);
    for _ in 0..10 {
        let h = harness().await;
        let first = hold(&h).await;
        let second = h
            .node
            .authorize(LISTING, other_buyer, CARD.to_string())
            .await
            .unwrap()
            .transaction;
        h.gateway.set_latency(Some(Duration::from_millis(20)));

        let (a, b) = tokio::join!(
            h.node.confirm_receipt(first.id(), BUYER),
            h.node.confirm_receipt(second.id(), other_buyer),
        );

        assert!(a.is_ok() != b.is_ok(), "only one buyer may pay for the item");
        let loser = a.as_ref().err().or(b.as_ref().err()).unwrap();
        assert!(matches!(loser, EscrowError::Validation(_)));
        assert_eq!(h.gateway.calls_for(GatewayOp::Capture).len(), 1);
        assert!(h.node.listing(LISTING).await.unwrap().is_sold);

        let losing_id = if a.is_ok() { second.id() } else { first.id() };
        let stored = h.node.engine().get(losing_id).await.unwrap();
        assert_eq!(stored.payment_status(), PaymentStatus::Held);
    }
}

#[tokio::test]
async fn gateway_timeout_mutates_nothing() {
    let config = EscrowNodeConfig {
        escrow_config: EscrowEngineConfig {
            gateway_timeout: Duration::from_millis(20),
            ..EscrowEngineConfig::default()
        },
        ..EscrowNodeConfig::default()
    };
    let h = harness_with(config).await;
    let txn = hold(&h).await;

    h.gateway.set_latency(Some(Duration::from_millis(200)));
    let err = h.node.dispute(txn.id(), BUYER).await.unwrap_err();
    assert!(matches!(err, EscrowError::Gateway(GatewayError::Timeout)));
    assert_eq!(h.node.engine().get(txn.id()).await.unwrap(), txn);
}

#[tokio::test]
async fn declined_capture_mutates_nothing() {
    let h = harness().await;
    let txn = hold(&h).await;
    h.gateway.fail_next(
        GatewayOp::Capture,
        GatewayError::declined("card_declined", "insufficient funds"),
    );

    let err = h.node.confirm_receipt(txn.id(), BUYER).await.unwrap_err();
    assert_eq!(err.code(), "GATEWAY_ERROR");
    assert_eq!(h.node.engine().get(txn.id()).await.unwrap(), txn);
    assert!(!h.node.listing(LISTING).await.unwrap().is_sold);
}

#[tokio::test]
async fn only_the_parties_may_act() {
    let h = harness().await;
    let txn = hold(&h).await;
    let stranger = UserId(77);

    assert!(matches!(
        h.node.confirm_handoff(txn.id(), BUYER).await,
        Err(EscrowError::Authorization(_))
    ));
    assert!(matches!(
        h.node.confirm_receipt(txn.id(), SELLER).await,
        Err(EscrowError::Authorization(_))
    ));
    assert!(matches!(
        h.node.dispute(txn.id(), stranger).await,
        Err(EscrowError::Authorization(_))
    ));
    assert!(matches!(
        h.node.transaction_info(txn.id(), stranger).await,
        Err(EscrowError::Authorization(_))
    ));
    assert!(h.node.transaction_info(txn.id(), ADMIN).await.is_ok());
    assert_eq!(h.node.engine().get(txn.id()).await.unwrap(), txn);
}

#[tokio::test]
async fn checkout_session_cannot_be_hijacked() {
    let h = harness().await;
    let quote = h.node.create_checkout(LISTING, BUYER).await.unwrap();
    assert_eq!(quote.amount, Decimal::new(10700, 2));
    assert_eq!(quote.fee, Decimal::new(700, 2));
    h.gateway
        .complete_session(&quote.checkout_session.id)
        .unwrap();

    let thief = UserId(3);
    let err = h
        .node
        .activate_checkout(LISTING, &quote.checkout_session.id, thief)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Authorization(_)));

    let err = h
        .node
        .activate_checkout(ListingId(43), &quote.checkout_session.id, BUYER)
        .await
        .unwrap_err();
    assert!(matches!(err, EscrowError::Authorization(_)));

    assert!(h.node.active_for(LISTING, thief).await.unwrap().is_none());
    let outcome = h
        .node
        .activate_checkout(LISTING, &quote.checkout_session.id, BUYER)
        .await
        .unwrap();
    assert_eq!(outcome.transaction.buyer_id(), BUYER);
    assert_eq!(outcome.transaction.amount().amount_minor, 10700);
}

#[tokio::test]
async fn boost_activation_publishes_event() {
    let mut h = harness().await;
    let session = h.node.create_boost_session(LISTING, SELLER).await.unwrap();
    h.gateway.complete_session(&session.id).unwrap();

    let listing = h
        .node
        .activate_boost(LISTING, &session.id, SELLER)
        .await
        .unwrap();
    assert!(listing.is_boosted);
    assert_eq!(next_event(&mut h).await.kind, EscrowEventKind::ListingBoosted);
}

#[tokio::test]
async fn reconciliation_repairs_toward_gateway_state() {
    let h = harness().await;

    let captured = hold(&h).await;
    h.gateway
        .set_intent_status(captured.intent_id(), IntentStatus::Captured);

    let other_listing = ListingId(50);
    h.node
        .upsert_listing(Listing::new(other_listing, SELLER, "Lamp", Decimal::new(1000, 2)))
        .await;
    let canceled = h
        .node
        .authorize(other_listing, BUYER, CARD.to_string())
        .await
        .unwrap()
        .transaction;
    h.gateway
        .set_intent_status(canceled.intent_id(), IntentStatus::Canceled);

    let third_listing = ListingId(51);
    h.node
        .upsert_listing(Listing::new(third_listing, SELLER, "Chair", Decimal::new(1500, 2)))
        .await;
    let odd = h
        .node
        .authorize(third_listing, BUYER, CARD.to_string())
        .await
        .unwrap()
        .transaction;
    h.gateway.set_intent_status(odd.intent_id(), IntentStatus::Pending);

    let report = h.node.reconcile().await.unwrap();

    assert_eq!(report.checked, 3);
    assert_eq!(report.repaired.len(), 2);
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].transaction_id, odd.id());

    let repaired = h.node.engine().get(captured.id()).await.unwrap();
    assert_eq!(repaired.status(), TransactionStatus::Completed);
    assert!(h.node.listing(LISTING).await.unwrap().is_sold);

    let repaired = h.node.engine().get(canceled.id()).await.unwrap();
    assert_eq!(repaired.payment_status(), PaymentStatus::Refunded);

    // a second pass finds nothing new to repair
    let report = h.node.reconcile().await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.repaired.is_empty());
}

struct FailingSink;

#[async_trait::async_trait]
impl EventSink for FailingSink {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn deliver(&self, _event: &EscrowEvent) -> anyhow::Result<()> {
        anyhow::bail!("email service unavailable")
    }
}

#[tokio::test]
async fn failing_event_sink_does_not_roll_back() {
    let gateway = Arc::new(MockGateway::new());
    let node = EscrowNode::new(
        EscrowNodeConfig::default(),
        gateway,
        Arc::new(StaticAdminRegistry::default()),
        EventPublisher::default().with_sink(Arc::new(FailingSink)),
    );
    node.upsert_listing(Listing::new(LISTING, SELLER, "Desk", Decimal::new(5000, 2)))
        .await;

    let txn = node
        .authorize(LISTING, BUYER, CARD.to_string())
        .await
        .unwrap()
        .transaction;
    let done = node.confirm_receipt(txn.id(), BUYER).await.unwrap();
    tokio::task::yield_now().await;

    assert_eq!(done.status(), TransactionStatus::Completed);
    assert_eq!(
        node.engine().get(txn.id()).await.unwrap().status(),
        TransactionStatus::Completed
    );
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Handoff,
    Receipt,
    Dispute,
    Release,
    Refund,
}

const OPS: [Op; 5] = [Op::Handoff, Op::Receipt, Op::Dispute, Op::Release, Op::Refund];

async fn apply(h: &Harness, txn: &Transaction, op: Op) -> bool {
    let id = txn.id();
    match op {
        Op::Handoff => h.node.confirm_handoff(id, SELLER).await.is_ok(),
        Op::Receipt => h.node.confirm_receipt(id, BUYER).await.is_ok(),
        Op::Dispute => h.node.dispute(id, BUYER).await.is_ok(),
        Op::Release => h.node.resolve(id, ADMIN, "release").await.is_ok(),
        Op::Refund => h.node.resolve(id, ADMIN, "refund").await.is_ok(),
    }
}

fn sequences(len: usize) -> Vec<Vec<Op>> {
    let mut all: Vec<Vec<Op>> = vec![Vec::new()];
    for _ in 0..len {
        all = all
            .into_iter()
            .flat_map(|seq| {
                OPS.iter().map(move |op| {
                    let mut next = seq.clone();
                    next.push(*op);
                    next
                })
            })
            .collect();
    }
    all
}

/// Every sequence of four operations from a fresh hold keeps the row on
/// the legal state table, in step with the gateway, and settles money at
/// most once.
#[tokio::test]
async fn every_operation_sequence_stays_on_the_state_table() {
    for seq in sequences(4) {
        let h = harness().await;
        let txn = hold(&h).await;
        let mut previous = txn.clone();

        for op in &seq {
            let ok = apply(&h, &txn, *op).await;
            let current = h.node.engine().get(txn.id()).await.unwrap();
            let pair = (current.payment_status(), current.status());

            assert!(
                matches!(
                    pair,
                    (PaymentStatus::Held, TransactionStatus::Interested)
                        | (PaymentStatus::Captured, TransactionStatus::Completed)
                        | (PaymentStatus::Refunded, TransactionStatus::Cancelled)
                        | (PaymentStatus::Disputed, TransactionStatus::Disputed)
                ),
                "{:?} reached {:?}",
                seq,
                pair
            );
            if pair.0 == PaymentStatus::Disputed {
                assert!(current.seller_confirmed_at().is_some(), "{:?}", seq);
            }
            if previous.status().is_terminal() {
                assert!(!ok, "{:?}: {:?} succeeded on a terminal row", seq, op);
                assert_eq!(current, previous, "{:?}", seq);
            }

            let gateway_state = h.gateway.intent(txn.intent_id());
            let expected = match pair.0 {
                PaymentStatus::Held | PaymentStatus::Disputed => IntentStatus::RequiresCapture,
                PaymentStatus::Captured => IntentStatus::Captured,
                PaymentStatus::Refunded => IntentStatus::Canceled,
            };
            assert_eq!(gateway_state, Some(expected), "{:?}", seq);

            let settlements = h.gateway.calls_for(GatewayOp::Capture).len()
                + h.gateway.calls_for(GatewayOp::Cancel).len()
                + h.gateway.calls_for(GatewayOp::Refund).len();
            assert!(settlements <= 1, "{:?} settled {} times", seq, settlements);

            let sold = h.node.listing(LISTING).await.unwrap().is_sold;
            assert_eq!(sold, pair.0 == PaymentStatus::Captured, "{:?}", seq);

            previous = current;
        }
    }
}
