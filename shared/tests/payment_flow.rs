mod support;

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use shared::capabilities::HttpMethod;
use shared::model::PaymentMethod;
use shared::{
    ApiError, AppError, ErrorKind, Money, OrderAction, OrderStatus, PaymentError, PaymentFlow, Role,
    TransitionError,
};
use support::*;

fn created_payment() -> serde_json::Value {
    json!({
        "payment": {
            "id": 11,
            "payment_no": "PAY0001",
            "order_id": 1,
            "amount": 34900,
            "status": "pending"
        },
        "pay_params": {"prepay_id": "wx123"}
    })
}

fn payment_status(status: &str) -> serde_json::Value {
    json!({"payment_no": "PAY0001", "order_id": 1, "amount": 34900, "status": status})
}

#[tokio::test(start_paused = true)]
async fn polling_gives_up_after_ten_checks_two_seconds_apart() {
    let transport = ScriptedTransport::new();
    transport.on(HttpMethod::Post, "/payment/create", |_| ok(created_payment()));
    transport.on(HttpMethod::Get, "/payment/PAY0001/status", |_| {
        ok(payment_status("pending"))
    });
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let started = Instant::now();
    let err = flow
        .pay(&order(1, "accepted"), PaymentMethod::Wechat)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PaymentError::TimedOut {
            payment_no: "PAY0001".into(),
            attempts: 10,
        }
    );
    assert_eq!(transport.count(HttpMethod::Get, "/payment/PAY0001/status"), 10);
    assert_eq!(started.elapsed(), Duration::from_secs(18));
    // Never looked at the order: the payment did not complete.
    assert_eq!(transport.count(HttpMethod::Get, "/order/1"), 0);

    let app = AppError::from(err);
    assert_eq!(app.kind, ErrorKind::Payment);
    assert!(app.is_retryable());
}

#[tokio::test]
async fn mock_payment_ends_with_order_paid() {
    let transport = ScriptedTransport::new();
    let called_back = Arc::new(AtomicBool::new(false));
    transport.on(HttpMethod::Post, "/payment/create", |_| ok(created_payment()));
    {
        let called_back = called_back.clone();
        transport.on(HttpMethod::Post, "/payment/mock/callback", move |_| {
            called_back.store(true, Ordering::SeqCst);
            ok_empty()
        });
    }
    {
        let called_back = called_back.clone();
        transport.on(HttpMethod::Get, "/order/1", move |_| {
            let status = if called_back.load(Ordering::SeqCst) {
                "paid"
            } else {
                "accepted"
            };
            ok(order_json(1, status))
        });
    }
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let paid = flow
        .pay(&order(1, "accepted"), PaymentMethod::Mock)
        .await
        .unwrap();

    assert_eq!(paid.payment_no, "PAY0001");
    assert_eq!(paid.order.status, OrderStatus::Paid);
    let requests = transport.requests();
    let paths: Vec<_> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["/payment/create", "/payment/mock/callback", "/order/1"]
    );
    assert_eq!(requests[0].body, Some(json!({"order_id": 1, "method": "mock"})));
    assert_eq!(requests[1].body, Some(json!({"payment_no": "PAY0001"})));
    assert_eq!(transport.count(HttpMethod::Get, "/payment/PAY0001/status"), 0);
}

#[tokio::test]
async fn order_still_accepted_after_callback_is_a_defect() {
    let transport = ScriptedTransport::new();
    transport.on(HttpMethod::Post, "/payment/create", |_| ok(created_payment()));
    transport.on(HttpMethod::Post, "/payment/mock/callback", |_| ok_empty());
    transport.on(HttpMethod::Get, "/order/1", |_| ok(order_json(1, "accepted")));
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let err = flow
        .pay(&order(1, "accepted"), PaymentMethod::Mock)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PaymentError::OrderNotPaid {
            actual: OrderStatus::Accepted
        }
    );
    assert_eq!(AppError::from(err).kind, ErrorKind::Conflict);
}

#[tokio::test(start_paused = true)]
async fn polling_stops_as_soon_as_payment_is_paid() {
    let transport = ScriptedTransport::new();
    let checks = Arc::new(AtomicUsize::new(0));
    transport.on(HttpMethod::Post, "/payment/create", |_| ok(created_payment()));
    {
        let checks = checks.clone();
        transport.on(HttpMethod::Get, "/payment/PAY0001/status", move |_| {
            let n = checks.fetch_add(1, Ordering::SeqCst) + 1;
            ok(payment_status(if n >= 3 { "paid" } else { "pending" }))
        });
    }
    transport.on(HttpMethod::Get, "/order/1", |_| ok(order_json(1, "paid")));
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let started = Instant::now();
    let pending = flow
        .start(&order(1, "accepted"), PaymentMethod::Alipay)
        .await
        .unwrap();
    assert_eq!(pending.amount_due, Money::from_minor(34_900));
    assert_eq!(pending.pay_params, Some(json!({"prepay_id": "wx123"})));

    let paid = flow.complete(&pending).await.unwrap();

    assert_eq!(paid.order.status, OrderStatus::Paid);
    assert_eq!(checks.load(Ordering::SeqCst), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn failed_payment_stops_polling() {
    let transport = ScriptedTransport::new();
    transport.on(HttpMethod::Post, "/payment/create", |_| ok(created_payment()));
    transport.on(HttpMethod::Get, "/payment/PAY0001/status", |_| {
        ok(payment_status("failed"))
    });
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let err = flow
        .pay(&order(1, "accepted"), PaymentMethod::Wechat)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PaymentError::Failed {
            payment_no: "PAY0001".into()
        }
    );
    assert_eq!(transport.count(HttpMethod::Get, "/payment/PAY0001/status"), 1);
}

#[tokio::test]
async fn only_the_renter_of_an_accepted_order_may_pay() {
    let transport = ScriptedTransport::new();
    let (api, _session) = signed_in(&transport, OWNER, "1").await;
    let flow = PaymentFlow::new(api);

    let err = flow
        .pay(&order(1, "accepted"), PaymentMethod::Mock)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PaymentError::Transition(TransitionError::NotPermitted {
            action: OrderAction::Pay,
            status: OrderStatus::Accepted,
            role: Role::Owner,
        })
    );
    assert_eq!(transport.total(), 0);
}

#[tokio::test]
async fn missing_payment_number_is_reported() {
    let transport = ScriptedTransport::new();
    transport.on(HttpMethod::Post, "/payment/create", |_| {
        ok(json!({"payment": {"payment_no": " ", "order_id": 1}}))
    });
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let err = flow
        .start(&order(1, "accepted"), PaymentMethod::Wechat)
        .await
        .unwrap_err();
    assert_eq!(err, PaymentError::MissingPaymentNo);
}

#[tokio::test]
async fn payment_number_with_path_characters_is_refused() {
    let transport = ScriptedTransport::new();
    transport.on(HttpMethod::Post, "/payment/create", |_| {
        ok(json!({"payment": {"payment_no": "../order/1", "order_id": 1}}))
    });
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let err = flow
        .pay(&order(1, "accepted"), PaymentMethod::Wechat)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Api(ApiError::Request(_))));

    let err = flow.status("PAY0001/../../order").await.unwrap_err();
    assert!(matches!(err, ApiError::Request(_)));
    // Only the create call reached the backend.
    assert_eq!(transport.total(), 1);
}

#[tokio::test]
async fn refund_posts_and_refetches() {
    let transport = ScriptedTransport::new();
    transport.on(HttpMethod::Post, "/payment/1/refund", |_| ok_empty());
    transport.on(HttpMethod::Get, "/order/1", |_| ok(order_json(1, "refunded")));
    let (api, _session) = signed_in(&transport, RENTER, "1").await;
    let flow = PaymentFlow::new(api);

    let refunded = flow.refund(&order(1, "paid")).await.unwrap();

    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert!(refunded.status.is_terminal());
}

#[tokio::test]
async fn refund_requires_a_paid_order_and_a_party() {
    let transport = ScriptedTransport::new();
    let (api, _session) = signed_in(&transport, STRANGER, "1").await;
    let flow = PaymentFlow::new(api);

    for status in ["accepted", "paid"] {
        let err = flow.refund(&order(1, status)).await.unwrap_err();
        assert!(matches!(err, PaymentError::NotRefundable { .. }));
    }
    assert_eq!(transport.total(), 0);
}
