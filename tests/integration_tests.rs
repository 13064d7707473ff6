//! Integration tests for the position lifecycle
//! Positions, session and paper exchange wired together, plus the REST adapter

use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tickbot::api::rest::RestExchangeClient;
use tickbot::api::{OrderRequest, Side};
use tickbot::session::{FinalizeReason, SessionEvent, TradingSession};
use tickbot::trading::{
    PaperExchange, PositionConfig, PositionEvent, PositionEventKind, PositionFactory, State,
};
use tickbot::TradingError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    exchange: Arc<PaperExchange>,
    factory: PositionFactory,
    pump: JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn paper(config: PositionConfig) -> Harness {
    let exchange = Arc::new(
        PaperExchange::new("BTC-USD")
            .unwrap()
            .with_balance("USD", dec!(1000))
            .with_balance("BTC", dec!(2)),
    );
    exchange.mark_price(dec!(100));
    let session = TradingSession::new("BTC-USD", exchange.clone());
    let pump = session.pump(exchange.events().unwrap());
    let factory = PositionFactory::new(session, exchange.clone(), config);
    Harness { exchange, factory, pump }
}

async fn next_event(events: &mut broadcast::Receiver<PositionEvent>) -> PositionEvent {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("no position event within 1s")
        .expect("position event stream closed")
}

#[tokio::test]
async fn test_limit_entry_rests_until_crossed() {
    let h = paper(PositionConfig::default());
    let position = h.factory.long();
    let mut events = position.subscribe();

    let order = position
        .enter(&OrderRequest::limit("BTC-USD", Side::Buy, dec!(95)))
        .await
        .unwrap();
    assert_eq!(order.size, Some(dec!(10.52631579)));
    assert_eq!(position.in_position(), State::Pending);
    assert_eq!(h.exchange.open_orders().len(), 1);

    h.exchange.mark_price(dec!(96));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(position.in_position(), State::Pending);

    h.exchange.mark_price(dec!(95));
    let entered = next_event(&mut events).await;
    assert_eq!(entered.kind, PositionEventKind::Entered);
    assert_eq!(entered.name, "Position.enter-long");
    assert_eq!(entered.order_id, order.id);
    assert!(matches!(entered.trade, Some(SessionEvent::TradeExecuted { .. })));
    assert_eq!(position.in_position(), State::Active);
    assert!(position.entry_order().is_none());
    assert_eq!(h.exchange.balance("BTC").balance, dec!(12.52631579));

    let exit = position.exit(&OrderRequest::market("BTC-USD", Side::Sell)).await.unwrap();
    let exited = next_event(&mut events).await;
    assert_eq!(exited.kind, PositionEventKind::Exited);
    assert_eq!(exited.order_id, exit.id);
    assert_eq!(position.in_position(), State::Ready);
    assert!(position.exit_order().is_none());
    assert_eq!(h.exchange.balance("BTC").available, Decimal::ZERO);
}

#[tokio::test]
async fn test_cancel_resting_entry_releases_funds() {
    let h = paper(PositionConfig::default());
    let position = h.factory.long();
    let mut events = position.subscribe();

    position
        .enter(&OrderRequest::limit("BTC-USD", Side::Buy, dec!(90)).with_size(dec!(5)))
        .await
        .unwrap();
    assert_eq!(h.exchange.balance("USD").available, dec!(550));

    position.cancel_pending_entry().await.unwrap();
    assert_eq!(position.in_position(), State::Ready);
    assert_eq!(h.exchange.balance("USD").available, dec!(1000));
    assert!(h.exchange.open_orders().is_empty());

    let canceled = next_event(&mut events).await;
    assert_eq!(canceled.kind, PositionEventKind::EntryCanceled);
    assert_eq!(canceled.name, "Position.cancel-enter-long");

    // the exchange's own cancel confirmation must not produce a second event
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());

    // and the position can be used again
    position.enter(&OrderRequest::market("BTC-USD", Side::Buy)).await.unwrap();
    assert_eq!(next_event(&mut events).await.kind, PositionEventKind::Entered);
}

#[tokio::test]
async fn test_unacknowledged_orders_use_retry_budget() {
    let config = PositionConfig {
        max_retries_on_order_fail: 3,
        retry_interval_ms: 10,
        ..PositionConfig::default()
    };

    let h = paper(config.clone());
    h.exchange.drop_next_acks(2);
    let position = h.factory.long();
    position.enter(&OrderRequest::market("BTC-USD", Side::Buy)).await.unwrap();

    let h = paper(config);
    h.exchange.drop_next_acks(3);
    let position = h.factory.long();
    let err = position
        .enter(&OrderRequest::market("BTC-USD", Side::Buy))
        .await
        .unwrap_err();
    assert!(matches!(err, TradingError::ExceededRetryCount { .. }));
    assert_eq!(position.in_position(), State::Ready);
    assert!(position.entry_order().is_none());
}

#[tokio::test]
async fn test_short_position_sells_base_first() {
    let h = paper(PositionConfig {
        avail_funds_perc: dec!(0.5),
        ..PositionConfig::default()
    });
    let position = h.factory.short();
    let mut events = position.subscribe();

    let order = position.enter(&OrderRequest::market("BTC-USD", Side::Sell)).await.unwrap();
    assert_eq!(order.size, Some(dec!(1)));

    let entered = next_event(&mut events).await;
    assert_eq!(entered.name, "Position.enter-short");
    assert_eq!(h.exchange.balance("BTC").balance, dec!(1));
    assert_eq!(h.exchange.balance("USD").balance, dec!(1100));
}

#[tokio::test]
async fn test_rest_gateway_retries_unacknowledged_entry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"currency": "USD", "balance": "100", "available": "100", "hold": "0"},
            {"currency": "BTC", "balance": "0", "available": "0", "hold": "0"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "rejected",
            "reject_reason": "busy"
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "ord-1",
            "product_id": "BTC-USD",
            "status": "pending"
        })))
        .mount(&server)
        .await;

    let client = Arc::new(RestExchangeClient::new(&server.uri(), Some("key".to_string())).unwrap());
    let session = TradingSession::new("BTC-USD", client.clone());
    let factory = PositionFactory::new(
        session.clone(),
        client,
        PositionConfig {
            max_retries_on_order_fail: 2,
            retry_interval_ms: 10,
            ..PositionConfig::default()
        },
    );
    let position = factory.long();
    let mut events = position.subscribe();

    let original = OrderRequest::market("BTC-USD", Side::Buy);
    let order = position.enter(&original).await.unwrap();
    assert_eq!(order.id, "ord-1");
    assert_eq!(original.funds, None);

    let posts: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect();
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[1]["funds"], "100.00");

    session.dispatch(&SessionEvent::TradeFinalized {
        order_id: "ord-1".to_string(),
        side: Side::Buy,
        reason: FinalizeReason::Filled,
        remaining_size: Decimal::ZERO,
        time: chrono::Utc::now(),
    });
    assert_eq!(next_event(&mut events).await.kind, PositionEventKind::Entered);
    assert_eq!(position.in_position(), State::Active);
}
