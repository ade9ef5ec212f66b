mod util;

use std::sync::Arc;

use common::config::{DeviationAction, EntryConfig};
use common::{FuturesOrderExecutor, SignalPosition};
use engine::reconcile_open_positions;
use util::*;

fn entry_config() -> EntryConfig {
    EntryConfig {
        max_price_deviation_percent: 0.5,
        deviation_action: DeviationAction::Skip,
        ..EntryConfig::default()
    }
}

#[tokio::test]
async fn matching_inventory_within_tolerance_is_confirmed() {
    let fx = fixture(
        default_trading(),
        entry_config(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;
    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    // Shave 0.5% off the stored remainder: fee dust, still within 1%.
    let mut stored = position.clone();
    stored.remaining_quantity *= 0.995;
    fx.positions
        .add_or_update(stored, |p| p.id.clone())
        .await
        .unwrap();

    let orders: Arc<dyn FuturesOrderExecutor> = fx.venue.clone();
    let result = reconcile_open_positions(&orders, &fx.positions).await.unwrap();

    assert!(result.is_clean(), "unexpected drift: {}", result.summary());
    assert_eq!(result.confirmed, vec![position.id]);
}

#[tokio::test]
async fn halved_inventory_is_reported_not_corrected() {
    let fx = fixture(
        default_trading(),
        entry_config(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;
    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    // The store claims twice what the exchange holds.
    let mut stored = position.clone();
    stored.remaining_quantity *= 2.0;
    fx.positions
        .add_or_update(stored.clone(), |p| p.id.clone())
        .await
        .unwrap();

    let orders: Arc<dyn FuturesOrderExecutor> = fx.venue.clone();
    let result = reconcile_open_positions(&orders, &fx.positions).await.unwrap();

    assert_eq!(result.mismatched.len(), 1);
    let mismatch = &result.mismatched[0];
    assert_eq!(mismatch.symbol, "BTCUSDT");
    assert_eq!(mismatch.expected_quantity, stored.remaining_quantity);

    // Reconciliation never touches the exchange or the store.
    let untouched = fx
        .positions
        .get_by(|p: &SignalPosition| p.id == position.id)
        .await
        .unwrap();
    assert_eq!(untouched[0].remaining_quantity, stored.remaining_quantity);
    assert!(!fx.venue.open_order_ids("BTCUSDT").await.unwrap().is_empty());
}

#[tokio::test]
async fn dead_protective_orders_are_listed_as_missing() {
    let fx = fixture(
        default_trading(),
        entry_config(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;
    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    // The recorded stop-loss vanished from the venue (manual cancel, say).
    let stop_id = position.stop_loss_order_id.clone().unwrap();
    fx.venue.cancel_order("BTCUSDT", &stop_id).await.unwrap();

    let orders: Arc<dyn FuturesOrderExecutor> = fx.venue.clone();
    let result = reconcile_open_positions(&orders, &fx.positions).await.unwrap();

    assert_eq!(result.missing_orders.len(), 1);
    assert_eq!(result.missing_orders[0].order_id, stop_id);
    assert_eq!(result.missing_orders[0].role, "stop-loss");
}

#[tokio::test]
async fn empty_store_reconciles_clean() {
    let fx = fixture(
        default_trading(),
        entry_config(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    let orders: Arc<dyn FuturesOrderExecutor> = fx.venue.clone();
    let result = reconcile_open_positions(&orders, &fx.positions).await.unwrap();
    assert!(result.is_clean());
    assert!(result.confirmed.is_empty());
}
