mod util;

use common::config::{DeviationAction, DuplicateAction, EntryConfig, SizingMode};
use common::{CloseReason, Direction, OperatingMode, PositionStatus};
use util::*;

fn skip_entry() -> EntryConfig {
    EntryConfig {
        max_price_deviation_percent: 0.5,
        deviation_action: DeviationAction::Skip,
        ..EntryConfig::default()
    }
}

#[tokio::test]
async fn within_deviation_long_entry_places_full_protection() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.3).await;

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.actual_entry_price, Some(100.3));
    assert_eq!(position.current_stop_loss, 95.0);
    assert!(position.stop_loss_order_id.is_some());
    assert_eq!(position.take_profit_order_ids.len(), 4);
    assert!(!position.protection_incomplete);

    let prices: Vec<f64> = position.targets.iter().map(|t| t.price).collect();
    assert_eq!(prices, vec![101.0, 102.0, 103.0, 104.0]);
    let moves: Vec<f64> = position
        .targets
        .iter()
        .map(|t| t.move_stop_loss_to.unwrap())
        .collect();
    assert_eq!(moves, vec![100.0, 101.0, 102.0, 103.0]);

    // 1 stop + 4 take-profits resting on the venue.
    assert_eq!(fx.venue.open_order_ids("BTCUSDT").await.unwrap().len(), 5);
    assert_eq!(fx.venue.leverage_for("BTCUSDT").await, Some(10));
}

#[tokio::test]
async fn deviation_beyond_band_skips_without_touching_the_exchange() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 101.5).await;

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    assert_eq!(position.status, PositionStatus::Cancelled);
    assert!(position.cancel_reason.unwrap().contains("deviation"));
    assert!(fx.venue.open_order_ids("BTCUSDT").await.unwrap().is_empty());
    assert_eq!(fx.venue.position_size("BTCUSDT").await.unwrap(), 0.0);

    // The cancelled snapshot is persisted.
    let stored = fx.positions.get_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, PositionStatus::Cancelled);
}

#[tokio::test]
async fn deviation_exactly_at_the_band_is_within_it() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.5).await; // exactly 0.5%

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
}

#[tokio::test]
async fn deviation_adjust_shifts_targets_by_entry_delta() {
    let entry = EntryConfig {
        max_price_deviation_percent: 0.5,
        deviation_action: DeviationAction::EnterAndAdjustTargets,
        ..EntryConfig::default()
    };
    let fx = fixture(
        default_trading(),
        entry,
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 101.0).await;

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.actual_entry_price, Some(101.0));
    let prices: Vec<f64> = position.targets.iter().map(|t| t.price).collect();
    assert_eq!(prices, vec![102.0, 103.0, 104.0, 105.0]);
    let first_move = position.targets[0].move_stop_loss_to.unwrap();
    assert_eq!(first_move, 101.0);
}

#[tokio::test]
async fn sizing_cap_limits_the_market_order() {
    let mut sizing = default_sizing();
    sizing.max_position_usdt = 5.0;
    let fx = fixture(
        default_trading(),
        skip_entry(),
        sizing,
        Default::default(),
        1_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    assert_eq!(position.initial_quantity, 0.05);
    assert_eq!(fx.venue.position_size("BTCUSDT").await.unwrap(), 0.05);
}

#[tokio::test]
async fn fixed_margin_sizing_uses_leverage_not_risk() {
    let mut sizing = default_sizing();
    sizing.mode = SizingMode::FixedMargin;
    sizing.fixed_margin_usdt = 5.0;
    let fx = fixture(
        default_trading(),
        skip_entry(),
        sizing,
        Default::default(),
        1_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();
    assert_eq!(position.initial_quantity, 0.5);
}

#[tokio::test]
async fn below_minimum_notional_cancels_before_any_exchange_call() {
    let mut sizing = default_sizing();
    sizing.fixed_amount_usdt = 5.0;
    sizing.min_position_usdt = 10.0;
    let fx = fixture(
        default_trading(),
        skip_entry(),
        sizing,
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    assert_eq!(position.status, PositionStatus::Cancelled);
    assert!(position.cancel_reason.unwrap().contains("below minimum"));
    assert_eq!(fx.venue.position_size("BTCUSDT").await.unwrap(), 0.0);
    assert!(fx.venue.open_order_ids("BTCUSDT").await.unwrap().is_empty());
}

#[tokio::test]
async fn non_automatic_mode_silently_drops_the_signal() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.mode.set(OperatingMode::Paused).await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    let result = fx.trader.execute(long_signal()).await.unwrap();
    assert!(result.is_none());
    assert!(fx.positions.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn active_cooldown_cancels_with_reason() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    // Arm the cooldown with a stop-loss close.
    let opened = fx.trader.execute(long_signal()).await.unwrap().unwrap();
    let stopped = opened.with_closed(CloseReason::StopLossHit, chrono::Utc::now());
    fx.cooldown.on_position_closed(&stopped).await.unwrap();
    fx.positions
        .add_or_update(stopped, |p| p.id.clone())
        .await
        .unwrap();

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Cancelled);
    assert!(position.cancel_reason.unwrap().contains("cooldown"));
}

#[tokio::test]
async fn duplicate_ignore_policy_cancels_the_second_signal() {
    let mut trading = default_trading();
    trading.duplicates.same_direction = DuplicateAction::Ignore;
    let fx = fixture(
        trading,
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    let first = fx.trader.execute(long_signal()).await.unwrap().unwrap();
    assert_eq!(first.status, PositionStatus::Open);

    let second = fx.trader.execute(long_signal()).await.unwrap().unwrap();
    assert_eq!(second.status, PositionStatus::Cancelled);
    assert!(second.cancel_reason.unwrap().contains("already exists"));
}

#[tokio::test]
async fn duplicate_close_policy_flattens_and_drops_the_signal() {
    let mut trading = default_trading();
    trading.duplicates.same_direction = DuplicateAction::Close;
    let fx = fixture(
        trading,
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    let first = fx.trader.execute(long_signal()).await.unwrap().unwrap();
    let second = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    // Close flattens the conflict but never opens the incoming signal.
    assert_eq!(second.status, PositionStatus::Cancelled);
    assert!(second.cancel_reason.unwrap().contains("new signal dropped"));
    let stored = fx.positions.get_all().await.unwrap();
    let old = stored.iter().find(|p| p.id == first.id).unwrap();
    assert_eq!(old.status, PositionStatus::Closed);
    assert_eq!(old.close_reason, Some(CloseReason::ManualClose));
    assert_eq!(fx.venue.position_size("BTCUSDT").await.unwrap(), 0.0);
    assert!(fx.venue.open_order_ids("BTCUSDT").await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_flip_policy_closes_then_reenters_opposite() {
    let mut trading = default_trading();
    trading.duplicates.opposite_direction = DuplicateAction::Flip;
    let fx = fixture(
        trading,
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;

    let first = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    let mut reverse = long_signal();
    reverse.direction = Direction::Short;
    reverse.stop_loss = 105.0;
    reverse.adjusted_stop_loss = Some(105.0);
    reverse.targets = vec![99.0, 98.0];
    let second = fx.trader.execute(reverse).await.unwrap().unwrap();

    assert_eq!(second.status, PositionStatus::Open);
    assert_eq!(second.direction, Direction::Short);
    let stored = fx.positions.get_all().await.unwrap();
    let old = stored.iter().find(|p| p.id == first.id).unwrap();
    assert_eq!(old.status, PositionStatus::Closed);
    assert_eq!(old.close_reason, Some(CloseReason::ManualClose));
    // The flip leaves exactly the new short exposure on the venue.
    assert_eq!(
        fx.venue.position_size("BTCUSDT").await.unwrap(),
        -second.initial_quantity
    );
}

#[tokio::test]
async fn rejected_entry_leaves_a_cancelled_position_and_no_orders() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;
    fx.venue.reject_next_order();

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    assert_eq!(position.status, PositionStatus::Cancelled);
    assert!(position.cancel_reason.unwrap().contains("entry rejected"));
    assert!(fx.venue.open_order_ids("BTCUSDT").await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_protection_flags_the_position_loudly() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("BTCUSDT", 100.0).await;
    fx.venue.fail_protective_orders(true);

    let position = fx.trader.execute(long_signal()).await.unwrap().unwrap();

    assert_eq!(position.status, PositionStatus::Open);
    assert!(position.protection_incomplete);
    assert!(position.stop_loss_order_id.is_none());
}

#[tokio::test]
async fn short_direction_reverses_sides_and_pnl() {
    let fx = fixture(
        default_trading(),
        skip_entry(),
        default_sizing(),
        Default::default(),
        10_000.0,
    )
    .await;
    fx.venue.set_mark_price("ETHUSDT", 3000.0).await;

    let mut signal = long_signal();
    signal.symbol = "ETHUSDT".into();
    signal.direction = Direction::Short;
    signal.entry_price = 3000.0;
    signal.stop_loss = 3100.0;
    signal.adjusted_stop_loss = Some(3100.0);
    signal.targets = vec![2900.0, 2800.0];

    let position = fx.trader.execute(signal).await.unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    // Short inventory is negative on the venue.
    assert!(fx.venue.position_size("ETHUSDT").await.unwrap() < 0.0);
    let moves: Vec<f64> = position
        .targets
        .iter()
        .map(|t| t.move_stop_loss_to.unwrap())
        .collect();
    assert_eq!(moves, vec![3000.0, 2900.0]);
}
