use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::config::{CooldownConfig, EntryConfig, SizingConfig, TradingConfig};
use common::{
    CooldownState, Direction, LogNotifier, SignalPosition, SignalSource, TradeStatistics,
    TradingSignal, Venue,
};
// Trait methods (`open_order_ids`, `position_size`, …) are called on the
// paper venue throughout the tests; re-export so `use util::*` suffices.
pub use common::{FuturesMarketData, FuturesOrderExecutor};
use engine::{PositionManager, RetryPolicy, SignalTrader};
use paper::PaperExchange;
use risk::{CooldownController, ModeController, PositionSizer, StatisticsAggregator};
use store::{JsonCollectionStore, JsonSingletonStore};

pub struct Fixture {
    pub venue: Arc<PaperExchange>,
    pub trader: Arc<SignalTrader>,
    pub positions: Arc<JsonCollectionStore<SignalPosition>>,
    pub cooldown: Arc<CooldownController>,
    pub mode: Arc<ModeController>,
    pub statistics: Arc<StatisticsAggregator>,
    pub retry: RetryPolicy,
    _dir: TempDir,
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter_factor: 0.0,
    }
}

pub async fn fixture(
    trading: TradingConfig,
    entry: EntryConfig,
    sizing: SizingConfig,
    cooldown_config: CooldownConfig,
    balance: f64,
) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let venue = PaperExchange::new(balance, 0.0);

    let positions: Arc<JsonCollectionStore<SignalPosition>> =
        Arc::new(JsonCollectionStore::open(dir.path().join("positions.json")).unwrap());
    let cooldown_store: Arc<JsonSingletonStore<CooldownState>> =
        Arc::new(JsonSingletonStore::open(dir.path().join("cooldown.json")).unwrap());
    let stats_store: Arc<JsonSingletonStore<TradeStatistics>> =
        Arc::new(JsonSingletonStore::open(dir.path().join("statistics.json")).unwrap());

    let cooldown = Arc::new(
        CooldownController::load(cooldown_config, cooldown_store)
            .await
            .unwrap(),
    );
    let statistics = Arc::new(StatisticsAggregator::load(stats_store).await.unwrap());
    let mode = Arc::new(ModeController::new(common::OperatingMode::Automatic));

    let retry = fast_retry();
    let trader = Arc::new(SignalTrader::new(
        Venue::Binance,
        trading,
        entry,
        PositionSizer::new(sizing),
        venue.clone(),
        venue.clone(),
        positions.clone(),
        cooldown.clone(),
        mode.clone(),
        Arc::new(LogNotifier),
        retry.clone(),
    ));

    Fixture {
        venue,
        trader,
        positions,
        cooldown,
        mode,
        statistics,
        retry,
        _dir: dir,
    }
}

impl Fixture {
    pub async fn manager(&self) -> PositionManager {
        PositionManager::new(
            self.positions.clone(),
            self.venue.clone(),
            self.cooldown.clone(),
            self.statistics.clone(),
            self.mode.clone(),
            Arc::new(LogNotifier),
            self.retry.clone(),
        )
        .await
        .unwrap()
    }
}

/// A validated long signal: entry 100, SL 95, four targets, 10x.
pub fn long_signal() -> TradingSignal {
    let mut signal = TradingSignal::new(
        SignalSource {
            channel_name: "alpha".into(),
            channel_id: -1001234,
            message_id: 1,
        },
        "BTCUSDT",
        Direction::Long,
        100.0,
        95.0,
        vec![101.0, 102.0, 103.0, 104.0],
        10,
    );
    signal.adjusted_leverage = Some(10);
    signal.adjusted_stop_loss = Some(95.0);
    signal
}

pub fn default_trading() -> TradingConfig {
    let mut trading = TradingConfig {
        move_stop_to_breakeven: true,
        ..TradingConfig::default()
    };
    trading.duplicates.min_seconds_between = 0;
    trading
}

pub fn default_sizing() -> SizingConfig {
    SizingConfig {
        fixed_amount_usdt: 100.0,
        min_position_usdt: 1.0,
        max_position_usdt: 100_000.0,
        ..SizingConfig::default()
    }
}
