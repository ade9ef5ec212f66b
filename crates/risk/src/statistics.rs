use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use common::{ClosedTrade, Result, SignalPosition, TradeStatistics};
use store::JsonSingletonStore;

/// One rolling window's aggregates, computed on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    pub label: &'static str,
    pub trade_count: usize,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub net: f64,
}

const WINDOWS: &[(&str, i64)] = &[("24h", 24), ("7d", 7 * 24), ("30d", 30 * 24)];

/// Appends closed trades to the persisted log and reports per-window
/// aggregates. Entries older than the longest window are pruned on write.
pub struct StatisticsAggregator {
    state: Mutex<TradeStatistics>,
    store: Arc<JsonSingletonStore<TradeStatistics>>,
}

impl StatisticsAggregator {
    pub async fn load(store: Arc<JsonSingletonStore<TradeStatistics>>) -> Result<Self> {
        let state = store.load().await?;
        Ok(Self {
            state: Mutex::new(state),
            store,
        })
    }

    /// Record one closed position's realized PnL.
    pub async fn record_close(&self, position: &SignalPosition) -> Result<()> {
        let closed_at = position.closed_at.unwrap_or_else(Utc::now);
        let mut state = self.state.lock().await;
        state.trades.push(ClosedTrade {
            symbol: position.symbol.clone(),
            realized_pnl: position.realized_pnl,
            closed_at,
        });
        prune(&mut state, Utc::now());
        debug!(symbol = %position.symbol, pnl = position.realized_pnl, "trade recorded");
        self.store.save(&state).await
    }

    pub async fn report(&self) -> Vec<WindowReport> {
        let state = self.state.lock().await;
        let now = Utc::now();
        WINDOWS
            .iter()
            .map(|(label, hours)| window_report(label, &state.trades, now, Duration::hours(*hours)))
            .collect()
    }

    /// Net realized PnL over the last 24 hours; `/status` compares this to
    /// the daily-loss limit.
    pub async fn daily_net(&self) -> f64 {
        self.report()
            .await
            .first()
            .map(|w| w.net)
            .unwrap_or(0.0)
    }

    pub async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.store.save(&state).await
    }
}

fn prune(state: &mut TradeStatistics, now: DateTime<Utc>) {
    let horizon = now - Duration::hours(WINDOWS.last().map(|(_, h)| *h).unwrap_or(30 * 24));
    state.trades.retain(|t| t.closed_at >= horizon);
}

fn window_report(
    label: &'static str,
    trades: &[ClosedTrade],
    now: DateTime<Utc>,
    window: Duration,
) -> WindowReport {
    let cutoff = now - window;
    let mut report = WindowReport {
        label,
        trade_count: 0,
        gross_profit: 0.0,
        gross_loss: 0.0,
        net: 0.0,
    };
    for trade in trades.iter().filter(|t| t.closed_at >= cutoff) {
        report.trade_count += 1;
        if trade.realized_pnl >= 0.0 {
            report.gross_profit += trade.realized_pnl;
        } else {
            report.gross_loss += trade.realized_pnl;
        }
        report.net += trade.realized_pnl;
    }
    report
}
