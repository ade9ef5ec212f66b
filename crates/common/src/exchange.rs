use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ExecutionResult, MarginType, OrderSide, Result};

/// One historical candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Read-only market and account data for one futures venue.
#[async_trait]
pub trait FuturesMarketData: Send + Sync {
    /// Current mark price for a symbol.
    async fn mark_price(&self, symbol: &str) -> Result<f64>;

    /// Free balance of an asset (e.g. "USDT") in the futures wallet.
    async fn balance(&self, asset: &str) -> Result<f64>;

    /// Recent candles, newest last.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>>;
}

/// Order placement surface for one futures venue.
///
/// Placement methods return `ExecutionResult` — a venue rejection is data the
/// trader branches on, not an `Err`. Only `SignalTrader` and the position
/// manager hold a reference to a `dyn FuturesOrderExecutor`.
#[async_trait]
pub trait FuturesOrderExecutor: Send + Sync {
    /// Idempotent; safe to retry.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    /// Idempotent; safe to retry. Some venues reject a no-op change — the
    /// adapter must swallow that specific rejection.
    async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> Result<()>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<ExecutionResult>;

    /// Reduce-only stop-market order protecting the whole remaining quantity.
    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult>;

    /// Reduce-only take-profit order for one target slice.
    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult>;

    /// Idempotent by order id; safe to retry.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;

    /// Ids of all live orders on a symbol. Used by startup reconciliation.
    async fn open_order_ids(&self, symbol: &str) -> Result<Vec<String>>;

    /// Net signed position size for a symbol (positive long, negative short).
    /// Used by startup reconciliation.
    async fn position_size(&self, symbol: &str) -> Result<f64>;
}
