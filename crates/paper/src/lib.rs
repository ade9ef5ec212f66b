//! Simulated futures venue for dry-run mode and tests.
//!
//! Market orders fill immediately at the latest mark price with configurable
//! slippage. Stop and take-profit orders rest until a mark-price tick crosses
//! their trigger, then fill at the trigger and emit an `OrderUpdate`, so the
//! position manager sees the same event flow a real venue produces.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info};

use common::{
    Error, ExecutionResult, FuturesMarketData, FuturesOrderExecutor, Kline, MarginType,
    OrderSide, OrderUpdate, OrderUpdateStatus, Result, Venue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProtectiveKind {
    Stop,
    TakeProfit,
}

#[derive(Debug, Clone)]
struct RestingOrder {
    id: String,
    symbol: String,
    side: OrderSide,
    trigger: f64,
    quantity: f64,
    kind: ProtectiveKind,
}

/// In-process futures venue.
pub struct PaperExchange {
    marks: RwLock<HashMap<String, f64>>,
    balance_usdt: RwLock<f64>,
    slippage_bps: f64,
    resting: Mutex<Vec<RestingOrder>>,
    /// Net signed inventory per symbol (long positive).
    net: RwLock<HashMap<String, f64>>,
    leverage: RwLock<HashMap<String, u32>>,
    update_tx: broadcast::Sender<OrderUpdate>,
    next_id: AtomicU64,
    reject_next: AtomicBool,
    fail_protective: AtomicBool,
}

impl PaperExchange {
    pub fn new(initial_balance_usdt: f64, slippage_bps: f64) -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(1024);
        info!(
            balance = initial_balance_usdt,
            slippage_bps, "PaperExchange initialized"
        );
        Arc::new(Self {
            marks: RwLock::new(HashMap::new()),
            balance_usdt: RwLock::new(initial_balance_usdt),
            slippage_bps,
            resting: Mutex::new(Vec::new()),
            net: RwLock::new(HashMap::new()),
            leverage: RwLock::new(HashMap::new()),
            update_tx,
            next_id: AtomicU64::new(1),
            reject_next: AtomicBool::new(false),
            fail_protective: AtomicBool::new(false),
        })
    }

    pub fn update_sender(&self) -> broadcast::Sender<OrderUpdate> {
        self.update_tx.clone()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<OrderUpdate> {
        self.update_tx.subscribe()
    }

    /// Make the next order placement come back rejected (test hook).
    pub fn reject_next_order(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    /// Make every protective placement fail until cleared (test hook).
    pub fn fail_protective_orders(&self, fail: bool) {
        self.fail_protective.store(fail, Ordering::SeqCst);
    }

    pub async fn leverage_for(&self, symbol: &str) -> Option<u32> {
        self.leverage.read().await.get(symbol).copied()
    }

    /// Set the mark and fire any resting order whose trigger the new price
    /// crosses.
    pub async fn set_mark_price(&self, symbol: &str, price: f64) {
        self.marks.write().await.insert(symbol.to_string(), price);

        let fired: Vec<RestingOrder> = {
            let mut resting = self.resting.lock().await;
            let (hit, keep): (Vec<_>, Vec<_>) = resting
                .drain(..)
                .partition(|order| order.symbol == symbol && triggers(order, price));
            *resting = keep;
            hit
        };

        for order in fired {
            debug!(symbol = %order.symbol, id = %order.id, trigger = order.trigger, "resting order fired");
            self.apply_fill(&order.symbol, order.side, order.quantity).await;
            let _ = self.update_tx.send(OrderUpdate {
                venue: Venue::Binance,
                symbol: order.symbol,
                order_id: order.id,
                status: OrderUpdateStatus::Filled,
                filled_qty: order.quantity,
                average_price: order.trigger,
                reduce_only: true,
                timestamp: Utc::now(),
            });
        }
    }

    async fn apply_fill(&self, symbol: &str, side: OrderSide, quantity: f64) {
        let mut net = self.net.write().await;
        let entry = net.entry(symbol.to_string()).or_insert(0.0);
        match side {
            OrderSide::Buy => *entry += quantity,
            OrderSide::Sell => *entry -= quantity,
        }
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn take_reject(&self) -> bool {
        self.reject_next.swap(false, Ordering::SeqCst)
    }

    async fn rest_order(
        &self,
        symbol: &str,
        side: OrderSide,
        trigger: f64,
        quantity: f64,
        kind: ProtectiveKind,
    ) -> Result<ExecutionResult> {
        if self.take_reject() || self.fail_protective.load(Ordering::SeqCst) {
            return Ok(ExecutionResult::rejected("rejected by paper venue"));
        }
        let id = self.next_order_id();
        self.resting.lock().await.push(RestingOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            trigger,
            quantity,
            kind,
        });
        Ok(ExecutionResult::filled(id, None))
    }
}

fn triggers(order: &RestingOrder, price: f64) -> bool {
    match (order.kind, order.side) {
        // A stop closes against the position: long stops sell into weakness.
        (ProtectiveKind::Stop, OrderSide::Sell) => price <= order.trigger,
        (ProtectiveKind::Stop, OrderSide::Buy) => price >= order.trigger,
        // A take-profit closes with the move.
        (ProtectiveKind::TakeProfit, OrderSide::Sell) => price >= order.trigger,
        (ProtectiveKind::TakeProfit, OrderSide::Buy) => price <= order.trigger,
    }
}

#[async_trait]
impl FuturesMarketData for PaperExchange {
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        self.marks
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::Exchange(format!("no mark price seeded for {symbol}")))
    }

    async fn balance(&self, _asset: &str) -> Result<f64> {
        Ok(*self.balance_usdt.read().await)
    }

    async fn klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<Kline>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl FuturesOrderExecutor for PaperExchange {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.leverage.write().await.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn set_margin_type(&self, _symbol: &str, _margin: MarginType) -> Result<()> {
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<ExecutionResult> {
        if self.take_reject() {
            return Ok(ExecutionResult::rejected("rejected by paper venue"));
        }
        let mark = self.mark_price(symbol).await?;
        let fill_price = match side {
            OrderSide::Buy => mark * (1.0 + self.slippage_bps / 10_000.0),
            OrderSide::Sell => mark * (1.0 - self.slippage_bps / 10_000.0),
        };
        self.apply_fill(symbol, side, quantity).await;

        let id = self.next_order_id();
        debug!(symbol, ?side, quantity, fill_price, "paper market fill");
        let _ = self.update_tx.send(OrderUpdate {
            venue: Venue::Binance,
            symbol: symbol.to_string(),
            order_id: id.clone(),
            status: OrderUpdateStatus::Filled,
            filled_qty: quantity,
            average_price: fill_price,
            reduce_only,
            timestamp: Utc::now(),
        });
        Ok(ExecutionResult::filled(id, Some(fill_price)))
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        stop_price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        self.rest_order(symbol, side, stop_price, quantity, ProtectiveKind::Stop)
            .await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> Result<ExecutionResult> {
        self.rest_order(symbol, side, price, quantity, ProtectiveKind::TakeProfit)
            .await
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<()> {
        self.resting.lock().await.retain(|o| o.id != order_id);
        Ok(())
    }

    async fn open_order_ids(&self, symbol: &str) -> Result<Vec<String>> {
        Ok(self
            .resting
            .lock()
            .await
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.id.clone())
            .collect())
    }

    async fn position_size(&self, symbol: &str) -> Result<f64> {
        Ok(self.net.read().await.get(symbol).copied().unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn market_buy_fill_applies_positive_slippage() {
        let venue = PaperExchange::new(10_000.0, 10.0);
        venue.set_mark_price("BTCUSDT", 1000.0).await;

        let result = venue
            .place_market_order("BTCUSDT", OrderSide::Buy, 0.01, false)
            .await
            .unwrap();
        assert!(result.success);
        let expected = 1000.0 * (1.0 + 10.0 / 10_000.0);
        assert!((result.average_price.unwrap() - expected).abs() < 1e-9);
        assert_eq!(venue.position_size("BTCUSDT").await.unwrap(), 0.01);
    }

    #[tokio::test]
    async fn stop_fires_when_price_falls_through_trigger() {
        let venue = PaperExchange::new(10_000.0, 0.0);
        venue.set_mark_price("BTCUSDT", 100.0).await;
        let mut updates = venue.subscribe_updates();

        venue
            .place_market_order("BTCUSDT", OrderSide::Buy, 1.0, false)
            .await
            .unwrap();
        let stop = venue
            .place_stop_loss("BTCUSDT", OrderSide::Sell, 95.0, 1.0)
            .await
            .unwrap();
        let _ = updates.recv().await.unwrap(); // entry fill

        venue.set_mark_price("BTCUSDT", 96.0).await; // above trigger
        assert_eq!(venue.open_order_ids("BTCUSDT").await.unwrap().len(), 1);

        venue.set_mark_price("BTCUSDT", 94.9).await;
        let fill = updates.recv().await.unwrap();
        assert_eq!(fill.order_id, stop.order_id.unwrap());
        assert_eq!(fill.status, OrderUpdateStatus::Filled);
        assert!(venue.open_order_ids("BTCUSDT").await.unwrap().is_empty());
        assert_eq!(venue.position_size("BTCUSDT").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn take_profit_fires_with_the_move() {
        let venue = PaperExchange::new(10_000.0, 0.0);
        venue.set_mark_price("ETHUSDT", 100.0).await;
        let mut updates = venue.subscribe_updates();

        venue
            .place_market_order("ETHUSDT", OrderSide::Buy, 2.0, false)
            .await
            .unwrap();
        let tp = venue
            .place_take_profit("ETHUSDT", OrderSide::Sell, 105.0, 1.0)
            .await
            .unwrap();
        let _ = updates.recv().await.unwrap();

        venue.set_mark_price("ETHUSDT", 105.5).await;
        let fill = updates.recv().await.unwrap();
        assert_eq!(fill.order_id, tp.order_id.unwrap());
        assert_eq!(fill.filled_qty, 1.0);
        assert_eq!(venue.position_size("ETHUSDT").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn cancelled_orders_never_fire() {
        let venue = PaperExchange::new(10_000.0, 0.0);
        venue.set_mark_price("BTCUSDT", 100.0).await;

        let stop = venue
            .place_stop_loss("BTCUSDT", OrderSide::Sell, 95.0, 1.0)
            .await
            .unwrap();
        venue
            .cancel_order("BTCUSDT", &stop.order_id.unwrap())
            .await
            .unwrap();

        venue.set_mark_price("BTCUSDT", 90.0).await;
        assert!(venue.open_order_ids("BTCUSDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reject_hook_rejects_exactly_one_order() {
        let venue = PaperExchange::new(10_000.0, 0.0);
        venue.set_mark_price("BTCUSDT", 100.0).await;

        venue.reject_next_order();
        let first = venue
            .place_market_order("BTCUSDT", OrderSide::Buy, 1.0, false)
            .await
            .unwrap();
        assert!(!first.success);

        let second = venue
            .place_market_order("BTCUSDT", OrderSide::Buy, 1.0, false)
            .await
            .unwrap();
        assert!(second.success);
    }
}
