use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use common::{
    CloseReason, FuturesOrderExecutor, Notifier, OrderUpdate, OrderUpdateStatus, PositionStatus,
    Result, SignalPosition,
};
use risk::{CooldownController, ModeController, StatisticsAggregator};
use store::JsonCollectionStore;

use crate::retry::RetryPolicy;

/// Fraction of the initial quantity below which a remainder counts as zero
/// (venue rounding and fee dust).
const REMAINDER_EPSILON: f64 = 1e-6;

/// The single consumer of exchange order updates and the only component that
/// mutates a position after it is opened.
///
/// Keeps an order-id → position-id index, rebuilt from the store on startup
/// and refreshed lazily when the trader opens new positions.
pub struct PositionManager {
    positions: Arc<JsonCollectionStore<SignalPosition>>,
    orders: Arc<dyn FuturesOrderExecutor>,
    cooldown: Arc<CooldownController>,
    statistics: Arc<StatisticsAggregator>,
    mode: Arc<ModeController>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    index: HashMap<String, String>,
}

impl PositionManager {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        positions: Arc<JsonCollectionStore<SignalPosition>>,
        orders: Arc<dyn FuturesOrderExecutor>,
        cooldown: Arc<CooldownController>,
        statistics: Arc<StatisticsAggregator>,
        mode: Arc<ModeController>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let mut manager = Self {
            positions,
            orders,
            cooldown,
            statistics,
            mode,
            notifier,
            retry,
            index: HashMap::new(),
        };
        manager.rebuild_index().await?;
        Ok(manager)
    }

    /// Rebuild the order-id index from every open position in the store.
    pub async fn rebuild_index(&mut self) -> Result<()> {
        self.index.clear();
        for position in self
            .positions
            .get_by(|p: &SignalPosition| p.is_open())
            .await?
        {
            self.index_position(&position);
        }
        info!(orders = self.index.len(), "position index rebuilt");
        Ok(())
    }

    fn index_position(&mut self, position: &SignalPosition) {
        for order_id in position
            .entry_order_id
            .iter()
            .chain(position.stop_loss_order_id.iter())
            .chain(position.take_profit_order_ids.iter())
        {
            self.index.insert(order_id.clone(), position.id.clone());
        }
    }

    /// Consume updates until the channel closes or shutdown is signalled.
    pub async fn run(
        mut self,
        mut updates: broadcast::Receiver<OrderUpdate>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("PositionManager running");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("PositionManager draining and stopping");
                        // Drain whatever is already queued, then exit.
                        while let Ok(update) = updates.try_recv() {
                            if let Err(e) = self.handle_update(update).await {
                                warn!(error = %e, "error handling update during drain");
                            }
                        }
                        return;
                    }
                }
                update = updates.recv() => {
                    match update {
                        Ok(update) => {
                            if let Err(e) = self.handle_update(update).await {
                                warn!(error = %e, "error handling order update");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(dropped = n, "order update channel lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("order update channel closed — PositionManager exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Apply one exchange order update to its owning position.
    pub async fn handle_update(&mut self, update: OrderUpdate) -> Result<()> {
        if !self.mode.can_manage_positions().await {
            debug!(order_id = %update.order_id, "update ignored — position management suspended");
            return Ok(());
        }

        let Some(position) = self.locate(&update.order_id).await? else {
            return Ok(());
        };

        match update.status {
            OrderUpdateStatus::Filled => self.on_filled(position, update).await,
            OrderUpdateStatus::Rejected => self.on_rejected(position, update).await,
            // New / PartiallyFilled / Cancelled carry no transition here; the
            // venue reports cumulative quantities on the terminal fill.
            _ => Ok(()),
        }
    }

    /// Find the owning position: the index first, then a store scan so
    /// positions opened after the last rebuild are picked up.
    async fn locate(&mut self, order_id: &str) -> Result<Option<SignalPosition>> {
        if let Some(position_id) = self.index.get(order_id).cloned() {
            let found = self
                .positions
                .get_by(|p: &SignalPosition| p.id == position_id)
                .await?;
            return Ok(found.into_iter().next());
        }
        let found = self
            .positions
            .get_by(|p: &SignalPosition| p.is_open() && p.owns_order(order_id))
            .await?;
        if let Some(position) = found.into_iter().next() {
            self.index_position(&position);
            return Ok(Some(position));
        }
        Ok(None)
    }

    async fn on_filled(&mut self, position: SignalPosition, update: OrderUpdate) -> Result<()> {
        // A second Closed transition is never applied.
        if position.status == PositionStatus::Closed
            || position.status == PositionStatus::Cancelled
        {
            return Ok(());
        }

        if position.entry_order_id.as_deref() == Some(update.order_id.as_str()) {
            return self.on_entry_filled(position, update).await;
        }
        if position.stop_loss_order_id.as_deref() == Some(update.order_id.as_str()) {
            return self.on_stop_loss_filled(position, update).await;
        }
        if let Some(target_index) = position
            .take_profit_order_ids
            .iter()
            .position(|id| id == &update.order_id)
        {
            return self.on_take_profit_filled(position, update, target_index).await;
        }
        Ok(())
    }

    async fn on_entry_filled(
        &mut self,
        position: SignalPosition,
        update: OrderUpdate,
    ) -> Result<()> {
        // Market entries are already Open when the stream echoes the fill.
        if position.status != PositionStatus::Pending {
            return Ok(());
        }
        let average = if update.average_price > 0.0 {
            update.average_price
        } else {
            position.planned_entry_price
        };
        let opened = position.with_entry_filled(average, update.timestamp);
        self.persist(&opened).await?;
        info!(symbol = %opened.symbol, entry = average, "entry filled — position open");
        self.notifier
            .notify(&format!(
                "✅ {} {} entry filled @ {:.4}",
                opened.direction, opened.symbol, average
            ))
            .await;
        Ok(())
    }

    async fn on_rejected(&mut self, position: SignalPosition, update: OrderUpdate) -> Result<()> {
        if position.entry_order_id.as_deref() != Some(update.order_id.as_str())
            || position.status != PositionStatus::Pending
        {
            return Ok(());
        }
        let cancelled = position.with_cancelled("entry rejected by exchange");
        self.persist(&cancelled).await?;
        self.notifier
            .notify(&format!("⛔ {} entry rejected by the exchange", cancelled.symbol))
            .await;
        Ok(())
    }

    async fn on_take_profit_filled(
        &mut self,
        position: SignalPosition,
        update: OrderUpdate,
        target_index: usize,
    ) -> Result<()> {
        let target = match position.targets.get(target_index) {
            Some(t) => t.clone(),
            None => return Ok(()),
        };
        // Redelivered fills never double-count: the target is already hit.
        if target.hit {
            return Ok(());
        }

        let fill_qty = if update.filled_qty > 0.0 {
            update.filled_qty.min(position.remaining_quantity)
        } else {
            target.quantity_to_close.min(position.remaining_quantity)
        };
        let exit_price = if update.average_price > 0.0 {
            update.average_price
        } else {
            target.price
        };
        let realized = position.slice_pnl(exit_price, fill_qty);
        let mut updated =
            position.with_target_hit(target_index, fill_qty, realized, update.timestamp);

        let fully_closed = updated.targets.iter().all(|t| t.hit)
            || updated.remaining_quantity <= updated.initial_quantity * REMAINDER_EPSILON;

        if fully_closed {
            updated = updated.with_closed(CloseReason::TargetsHit, update.timestamp);
            self.cancel_outstanding(&updated).await;
            self.persist(&updated).await?;
            self.notifier
                .notify(&format!(
                    "🏁 {} fully closed — all targets hit, realized {:.4} USDT",
                    updated.symbol, updated.realized_pnl
                ))
                .await;
            self.statistics.record_close(&updated).await?;
            self.cooldown.on_position_closed(&updated).await?;
            return Ok(());
        }

        // Move the stop before telling anyone: the operator must never hear
        // "partial close" while the remainder is unprotected.
        if let Some(new_stop) = target.move_stop_loss_to {
            updated = self.move_stop_loss(updated, new_stop).await?;
        }
        self.persist(&updated).await?;
        self.notifier
            .notify(&format!(
                "🎯 {} target {} hit @ {:.4} (+{:.4} USDT), {:.6} remaining, SL {:.4}{}",
                updated.symbol,
                target_index + 1,
                exit_price,
                realized,
                updated.remaining_quantity,
                updated.current_stop_loss,
                if updated.protection_incomplete {
                    " — ⚠️ STOP NOT CONFIRMED"
                } else {
                    ""
                }
            ))
            .await;
        Ok(())
    }

    async fn on_stop_loss_filled(
        &mut self,
        position: SignalPosition,
        update: OrderUpdate,
    ) -> Result<()> {
        let exit_price = if update.average_price > 0.0 {
            update.average_price
        } else {
            position.current_stop_loss
        };
        let realized = position.slice_pnl(exit_price, position.remaining_quantity);
        let mut closed = position.clone();
        closed.realized_pnl += realized;
        closed = closed.with_closed(CloseReason::StopLossHit, update.timestamp);

        self.cancel_outstanding(&closed).await;
        self.persist(&closed).await?;
        self.notifier
            .notify(&format!(
                "🛑 {} stopped out @ {:.4}, realized {:.4} USDT",
                closed.symbol, exit_price, closed.realized_pnl
            ))
            .await;
        self.statistics.record_close(&closed).await?;
        self.cooldown.on_position_closed(&closed).await?;
        Ok(())
    }

    /// Cancel-then-place. The window between the two is unavoidable at the
    /// venue; a failed place raises `protection_incomplete` and alerts.
    async fn move_stop_loss(
        &mut self,
        mut position: SignalPosition,
        new_stop: f64,
    ) -> Result<SignalPosition> {
        if let Some(old_id) = position.stop_loss_order_id.clone() {
            let orders = self.orders.clone();
            let symbol = position.symbol.clone();
            let id = old_id.clone();
            if let Err(e) = self
                .retry
                .run("cancel_stop_loss", move || {
                    let orders = orders.clone();
                    let symbol = symbol.clone();
                    let id = id.clone();
                    async move { orders.cancel_order(&symbol, &id).await }
                })
                .await
            {
                warn!(symbol = %position.symbol, error = %e, "failed to cancel old stop-loss");
            }
            self.index.remove(&old_id);
        }

        let placed = self
            .orders
            .place_stop_loss(
                &position.symbol,
                position.direction.close_side(),
                new_stop,
                position.remaining_quantity,
            )
            .await;
        match placed {
            Ok(result) if result.success => {
                position = position.with_stop_loss_order(result.order_id.clone(), new_stop);
                if let Some(id) = result.order_id {
                    self.index.insert(id, position.id.clone());
                }
                info!(symbol = %position.symbol, stop = new_stop, "stop-loss moved");
            }
            Ok(result) => {
                warn!(symbol = %position.symbol, reason = ?result.reject_reason, "replacement stop-loss rejected");
                position.stop_loss_order_id = None;
                position = position.with_protection_incomplete();
                self.alert_unprotected(&position).await;
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "replacement stop-loss placement failed");
                position.stop_loss_order_id = None;
                position = position.with_protection_incomplete();
                self.alert_unprotected(&position).await;
            }
        }
        Ok(position)
    }

    async fn alert_unprotected(&self, position: &SignalPosition) {
        self.notifier
            .notify(&format!(
                "🚨 {} has {:.6} remaining with NO live stop-loss — intervene now",
                position.symbol, position.remaining_quantity
            ))
            .await;
    }

    /// Best-effort cancel of every remaining protective order on a closed
    /// position.
    async fn cancel_outstanding(&mut self, position: &SignalPosition) {
        let mut order_ids: Vec<String> = Vec::new();
        order_ids.extend(position.stop_loss_order_id.iter().cloned());
        for (i, id) in position.take_profit_order_ids.iter().enumerate() {
            let hit = position.targets.get(i).map(|t| t.hit).unwrap_or(false);
            if !hit {
                order_ids.push(id.clone());
            }
        }
        for order_id in order_ids {
            if let Err(e) = self.orders.cancel_order(&position.symbol, &order_id).await {
                warn!(symbol = %position.symbol, order_id = %order_id, error = %e, "failed to cancel outstanding order");
            }
            self.index.remove(&order_id);
        }
    }

    async fn persist(&self, position: &SignalPosition) -> Result<()> {
        self.positions
            .add_or_update(position.clone(), |p| p.id.clone())
            .await
    }
}
