use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use common::config::{DeviationAction, DuplicateAction, EntryConfig, TradingConfig};
use common::{
    CloseReason, FuturesMarketData, FuturesOrderExecutor, Notifier, PositionStatus, Result,
    SignalPosition, TargetLevel, TradingSignal, Venue,
};
use risk::{CooldownController, ModeController, PositionSizer, SizingOutcome};
use store::JsonCollectionStore;

use crate::retry::RetryPolicy;

/// The execution orchestrator: takes a validated signal through the admission
/// gates and, when they all pass, opens the position with its protective
/// orders before returning.
///
/// Gate order is fixed: mode → duplicate → cooldown → deviation → sizing →
/// account prep → entry → protection. Every persisted snapshot is written
/// before the method returns.
pub struct SignalTrader {
    venue: Venue,
    trading: TradingConfig,
    entry: EntryConfig,
    sizer: PositionSizer,
    market: Arc<dyn FuturesMarketData>,
    orders: Arc<dyn FuturesOrderExecutor>,
    positions: Arc<JsonCollectionStore<SignalPosition>>,
    cooldown: Arc<CooldownController>,
    mode: Arc<ModeController>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    /// Last entry time per symbol, for the duplicate spacing rule.
    last_entry: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl SignalTrader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: Venue,
        trading: TradingConfig,
        entry: EntryConfig,
        sizer: PositionSizer,
        market: Arc<dyn FuturesMarketData>,
        orders: Arc<dyn FuturesOrderExecutor>,
        positions: Arc<JsonCollectionStore<SignalPosition>>,
        cooldown: Arc<CooldownController>,
        mode: Arc<ModeController>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            venue,
            trading,
            entry,
            sizer,
            market,
            orders,
            positions,
            cooldown,
            mode,
            notifier,
            retry,
            last_entry: Mutex::new(HashMap::new()),
        }
    }

    /// Execute one validated signal. `Ok(None)` means the mode gate silently
    /// dropped it; any other outcome is a persisted position (possibly
    /// `Cancelled` with a reason).
    pub async fn execute(&self, signal: TradingSignal) -> Result<Option<SignalPosition>> {
        // ── Mode gate ─────────────────────────────────────────────────────
        if !self.mode.can_accept_new_signals().await {
            debug!(symbol = %signal.symbol, "signal dropped — not in Automatic mode");
            return Ok(None);
        }

        // ── Duplicate gate ────────────────────────────────────────────────
        if let Some(cancelled) = self.duplicate_gate(&signal).await? {
            return Ok(Some(cancelled));
        }

        // ── Cooldown gate ─────────────────────────────────────────────────
        if let Some(reason) = self.cooldown.active_reason().await {
            return Ok(Some(self.cancel(&signal, format!("cooldown active: {reason}")).await?));
        }

        // ── Deviation gate ────────────────────────────────────────────────
        let symbol = signal.symbol.clone();
        let market = self.market.clone();
        let mark = {
            let symbol = symbol.clone();
            self.retry
                .run("mark_price", move || {
                    let market = market.clone();
                    let symbol = symbol.clone();
                    async move { market.mark_price(&symbol).await }
                })
                .await?
        };
        let deviation = (mark - signal.entry_price).abs() / signal.entry_price * 100.0;
        let adjust_targets = if deviation <= self.entry.max_price_deviation_percent {
            false
        } else {
            match self.entry.deviation_action {
                DeviationAction::Skip => {
                    return Ok(Some(
                        self.cancel(
                            &signal,
                            format!(
                                "price deviation {deviation:.2}% exceeds {:.2}%",
                                self.entry.max_price_deviation_percent
                            ),
                        )
                        .await?,
                    ));
                }
                DeviationAction::EnterAtMarket => false,
                DeviationAction::EnterAndAdjustTargets => true,
            }
        };

        // ── Sizing gate ───────────────────────────────────────────────────
        let market = self.market.clone();
        let equity = self
            .retry
            .run("balance", move || {
                let market = market.clone();
                async move { market.balance("USDT").await }
            })
            .await?;
        let multiplier = self.cooldown.size_multiplier().await;
        let quantity = match self.sizer.quantity(&signal, equity, multiplier) {
            SizingOutcome::Quantity(q) => q,
            SizingOutcome::BelowMinimum { notional, minimum } => {
                return Ok(Some(
                    self.cancel(
                        &signal,
                        format!("sized notional {notional:.2} USDT below minimum {minimum:.2}"),
                    )
                    .await?,
                ));
            }
        };

        // ── Account prep ──────────────────────────────────────────────────
        let leverage = signal.effective_leverage();
        if let Err(e) = self.prepare_account(&symbol, leverage).await {
            return Ok(Some(self.cancel(&signal, format!("account prep failed: {e}")).await?));
        }

        // ── Entry ─────────────────────────────────────────────────────────
        let mut position = self.build_position(&signal, quantity);
        self.persist(&position).await?;

        let entry_result = self
            .orders
            .place_market_order(&symbol, signal.direction.entry_side(), quantity, false)
            .await;
        let entry_result = match entry_result {
            Ok(result) => result,
            // Result unknown: do not resend. The operator reconciles first.
            Err(e) => {
                error!(symbol = %symbol, error = %e, "entry result unknown");
                position = position
                    .with_cancelled(format!("entry not confirmed ({e}) — reconcile with exchange"));
                self.persist(&position).await?;
                self.notifier
                    .notify(&format!(
                        "⚠️ {symbol} entry result unknown: {e}. Check the exchange before re-sending."
                    ))
                    .await;
                return Ok(Some(position));
            }
        };
        if !entry_result.success {
            let reason = entry_result
                .reject_reason
                .unwrap_or_else(|| "entry rejected".into());
            position = position.with_cancelled(format!("entry rejected: {reason}"));
            self.persist(&position).await?;
            self.notifier
                .notify(&format!("⛔ {symbol} entry rejected: {reason}"))
                .await;
            return Ok(Some(position));
        }

        let actual_entry = entry_result.average_price.unwrap_or(mark);
        position.entry_order_id = entry_result.order_id.clone();
        position = position.with_entry_filled(actual_entry, Utc::now());

        if adjust_targets {
            shift_plan(&mut position, actual_entry - signal.entry_price);
        }
        self.persist(&position).await?;
        self.last_entry
            .lock()
            .await
            .insert(symbol.clone(), Utc::now());

        // ── Protective orders ─────────────────────────────────────────────
        position = self.place_protection(position).await?;

        info!(
            symbol = %symbol,
            qty = quantity,
            entry = actual_entry,
            targets = position.targets.len(),
            "position opened"
        );
        self.notifier
            .notify(&format!(
                "📈 {} {} opened: qty {:.6} @ {:.4}, SL {:.4}, {} targets",
                position.direction,
                symbol,
                quantity,
                actual_entry,
                position.current_stop_loss,
                position.targets.len()
            ))
            .await;
        Ok(Some(position))
    }

    /// Cancel every live order of the position and flatten the remainder at
    /// market. Used by the `/close` family and the flip policy.
    pub async fn close_position(
        &self,
        position: &SignalPosition,
        reason: CloseReason,
    ) -> Result<SignalPosition> {
        let mut order_ids: Vec<String> = Vec::new();
        order_ids.extend(position.stop_loss_order_id.iter().cloned());
        order_ids.extend(position.take_profit_order_ids.iter().cloned());

        for order_id in order_ids {
            let orders = self.orders.clone();
            let symbol = position.symbol.clone();
            let id = order_id.clone();
            if let Err(e) = self
                .retry
                .run("cancel_order", move || {
                    let orders = orders.clone();
                    let symbol = symbol.clone();
                    let id = id.clone();
                    async move { orders.cancel_order(&symbol, &id).await }
                })
                .await
            {
                warn!(symbol = %position.symbol, order_id = %order_id, error = %e, "failed to cancel order during close");
            }
        }

        let mut closed = position.clone();
        if position.remaining_quantity > 0.0 && position.status != PositionStatus::Pending {
            let result = self
                .orders
                .place_market_order(
                    &position.symbol,
                    position.direction.close_side(),
                    position.remaining_quantity,
                    true,
                )
                .await?;
            if !result.success {
                return Err(common::Error::Exchange(format!(
                    "close order rejected: {}",
                    result.reject_reason.unwrap_or_default()
                )));
            }
            let exit_price = result
                .average_price
                .unwrap_or(position.entry_price());
            closed.realized_pnl +=
                position.slice_pnl(exit_price, position.remaining_quantity);
        }

        closed = closed.with_closed(reason, Utc::now());
        self.persist(&closed).await?;
        self.notifier
            .notify(&format!(
                "🔒 {} closed ({}), realized PnL {:.4} USDT",
                closed.symbol, reason, closed.realized_pnl
            ))
            .await;
        Ok(closed)
    }

    // ── Gate helpers ──────────────────────────────────────────────────────

    async fn duplicate_gate(&self, signal: &TradingSignal) -> Result<Option<SignalPosition>> {
        // Spacing rule applies to any entry on the symbol, duplicate or not.
        if let Some(last) = self.last_entry.lock().await.get(&signal.symbol) {
            let elapsed = (Utc::now() - *last).num_seconds().max(0) as u64;
            if elapsed < self.trading.duplicates.min_seconds_between {
                return Ok(Some(
                    self.cancel(
                        signal,
                        format!(
                            "only {elapsed}s since last {} entry (minimum {}s)",
                            signal.symbol, self.trading.duplicates.min_seconds_between
                        ),
                    )
                    .await?,
                ));
            }
        }

        let open = self
            .positions
            .get_by(|p: &SignalPosition| p.symbol == signal.symbol && p.is_open())
            .await?;
        let Some(existing) = open.first() else {
            return Ok(None);
        };

        let action = if existing.direction == signal.direction {
            self.trading.duplicates.same_direction
        } else {
            self.trading.duplicates.opposite_direction
        };
        match action {
            DuplicateAction::Ignore => Ok(Some(
                self.cancel(
                    signal,
                    format!(
                        "open {} position already exists on {}",
                        existing.direction, signal.symbol
                    ),
                )
                .await?,
            )),
            // Both enter an additional independent position.
            DuplicateAction::Add | DuplicateAction::Increase => Ok(None),
            // Close flattens the conflict and drops the incoming signal.
            DuplicateAction::Close => {
                match self.close_position(existing, CloseReason::ManualClose).await {
                    Ok(closed) => Ok(Some(
                        self.cancel(
                            signal,
                            format!(
                                "closed existing {} position on {} per duplicate policy; new signal dropped",
                                closed.direction, signal.symbol
                            ),
                        )
                        .await?,
                    )),
                    Err(e) => Ok(Some(
                        self.cancel(signal, format!("could not close existing position: {e}"))
                            .await?,
                    )),
                }
            }
            // Flip is close-then-re-enter; the new entry is only attempted if
            // the close succeeds, so a half-done flip never leaves two
            // exposures.
            DuplicateAction::Flip => {
                match self.close_position(existing, CloseReason::ManualClose).await {
                    Ok(_) => Ok(None),
                    Err(e) => Ok(Some(
                        self.cancel(signal, format!("could not close existing position: {e}"))
                            .await?,
                    )),
                }
            }
        }
    }

    async fn prepare_account(&self, symbol: &str, leverage: u32) -> Result<()> {
        let orders = self.orders.clone();
        let sym = symbol.to_string();
        self.retry
            .run("set_leverage", move || {
                let orders = orders.clone();
                let sym = sym.clone();
                async move { orders.set_leverage(&sym, leverage).await }
            })
            .await?;

        let orders = self.orders.clone();
        let sym = symbol.to_string();
        let margin = self.trading.margin_type;
        self.retry
            .run("set_margin_type", move || {
                let orders = orders.clone();
                let sym = sym.clone();
                async move { orders.set_margin_type(&sym, margin).await }
            })
            .await
    }

    /// Build the Pending snapshot with its target plan. The breakeven ladder
    /// (entry, then each previous target) is attached here; per-target
    /// overrides from the signal would replace these levels.
    fn build_position(&self, signal: &TradingSignal, quantity: f64) -> SignalPosition {
        let percents = &self.trading.target_close_percents;
        let count = signal.targets.len();
        let equal_share = 100.0 / count as f64;

        let mut targets: Vec<TargetLevel> = Vec::with_capacity(count);
        let mut allocated = 0.0;
        for (i, price) in signal.targets.iter().enumerate() {
            let percent = percents
                .get(i)
                .or(percents.last())
                .copied()
                .unwrap_or(equal_share);
            // The last target always closes whatever the plan left over.
            let quantity_to_close = if i + 1 == count {
                (quantity - allocated).max(0.0)
            } else {
                quantity * percent / 100.0
            };
            allocated += quantity_to_close;

            let move_stop_loss_to = if self.trading.move_stop_to_breakeven {
                Some(if i == 0 {
                    signal.entry_price
                } else {
                    signal.targets[i - 1]
                })
            } else {
                None
            };

            targets.push(TargetLevel {
                price: *price,
                percent_to_close: percent,
                quantity_to_close,
                move_stop_loss_to,
                hit: false,
                hit_at: None,
            });
        }

        SignalPosition {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal.id.clone(),
            source_channel: signal.source.channel_name.clone(),
            venue: self.venue,
            symbol: signal.symbol.clone(),
            direction: signal.direction,
            status: PositionStatus::Pending,
            planned_entry_price: signal.entry_price,
            actual_entry_price: None,
            current_stop_loss: signal.effective_stop_loss(),
            leverage: signal.effective_leverage(),
            initial_quantity: quantity,
            remaining_quantity: quantity,
            targets,
            entry_order_id: None,
            stop_loss_order_id: None,
            take_profit_order_ids: Vec::new(),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            protection_incomplete: false,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
            close_reason: None,
            cancel_reason: None,
        }
    }

    /// Place the stop-loss and one take-profit per target. A failure after
    /// the fill is never silent: the position is flagged and alerted.
    async fn place_protection(&self, mut position: SignalPosition) -> Result<SignalPosition> {
        let close_side = position.direction.close_side();

        match self
            .orders
            .place_stop_loss(
                &position.symbol,
                close_side,
                position.current_stop_loss,
                position.initial_quantity,
            )
            .await
        {
            Ok(result) if result.success => {
                position.stop_loss_order_id = result.order_id;
            }
            Ok(result) => {
                warn!(symbol = %position.symbol, reason = ?result.reject_reason, "stop-loss rejected");
                position = position.with_protection_incomplete();
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "stop-loss placement failed");
                position = position.with_protection_incomplete();
            }
        }

        for target in position.targets.clone() {
            match self
                .orders
                .place_take_profit(
                    &position.symbol,
                    close_side,
                    target.price,
                    target.quantity_to_close,
                )
                .await
            {
                Ok(result) if result.success => {
                    if let Some(id) = result.order_id {
                        position.take_profit_order_ids.push(id);
                    }
                }
                Ok(result) => {
                    warn!(symbol = %position.symbol, price = target.price, reason = ?result.reject_reason, "take-profit rejected");
                    position = position.with_protection_incomplete();
                }
                Err(e) => {
                    warn!(symbol = %position.symbol, price = target.price, error = %e, "take-profit placement failed");
                    position = position.with_protection_incomplete();
                }
            }
        }

        self.persist(&position).await?;
        if position.protection_incomplete {
            self.notifier
                .notify(&format!(
                    "🚨 {} is open but NOT fully protected — check the exchange now",
                    position.symbol
                ))
                .await;
        }
        Ok(position)
    }

    async fn cancel(&self, signal: &TradingSignal, reason: String) -> Result<SignalPosition> {
        warn!(symbol = %signal.symbol, reason = %reason, "signal not executed");
        let position = self.build_position(signal, 0.0).with_cancelled(reason.clone());
        self.persist(&position).await?;
        self.notifier
            .notify(&format!("⛔ {} signal skipped: {reason}", signal.symbol))
            .await;
        Ok(position)
    }

    async fn persist(&self, position: &SignalPosition) -> Result<()> {
        self.positions
            .add_or_update(position.clone(), |p| p.id.clone())
            .await
    }
}

/// Shift every planned price by the entry slippage delta, keeping the
/// original spacing between levels.
fn shift_plan(position: &mut SignalPosition, delta: f64) {
    for target in &mut position.targets {
        target.price += delta;
        if let Some(move_to) = target.move_stop_loss_to.as_mut() {
            *move_to += delta;
        }
    }
}
