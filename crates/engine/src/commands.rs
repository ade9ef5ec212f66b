use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use common::config::RiskConfig;
use common::{
    CloseReason, FuturesMarketData, OperatingMode, OperatorCommand, Result, SignalPosition,
};
use risk::{CooldownController, ModeController, StatisticsAggregator};
use store::JsonCollectionStore;

use crate::trader::SignalTrader;

/// Consumes operator commands from the chat bot and applies them to the
/// controllers. Replies travel back over each command's oneshot.
pub struct CommandHandler {
    positions: Arc<JsonCollectionStore<SignalPosition>>,
    market: Arc<dyn FuturesMarketData>,
    trader: Arc<SignalTrader>,
    cooldown: Arc<CooldownController>,
    mode: Arc<ModeController>,
    statistics: Arc<StatisticsAggregator>,
    risk: RiskConfig,
}

impl CommandHandler {
    pub fn new(
        positions: Arc<JsonCollectionStore<SignalPosition>>,
        market: Arc<dyn FuturesMarketData>,
        trader: Arc<SignalTrader>,
        cooldown: Arc<CooldownController>,
        mode: Arc<ModeController>,
        statistics: Arc<StatisticsAggregator>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            positions,
            market,
            trader,
            cooldown,
            mode,
            statistics,
            risk,
        }
    }

    pub async fn run(
        self,
        mut commands: mpsc::Receiver<OperatorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("CommandHandler running");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("CommandHandler stopping");
                        return;
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle(command).await,
                        None => {
                            warn!("command channel closed — CommandHandler exiting");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, command: OperatorCommand) {
        match command {
            OperatorCommand::Status { reply } => {
                let _ = reply.send(self.status_text().await);
            }
            OperatorCommand::Positions { reply } => {
                let _ = reply.send(self.positions_text().await);
            }
            OperatorCommand::Pause { reply } => {
                self.mode.set(OperatingMode::Paused).await;
                let _ = reply.send("Paused. Open positions stay managed; no new signals.".into());
            }
            OperatorCommand::Resume { reply } => {
                self.mode.set(OperatingMode::Automatic).await;
                let _ = reply.send("Resumed. Accepting signals again.".into());
            }
            OperatorCommand::Close { symbol, reply } => {
                let _ = reply.send(self.close_symbol(&symbol).await);
            }
            OperatorCommand::CloseAll { reply } => {
                let _ = reply.send(self.close_all().await);
            }
            OperatorCommand::EmergencyStop { reply } => {
                self.mode.set(OperatingMode::EmergencyStop).await;
                let closed = self.close_all().await;
                let _ = reply.send(format!("EMERGENCY STOP engaged.\n{closed}"));
            }
            OperatorCommand::ResetCooldown { reply } => {
                let text = match self.cooldown.force_reset_cooldown().await {
                    Ok(()) => "Cooldown clock cleared (loss counters preserved).".to_string(),
                    Err(e) => format!("Failed to reset cooldown: {e}"),
                };
                let _ = reply.send(text);
            }
        }
    }

    async fn open_positions(&self) -> Result<Vec<SignalPosition>> {
        self.positions.get_by(|p: &SignalPosition| p.is_open()).await
    }

    async fn status_text(&self) -> String {
        let mode = self.mode.current().await;
        let balance = match self.market.balance("USDT").await {
            Ok(b) => format!("{b:.2} USDT"),
            Err(e) => format!("unavailable ({e})"),
        };
        let open = self.open_positions().await.unwrap_or_default();
        let realized: f64 = open.iter().map(|p| p.realized_pnl).sum();
        let unprotected = open.iter().filter(|p| p.protection_incomplete).count();

        let mut text = format!(
            "SignalBot status\nMode: {mode}\nBalance: {balance}\nOpen positions: {}\nRealized PnL (open): {realized:.4} USDT",
            open.len()
        );
        if unprotected > 0 {
            text.push_str(&format!(
                "\n🚨 {unprotected} position(s) flagged PROTECTION INCOMPLETE"
            ));
        }
        for window in self.statistics.report().await {
            text.push_str(&format!(
                "\n{}: {} trades, net {:+.4} (gross {:+.4} / {:+.4})",
                window.label, window.trade_count, window.net, window.gross_profit, window.gross_loss
            ));
        }
        let daily_net = self.statistics.daily_net().await;
        if let Ok(balance) = self.market.balance("USDT").await {
            if balance > 0.0 {
                let daily_pct = daily_net / balance * 100.0;
                text.push_str(&format!(
                    "\nDaily: {daily_pct:+.2}% of equity (limit -{:.2}%)",
                    self.risk.max_daily_loss_percent
                ));
            }
        }
        let cooldown = self.cooldown.snapshot().await;
        text.push_str(&format!(
            "\nLoss streak: {}, win streak: {}",
            cooldown.consecutive_losses, cooldown.consecutive_wins
        ));
        if let Some(reason) = self.cooldown.active_reason().await {
            text.push_str(&format!("\nCooldown: {reason}"));
        }
        text
    }

    async fn positions_text(&self) -> String {
        let open = self.open_positions().await.unwrap_or_default();
        if open.is_empty() {
            return "No open positions.".into();
        }
        let mut text = String::from("Open positions:");
        for position in &open {
            let mark = self.market.mark_price(&position.symbol).await.ok();
            let (mark_text, pnl_text, sl_distance) = match mark {
                Some(mark) => {
                    let unrealized = position.slice_pnl(mark, position.remaining_quantity);
                    let distance = (mark - position.current_stop_loss).abs() / mark * 100.0;
                    (
                        format!("{mark:.4}"),
                        format!("{:+.4}", unrealized + position.realized_pnl),
                        format!("{distance:.2}%"),
                    )
                }
                None => ("?".into(), "?".into(), "?".into()),
            };
            let hit = position.targets.iter().filter(|t| t.hit).count();
            text.push_str(&format!(
                "\n{} {} | entry {:.4} | mark {} | qty {:.6} | SL {:.4} ({} away) | targets {}/{} | PnL {}{}",
                position.direction,
                position.symbol,
                position.entry_price(),
                mark_text,
                position.remaining_quantity,
                position.current_stop_loss,
                sl_distance,
                hit,
                position.targets.len(),
                pnl_text,
                if position.protection_incomplete { " 🚨" } else { "" },
            ));
        }
        text
    }

    async fn close_symbol(&self, symbol: &str) -> String {
        let symbol = symbol.to_uppercase();
        let open = match self
            .positions
            .get_by(|p: &SignalPosition| p.is_open() && p.symbol == symbol)
            .await
        {
            Ok(open) => open,
            Err(e) => return format!("Store error: {e}"),
        };
        if open.is_empty() {
            return format!("No open position on {symbol}.");
        }
        let mut lines = Vec::new();
        for position in &open {
            match self
                .trader
                .close_position(position, CloseReason::ManualClose)
                .await
            {
                Ok(closed) => {
                    let _ = self.statistics.record_close(&closed).await;
                    let _ = self.cooldown.on_position_closed(&closed).await;
                    lines.push(format!(
                        "{} closed, realized {:+.4} USDT",
                        closed.symbol, closed.realized_pnl
                    ));
                }
                Err(e) => lines.push(format!("{symbol}: close failed — {e}")),
            }
        }
        lines.join("\n")
    }

    async fn close_all(&self) -> String {
        let open = self.open_positions().await.unwrap_or_default();
        if open.is_empty() {
            return "No open positions.".into();
        }
        let mut lines = Vec::new();
        for position in &open {
            match self
                .trader
                .close_position(position, CloseReason::ManualClose)
                .await
            {
                Ok(closed) => {
                    let _ = self.statistics.record_close(&closed).await;
                    let _ = self.cooldown.on_position_closed(&closed).await;
                    lines.push(format!(
                        "{} closed, realized {:+.4} USDT",
                        closed.symbol, closed.realized_pnl
                    ));
                }
                Err(e) => lines.push(format!("{}: close failed — {e}", position.symbol)),
            }
        }
        lines.join("\n")
    }
}
