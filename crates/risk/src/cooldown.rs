use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use common::config::CooldownConfig;
use common::{CloseReason, CooldownState, Result, SignalPosition};
use store::JsonSingletonStore;

/// Policy surface around consecutive-loss behavior.
///
/// Holds the process-wide `CooldownState`; every mutation is persisted
/// through the singleton store before the call returns. All reads and writes
/// go through one `RwLock`, so counter updates never interleave.
pub struct CooldownController {
    config: CooldownConfig,
    state: RwLock<CooldownState>,
    store: Arc<JsonSingletonStore<CooldownState>>,
}

impl CooldownController {
    /// Restore persisted state from the store.
    pub async fn load(
        config: CooldownConfig,
        store: Arc<JsonSingletonStore<CooldownState>>,
    ) -> Result<Self> {
        let state = store.load().await?;
        if state.consecutive_losses > 0 {
            info!(
                losses = state.consecutive_losses,
                "cooldown state restored with an active loss streak"
            );
        }
        Ok(Self {
            config,
            state: RwLock::new(state),
            store,
        })
    }

    /// Feed one closed position into the streak counters.
    pub async fn on_position_closed(&self, position: &SignalPosition) -> Result<()> {
        let Some(reason) = position.close_reason else {
            return Ok(());
        };
        let mut state = self.state.write().await;
        match reason {
            CloseReason::StopLossHit => {
                self.register_loss(&mut state, self.config.after_stop_loss_minutes, "stop-loss");
            }
            CloseReason::Liquidation => {
                self.register_loss(&mut state, self.config.after_liquidation_minutes, "liquidation");
            }
            CloseReason::TargetsHit => {
                state.consecutive_wins += 1;
                if state.consecutive_wins >= self.config.wins_to_reset_loss_counter {
                    info!(
                        wins = state.consecutive_wins,
                        "win streak reached — loss counter reset"
                    );
                    state.consecutive_losses = 0;
                    state.consecutive_wins = 0;
                }
            }
            // Operator intervention and error closes say nothing about edge.
            CloseReason::ManualClose | CloseReason::Error => return Ok(()),
        }
        self.store.save(&state).await
    }

    fn register_loss(&self, state: &mut CooldownState, base_minutes: u64, what: &str) {
        state.consecutive_losses += 1;
        state.consecutive_wins = 0;

        let minutes = if state.consecutive_losses >= self.config.consecutive_losses_for_long_cooldown
        {
            self.config.long_cooldown_minutes
        } else {
            base_minutes
        };
        let until = Utc::now() + Duration::minutes(minutes as i64);
        state.cooldown_until = Some(until);
        state.reason = Some(format!(
            "{what} close #{} — paused until {until}",
            state.consecutive_losses
        ));
        warn!(
            losses = state.consecutive_losses,
            minutes, "loss registered — cooldown armed"
        );
    }

    /// The active cooldown reason, or `None` when the clock has passed.
    pub async fn active_reason(&self) -> Option<String> {
        let state = self.state.read().await;
        match state.cooldown_until {
            Some(until) if until > Utc::now() => Some(
                state
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("cooldown until {until}")),
            ),
            _ => None,
        }
    }

    /// Sizing multiplier for the current loss streak; `1.0` when reduction is
    /// disabled.
    pub async fn size_multiplier(&self) -> f64 {
        if !self.config.reduce_size_after_losses {
            return 1.0;
        }
        match self.state.read().await.consecutive_losses {
            0 => 1.0,
            1 => self.config.size_multiplier_after_1_loss,
            2 => self.config.size_multiplier_after_2_losses,
            _ => self.config.size_multiplier_after_3_losses,
        }
    }

    /// Clear the clock; the counters stay.
    pub async fn force_reset_cooldown(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.cooldown_until = None;
        state.reason = None;
        info!("cooldown clock cleared by operator");
        self.store.save(&state).await
    }

    /// Zero the counters; the clock stays.
    pub async fn force_reset_loss_counter(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.consecutive_losses = 0;
        state.consecutive_wins = 0;
        info!("loss counters cleared by operator");
        self.store.save(&state).await
    }

    pub async fn snapshot(&self) -> CooldownState {
        self.state.read().await.clone()
    }

    /// Flush the in-memory state to disk (autosave timer).
    pub async fn flush(&self) -> Result<()> {
        let state = self.state.read().await;
        self.store.save(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Direction, PositionStatus, Venue};

    fn closed_position(reason: CloseReason) -> SignalPosition {
        SignalPosition {
            id: "p1".into(),
            signal_id: "s1".into(),
            source_channel: "alpha".into(),
            venue: Venue::Binance,
            symbol: "BTCUSDT".into(),
            direction: Direction::Long,
            status: PositionStatus::Closed,
            planned_entry_price: 100.0,
            actual_entry_price: Some(100.0),
            current_stop_loss: 95.0,
            leverage: 10,
            initial_quantity: 1.0,
            remaining_quantity: 0.0,
            targets: Vec::new(),
            entry_order_id: None,
            stop_loss_order_id: None,
            take_profit_order_ids: Vec::new(),
            realized_pnl: 0.0,
            unrealized_pnl: 0.0,
            protection_incomplete: false,
            created_at: Utc::now(),
            opened_at: Some(Utc::now()),
            closed_at: Some(Utc::now()),
            close_reason: Some(reason),
            cancel_reason: None,
        }
    }

    async fn controller(config: CooldownConfig) -> CooldownController {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonSingletonStore::open(dir.path().join("cooldown.json")).unwrap(),
        );
        // Keep the tempdir alive for the test duration by leaking it; the OS
        // cleans the files up with the test process.
        std::mem::forget(dir);
        CooldownController::load(config, store).await.unwrap()
    }

    #[tokio::test]
    async fn three_stop_losses_arm_the_long_cooldown() {
        let config = CooldownConfig {
            consecutive_losses_for_long_cooldown: 3,
            after_stop_loss_minutes: 15,
            long_cooldown_minutes: 120,
            ..CooldownConfig::default()
        };
        let controller = controller(config).await;

        for _ in 0..3 {
            controller
                .on_position_closed(&closed_position(CloseReason::StopLossHit))
                .await
                .unwrap();
        }

        let state = controller.snapshot().await;
        assert_eq!(state.consecutive_losses, 3);
        assert_eq!(controller.size_multiplier().await, 0.25);

        let remaining = state.cooldown_until.unwrap() - Utc::now();
        assert!(remaining >= Duration::minutes(119), "expected a ~2h cooldown");
    }

    #[tokio::test]
    async fn wins_reset_both_counters_and_the_multiplier() {
        let config = CooldownConfig {
            wins_to_reset_loss_counter: 2,
            ..CooldownConfig::default()
        };
        let controller = controller(config).await;

        for _ in 0..2 {
            controller
                .on_position_closed(&closed_position(CloseReason::StopLossHit))
                .await
                .unwrap();
        }
        assert_eq!(controller.size_multiplier().await, 0.5);

        for _ in 0..2 {
            controller
                .on_position_closed(&closed_position(CloseReason::TargetsHit))
                .await
                .unwrap();
        }

        let state = controller.snapshot().await;
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.consecutive_wins, 0);
        assert_eq!(controller.size_multiplier().await, 1.0);
    }

    #[tokio::test]
    async fn manual_close_leaves_counters_untouched() {
        let controller = controller(CooldownConfig::default()).await;
        controller
            .on_position_closed(&closed_position(CloseReason::StopLossHit))
            .await
            .unwrap();
        controller
            .on_position_closed(&closed_position(CloseReason::ManualClose))
            .await
            .unwrap();

        let state = controller.snapshot().await;
        assert_eq!(state.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn force_reset_cooldown_keeps_counters() {
        let controller = controller(CooldownConfig::default()).await;
        controller
            .on_position_closed(&closed_position(CloseReason::StopLossHit))
            .await
            .unwrap();
        assert!(controller.active_reason().await.is_some());

        controller.force_reset_cooldown().await.unwrap();
        assert!(controller.active_reason().await.is_none());
        assert_eq!(controller.snapshot().await.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn liquidation_uses_its_own_duration() {
        let config = CooldownConfig {
            after_liquidation_minutes: 60,
            consecutive_losses_for_long_cooldown: 5,
            ..CooldownConfig::default()
        };
        let controller = controller(config).await;
        controller
            .on_position_closed(&closed_position(CloseReason::Liquidation))
            .await
            .unwrap();

        let state = controller.snapshot().await;
        let remaining = state.cooldown_until.unwrap() - Utc::now();
        assert!(remaining >= Duration::minutes(59));
        assert!(remaining <= Duration::minutes(60));
    }
}
