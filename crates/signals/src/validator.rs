use thiserror::Error;

use common::config::{RiskConfig, StopLossMode};
use common::{Direction, TradingSignal, Venue};

/// Typed reasons the validator refuses a signal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no targets in signal")]
    NoTargets,
    #[error("price order inconsistent with direction: {0}")]
    InconsistentPrices(String),
    #[error(
        "stop-loss {stop_loss} within {distance:.3}% of estimated liquidation {liquidation:.6} (minimum {required}%)"
    )]
    StopTooCloseToLiquidation {
        stop_loss: f64,
        liquidation: f64,
        distance: f64,
        required: f64,
    },
}

/// Estimated maintenance-margin rate used in the liquidation estimate.
/// Venue-published tier-1 figures; an estimate only, the real ladder is
/// position-size dependent.
fn maintenance_margin_rate(venue: Venue) -> f64 {
    match venue {
        Venue::Binance => 0.004,
        Venue::Bybit => 0.005,
        Venue::Bitget => 0.004,
    }
}

/// Pure signal validation and risk adjustment. No I/O; deterministic on the
/// signal plus the resolved risk policy.
pub struct SignalValidator {
    risk: RiskConfig,
    maintenance_margin: f64,
}

impl SignalValidator {
    pub fn new(risk: RiskConfig, venue: Venue) -> Self {
        Self {
            risk,
            maintenance_margin: maintenance_margin_rate(venue),
        }
    }

    /// Apply the rules in order: price consistency, leverage clamp, stop-loss
    /// mode, liquidation safety, risk/reward. Returns the adjusted signal.
    pub fn validate(&self, mut signal: TradingSignal) -> Result<TradingSignal, ValidationError> {
        if signal.targets.is_empty() {
            return Err(ValidationError::NoTargets);
        }

        // Normalize target order to be monotonic in the signal direction,
        // then check the strict entry/stop/target ordering.
        match signal.direction {
            Direction::Long => signal.targets.sort_by(|a, b| a.total_cmp(b)),
            Direction::Short => signal.targets.sort_by(|a, b| b.total_cmp(a)),
        }
        self.check_price_order(&signal)?;

        let leverage = signal.leverage.min(self.risk.max_leverage).max(1);
        signal.adjusted_leverage = Some(leverage);

        let stop_loss = match self.risk.stop_loss_mode {
            StopLossMode::FromSignal => signal.stop_loss,
            StopLossMode::Calculate => {
                let factor = self.risk.stop_loss_percent / 100.0;
                match signal.direction {
                    Direction::Long => signal.entry_price * (1.0 - factor),
                    Direction::Short => signal.entry_price * (1.0 + factor),
                }
            }
        };
        signal.adjusted_stop_loss = Some(stop_loss);

        let liquidation = self.liquidation_price(signal.entry_price, leverage, signal.direction);
        let distance = (stop_loss - liquidation).abs() / signal.entry_price * 100.0;
        let required = self.risk.safe_distance_from_liquidation_percent;
        let stop_beyond_liquidation = match signal.direction {
            Direction::Long => stop_loss <= liquidation,
            Direction::Short => stop_loss >= liquidation,
        };
        if stop_beyond_liquidation || distance < required {
            return Err(ValidationError::StopTooCloseToLiquidation {
                stop_loss,
                liquidation,
                distance,
                required,
            });
        }

        let risk_per_unit = (signal.entry_price - stop_loss).abs();
        if risk_per_unit > 0.0 {
            signal.best_rr = signal
                .targets
                .iter()
                .map(|t| (t - signal.entry_price).abs() / risk_per_unit)
                .fold(None, |best: Option<f64>, rr| {
                    Some(best.map_or(rr, |b| b.max(rr)))
                });
        }

        Ok(signal)
    }

    /// Rough liquidation estimate: the adverse move that consumes initial
    /// margin less the maintenance buffer.
    pub fn liquidation_price(&self, entry: f64, leverage: u32, direction: Direction) -> f64 {
        let move_fraction = (1.0 / leverage as f64) * (1.0 - self.maintenance_margin);
        match direction {
            Direction::Long => entry * (1.0 - move_fraction),
            Direction::Short => entry * (1.0 + move_fraction),
        }
    }

    fn check_price_order(&self, signal: &TradingSignal) -> Result<(), ValidationError> {
        let entry = signal.entry_price;
        let stop = signal.stop_loss;
        match signal.direction {
            Direction::Long => {
                if stop >= entry {
                    return Err(ValidationError::InconsistentPrices(format!(
                        "long stop-loss {stop} must be below entry {entry}"
                    )));
                }
                if let Some(t) = signal.targets.iter().find(|t| **t <= entry) {
                    return Err(ValidationError::InconsistentPrices(format!(
                        "long target {t} must be above entry {entry}"
                    )));
                }
            }
            Direction::Short => {
                if stop <= entry {
                    return Err(ValidationError::InconsistentPrices(format!(
                        "short stop-loss {stop} must be above entry {entry}"
                    )));
                }
                if let Some(t) = signal.targets.iter().find(|t| **t >= entry) {
                    return Err(ValidationError::InconsistentPrices(format!(
                        "short target {t} must be below entry {entry}"
                    )));
                }
            }
        }
        Ok(())
    }
}
