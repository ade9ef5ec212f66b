use common::config::{SizingConfig, SizingMode};
use common::TradingSignal;

/// Outcome of the sizing gate.
#[derive(Debug, Clone, PartialEq)]
pub enum SizingOutcome {
    /// Quantity in base-asset units, ready for the order.
    Quantity(f64),
    /// Resulting notional fell below the configured floor; the signal must be
    /// cancelled before any exchange call.
    BelowMinimum { notional: f64, minimum: f64 },
}

/// Pure position-size computation. No I/O; the trader supplies the equity
/// snapshot and the cooldown multiplier.
pub struct PositionSizer {
    config: SizingConfig,
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn quantity(
        &self,
        signal: &TradingSignal,
        equity_usdt: f64,
        cooldown_multiplier: f64,
    ) -> SizingOutcome {
        let entry = signal.entry_price;
        let raw = match self.config.mode {
            SizingMode::FixedAmount => self.fixed_amount_for(&signal.symbol) / entry,
            SizingMode::RiskPercent => {
                let risk_usdt = equity_usdt * self.config.risk_percent / 100.0;
                let per_unit = (entry - signal.effective_stop_loss()).abs();
                if per_unit <= 0.0 {
                    return SizingOutcome::BelowMinimum {
                        notional: 0.0,
                        minimum: self.config.min_position_usdt,
                    };
                }
                risk_usdt / per_unit
            }
            SizingMode::FixedMargin => {
                self.config.fixed_margin_usdt * signal.effective_leverage() as f64 / entry
            }
        };

        let scaled = raw * cooldown_multiplier.clamp(0.0, 1.0);

        let cap_usdt = self
            .config
            .max_position_usdt
            .min(equity_usdt * self.config.max_position_percent / 100.0);
        let capped = scaled.min(cap_usdt / entry);

        let notional = capped * entry;
        if notional < self.config.min_position_usdt {
            SizingOutcome::BelowMinimum {
                notional,
                minimum: self.config.min_position_usdt,
            }
        } else {
            SizingOutcome::Quantity(capped)
        }
    }

    fn fixed_amount_for(&self, symbol: &str) -> f64 {
        self.config
            .per_symbol_usdt
            .get(symbol)
            .copied()
            .unwrap_or(self.config.fixed_amount_usdt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Direction, SignalSource};

    fn signal(entry: f64, stop: f64, leverage: u32) -> TradingSignal {
        let mut s = TradingSignal::new(
            SignalSource {
                channel_name: "alpha".into(),
                channel_id: 1,
                message_id: 1,
            },
            "BTCUSDT",
            Direction::Long,
            entry,
            stop,
            vec![entry * 1.05],
            leverage,
        );
        s.adjusted_leverage = Some(leverage);
        s.adjusted_stop_loss = Some(stop);
        s
    }

    #[test]
    fn fixed_amount_is_capped_by_max_position_usdt() {
        let sizer = PositionSizer::new(SizingConfig {
            mode: SizingMode::FixedAmount,
            fixed_amount_usdt: 100.0,
            max_position_usdt: 5.0,
            max_position_percent: 100.0,
            min_position_usdt: 1.0,
            ..SizingConfig::default()
        });
        let outcome = sizer.quantity(&signal(100.0, 95.0, 10), 1_000.0, 1.0);
        assert_eq!(outcome, SizingOutcome::Quantity(0.05));
    }

    #[test]
    fn fixed_margin_multiplies_by_leverage() {
        let sizer = PositionSizer::new(SizingConfig {
            mode: SizingMode::FixedMargin,
            fixed_margin_usdt: 5.0,
            min_position_usdt: 1.0,
            ..SizingConfig::default()
        });
        let outcome = sizer.quantity(&signal(100.0, 95.0, 10), 1_000.0, 1.0);
        assert_eq!(outcome, SizingOutcome::Quantity(0.5));
    }

    #[test]
    fn risk_percent_divides_by_stop_distance() {
        let sizer = PositionSizer::new(SizingConfig {
            mode: SizingMode::RiskPercent,
            risk_percent: 1.0,
            min_position_usdt: 1.0,
            max_position_usdt: 100_000.0,
            ..SizingConfig::default()
        });
        // 1% of 10_000 = 100 USDT at risk; stop distance 5 → 20 units.
        let outcome = sizer.quantity(&signal(100.0, 95.0, 10), 10_000.0, 1.0);
        assert_eq!(outcome, SizingOutcome::Quantity(20.0));
    }

    #[test]
    fn cooldown_multiplier_scales_before_caps() {
        let sizer = PositionSizer::new(SizingConfig {
            mode: SizingMode::FixedAmount,
            fixed_amount_usdt: 100.0,
            min_position_usdt: 1.0,
            ..SizingConfig::default()
        });
        let outcome = sizer.quantity(&signal(100.0, 95.0, 10), 1_000.0, 0.5);
        assert_eq!(outcome, SizingOutcome::Quantity(0.5));
    }

    #[test]
    fn below_minimum_notional_is_flagged() {
        let sizer = PositionSizer::new(SizingConfig {
            mode: SizingMode::FixedAmount,
            fixed_amount_usdt: 5.0,
            min_position_usdt: 10.0,
            ..SizingConfig::default()
        });
        match sizer.quantity(&signal(100.0, 95.0, 10), 1_000.0, 1.0) {
            SizingOutcome::BelowMinimum { notional, minimum } => {
                assert!((notional - 5.0).abs() < 1e-9);
                assert_eq!(minimum, 10.0);
            }
            other => panic!("expected BelowMinimum, got {other:?}"),
        }
    }

    #[test]
    fn per_symbol_override_wins_over_default() {
        let mut per_symbol = std::collections::HashMap::new();
        per_symbol.insert("BTCUSDT".to_string(), 200.0);
        let sizer = PositionSizer::new(SizingConfig {
            mode: SizingMode::FixedAmount,
            fixed_amount_usdt: 100.0,
            per_symbol_usdt: per_symbol,
            min_position_usdt: 1.0,
            max_position_usdt: 100_000.0,
            ..SizingConfig::default()
        });
        let outcome = sizer.quantity(&signal(100.0, 95.0, 10), 100_000.0, 1.0);
        assert_eq!(outcome, SizingOutcome::Quantity(2.0));
    }
}
