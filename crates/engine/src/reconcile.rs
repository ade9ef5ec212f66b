use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{Direction, FuturesOrderExecutor, Result, SignalPosition};
use store::JsonCollectionStore;

/// Relative tolerance when comparing held inventory against the stored
/// remainder; covers fees and venue rounding.
const QUANTITY_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionMismatch {
    pub symbol: String,
    pub position_ids: Vec<String>,
    pub expected_quantity: f64,
    pub exchange_quantity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingOrder {
    pub position_id: String,
    pub symbol: String,
    pub order_id: String,
    pub role: String,
}

/// Outcome of one startup reconciliation pass. Reported to the operator,
/// never auto-corrected: positions and orders on the venue are only ever
/// touched by an explicit command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub confirmed: Vec<String>,
    pub mismatched: Vec<PositionMismatch>,
    pub missing_orders: Vec<MissingOrder>,
}

impl ReconciliationResult {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing_orders.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut text = format!(
            "Reconciliation: {} confirmed, {} mismatched, {} missing orders",
            self.confirmed.len(),
            self.mismatched.len(),
            self.missing_orders.len()
        );
        for m in &self.mismatched {
            text.push_str(&format!(
                "\n  {} expected {:.6}, exchange holds {:.6}",
                m.symbol, m.expected_quantity, m.exchange_quantity
            ));
        }
        for o in &self.missing_orders {
            text.push_str(&format!(
                "\n  {} {} order {} is no longer live",
                o.symbol, o.role, o.order_id
            ));
        }
        text
    }
}

/// Compare every stored open position against the exchange: net inventory per
/// symbol within tolerance, and each recorded protective order still live.
pub async fn reconcile_open_positions(
    orders: &Arc<dyn FuturesOrderExecutor>,
    positions: &JsonCollectionStore<SignalPosition>,
) -> Result<ReconciliationResult> {
    let open = positions.get_by(|p: &SignalPosition| p.is_open()).await?;
    let mut result = ReconciliationResult::default();
    if open.is_empty() {
        info!("reconciliation: no open positions on disk");
        return Ok(result);
    }

    // Net expected inventory per symbol (long positive, short negative).
    let mut by_symbol: HashMap<String, Vec<&SignalPosition>> = HashMap::new();
    for position in &open {
        by_symbol.entry(position.symbol.clone()).or_default().push(position);
    }

    for (symbol, group) in &by_symbol {
        let expected: f64 = group
            .iter()
            .map(|p| match p.direction {
                Direction::Long => p.remaining_quantity,
                Direction::Short => -p.remaining_quantity,
            })
            .sum();
        let held = orders.position_size(symbol).await?;

        let within = if expected.abs() > 0.0 {
            (held - expected).abs() / expected.abs() <= QUANTITY_TOLERANCE
        } else {
            held.abs() <= f64::EPSILON
        };

        if within {
            result.confirmed.extend(group.iter().map(|p| p.id.clone()));
        } else {
            warn!(
                symbol = %symbol,
                expected,
                held,
                "position quantity drift — operator decision required"
            );
            result.mismatched.push(PositionMismatch {
                symbol: symbol.clone(),
                position_ids: group.iter().map(|p| p.id.clone()).collect(),
                expected_quantity: expected,
                exchange_quantity: held,
            });
        }

        let live: HashSet<String> = orders.open_order_ids(symbol).await?.into_iter().collect();
        for position in group {
            let mut recorded: Vec<(&str, String)> = Vec::new();
            if let Some(id) = &position.stop_loss_order_id {
                recorded.push(("stop-loss", id.clone()));
            }
            for (i, id) in position.take_profit_order_ids.iter().enumerate() {
                let hit = position.targets.get(i).map(|t| t.hit).unwrap_or(false);
                if !hit {
                    recorded.push(("take-profit", id.clone()));
                }
            }
            for (role, order_id) in recorded {
                if !live.contains(&order_id) {
                    warn!(symbol = %symbol, order_id = %order_id, role, "recorded order not live on exchange");
                    result.missing_orders.push(MissingOrder {
                        position_id: position.id.clone(),
                        symbol: symbol.clone(),
                        order_id,
                        role: role.to_string(),
                    });
                }
            }
        }
    }

    info!(
        confirmed = result.confirmed.len(),
        mismatched = result.mismatched.len(),
        missing = result.missing_orders.len(),
        "reconciliation finished"
    );
    Ok(result)
}
