use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Order side that opens a position in this direction.
    pub fn entry_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces or closes a position in this direction.
    pub fn close_side(self) -> OrderSide {
        match self {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "Long"),
            Direction::Short => write!(f, "Short"),
        }
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Supported futures venues. The exchange facade is the only venue-aware
/// boundary; everything else carries this tag opaquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Bitget,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Venue::Binance => write!(f, "binance"),
            Venue::Bybit => write!(f, "bybit"),
            Venue::Bitget => write!(f, "bitget"),
        }
    }
}

/// Margin mode applied per symbol before entering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Isolated,
    Cross,
}

/// Where a signal came from: the monitored channel and the exact message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSource {
    pub channel_name: String,
    pub channel_id: i64,
    pub message_id: i64,
}

/// One parsed trading instruction. Created by a parser, adjusted by the
/// validator, consumed exactly once by the trader.
///
/// Invariants (enforced by the validator): for Long,
/// `targets > entry_price > stop_loss` strictly; for Short the reverse;
/// at least one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub id: String,
    pub source: SignalSource,
    /// Base+quote, e.g. "BTCUSDT".
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    /// Stop-loss as written in the message.
    pub stop_loss: f64,
    /// Ordered take-profit prices (1..10), monotonic in signal direction.
    pub targets: Vec<f64>,
    /// Leverage as written in the message (or the parser default).
    pub leverage: u32,
    /// Stop-loss after validator adjustment, if any.
    pub adjusted_stop_loss: Option<f64>,
    /// Leverage after clamping to the risk policy.
    pub adjusted_leverage: Option<u32>,
    /// Best risk/reward ratio among the targets, recorded by the validator.
    pub best_rr: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl TradingSignal {
    pub fn new(
        source: SignalSource,
        symbol: impl Into<String>,
        direction: Direction,
        entry_price: f64,
        stop_loss: f64,
        targets: Vec<f64>,
        leverage: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            symbol: symbol.into(),
            direction,
            entry_price,
            stop_loss,
            targets,
            leverage,
            adjusted_stop_loss: None,
            adjusted_leverage: None,
            best_rr: None,
            created_at: Utc::now(),
        }
    }

    /// Stop-loss the executor must use: the adjusted one when present.
    pub fn effective_stop_loss(&self) -> f64 {
        self.adjusted_stop_loss.unwrap_or(self.stop_loss)
    }

    /// Leverage the executor must use: the adjusted one when present.
    pub fn effective_leverage(&self) -> u32 {
        self.adjusted_leverage.unwrap_or(self.leverage)
    }
}

/// One take-profit level inside a position, with the stop move that follows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetLevel {
    pub price: f64,
    /// Fraction of the initial quantity to close at this level, in percent.
    pub percent_to_close: f64,
    pub quantity_to_close: f64,
    /// New stop-loss once this target fills; `None` leaves the stop in place.
    pub move_stop_loss_to: Option<f64>,
    pub hit: bool,
    pub hit_at: Option<DateTime<Utc>>,
}

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Open,
    PartialClosed,
    Closed,
    Cancelled,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionStatus::Pending => write!(f, "Pending"),
            PositionStatus::Open => write!(f, "Open"),
            PositionStatus::PartialClosed => write!(f, "PartialClosed"),
            PositionStatus::Closed => write!(f, "Closed"),
            PositionStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Why a position reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    TargetsHit,
    StopLossHit,
    Liquidation,
    ManualClose,
    Error,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::TargetsHit => write!(f, "targets hit"),
            CloseReason::StopLossHit => write!(f, "stop-loss hit"),
            CloseReason::Liquidation => write!(f, "liquidation"),
            CloseReason::ManualClose => write!(f, "manual close"),
            CloseReason::Error => write!(f, "error"),
        }
    }
}

/// The aggregate root: a live or finished position born from one signal.
///
/// Snapshots are immutable; every transition builds the next snapshot via a
/// `with_*` method and persists it. Invariant: `remaining_quantity` plus the
/// sum of closed slices equals `initial_quantity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPosition {
    pub id: String,
    pub signal_id: String,
    pub source_channel: String,
    pub venue: Venue,
    pub symbol: String,
    pub direction: Direction,
    pub status: PositionStatus,
    pub planned_entry_price: f64,
    pub actual_entry_price: Option<f64>,
    pub current_stop_loss: f64,
    pub leverage: u32,
    pub initial_quantity: f64,
    pub remaining_quantity: f64,
    pub targets: Vec<TargetLevel>,
    pub entry_order_id: Option<String>,
    pub stop_loss_order_id: Option<String>,
    pub take_profit_order_ids: Vec<String>,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    /// Set when the position is filled but a protective order is not
    /// confirmed live. Surfaced by `/status` and alerts, never silent.
    pub protection_incomplete: bool,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub cancel_reason: Option<String>,
}

impl SignalPosition {
    /// True while the position holds inventory on the exchange.
    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            PositionStatus::Pending | PositionStatus::Open | PositionStatus::PartialClosed
        )
    }

    /// Entry price for PnL math: actual when filled, planned otherwise.
    pub fn entry_price(&self) -> f64 {
        self.actual_entry_price.unwrap_or(self.planned_entry_price)
    }

    /// Direction-aware realized PnL of one closed slice.
    pub fn slice_pnl(&self, exit_price: f64, quantity: f64) -> f64 {
        match self.direction {
            Direction::Long => (exit_price - self.entry_price()) * quantity,
            Direction::Short => (self.entry_price() - exit_price) * quantity,
        }
    }

    /// True if the given order id belongs to this position.
    pub fn owns_order(&self, order_id: &str) -> bool {
        self.entry_order_id.as_deref() == Some(order_id)
            || self.stop_loss_order_id.as_deref() == Some(order_id)
            || self.take_profit_order_ids.iter().any(|id| id == order_id)
    }

    pub fn with_entry_filled(mut self, average_price: f64, at: DateTime<Utc>) -> Self {
        self.actual_entry_price = Some(average_price);
        self.status = PositionStatus::Open;
        self.opened_at = Some(at);
        self
    }

    pub fn with_target_hit(
        mut self,
        index: usize,
        fill_quantity: f64,
        realized: f64,
        at: DateTime<Utc>,
    ) -> Self {
        if let Some(target) = self.targets.get_mut(index) {
            target.hit = true;
            target.hit_at = Some(at);
        }
        self.remaining_quantity = (self.remaining_quantity - fill_quantity).max(0.0);
        self.realized_pnl += realized;
        self.status = PositionStatus::PartialClosed;
        self
    }

    pub fn with_stop_loss_order(mut self, order_id: Option<String>, price: f64) -> Self {
        self.stop_loss_order_id = order_id;
        self.current_stop_loss = price;
        self
    }

    pub fn with_closed(mut self, reason: CloseReason, at: DateTime<Utc>) -> Self {
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.closed_at = Some(at);
        self.remaining_quantity = 0.0;
        self
    }

    pub fn with_cancelled(mut self, reason: impl Into<String>) -> Self {
        self.status = PositionStatus::Cancelled;
        self.cancel_reason = Some(reason.into());
        self
    }

    pub fn with_protection_incomplete(mut self) -> Self {
        self.protection_incomplete = true;
        self
    }
}

/// Status of an order as reported by the venue's update stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderUpdateStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// One event from a venue's private order stream, normalized across venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub venue: Venue,
    pub symbol: String,
    pub order_id: String,
    pub status: OrderUpdateStatus,
    pub filled_qty: f64,
    pub average_price: f64,
    pub reduce_only: bool,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a single order placement. A rejection is data, not an error;
/// only transport failures surface as `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub average_price: Option<f64>,
    pub reject_reason: Option<String>,
}

impl ExecutionResult {
    pub fn filled(order_id: impl Into<String>, average_price: Option<f64>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            average_price,
            reject_reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            average_price: None,
            reject_reason: Some(reason.into()),
        }
    }
}

/// Process-wide loss-streak state, persisted across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CooldownState {
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Process-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OperatingMode {
    #[default]
    Automatic,
    Paused,
    MonitorOnly,
    EmergencyStop,
}

impl OperatingMode {
    /// New signals are admitted only while fully automatic.
    pub fn can_accept_new_signals(self) -> bool {
        self == OperatingMode::Automatic
    }

    /// Open positions keep progressing in Automatic and MonitorOnly.
    pub fn can_manage_positions(self) -> bool {
        matches!(self, OperatingMode::Automatic | OperatingMode::MonitorOnly)
    }

    pub fn is_running(self) -> bool {
        self != OperatingMode::EmergencyStop
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingMode::Automatic => write!(f, "Automatic"),
            OperatingMode::Paused => write!(f, "Paused"),
            OperatingMode::MonitorOnly => write!(f, "MonitorOnly"),
            OperatingMode::EmergencyStop => write!(f, "EmergencyStop"),
        }
    }
}

/// One closed trade kept for rolling-window statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub realized_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

/// Append-only trade log backing the statistics windows. Aggregates are
/// computed on demand from entries newer than `now - window`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub trades: Vec<ClosedTrade>,
}

/// Normalize a broadcast-channel id between its display form (`-100…`) and
/// the bare API form. Ids already in API form pass through unchanged.
pub fn normalize_channel_id(id: i64) -> i64 {
    if id >= 0 {
        return id;
    }
    id.to_string()
        .strip_prefix("-100")
        .and_then(|bare| bare.parse().ok())
        .unwrap_or(id)
}

/// A raw message pulled from a monitored channel, before parsing.
#[derive(Debug, Clone)]
pub struct RawChannelMessage {
    pub channel_name: String,
    pub channel_id: i64,
    pub message_id: i64,
    pub text: String,
}

/// Operator commands delivered by the command bot, answered over a oneshot.
#[derive(Debug)]
pub enum OperatorCommand {
    Status {
        reply: tokio::sync::oneshot::Sender<String>,
    },
    Positions {
        reply: tokio::sync::oneshot::Sender<String>,
    },
    Pause {
        reply: tokio::sync::oneshot::Sender<String>,
    },
    Resume {
        reply: tokio::sync::oneshot::Sender<String>,
    },
    Close {
        symbol: String,
        reply: tokio::sync::oneshot::Sender<String>,
    },
    CloseAll {
        reply: tokio::sync::oneshot::Sender<String>,
    },
    EmergencyStop {
        reply: tokio::sync::oneshot::Sender<String>,
    },
    ResetCooldown {
        reply: tokio::sync::oneshot::Sender<String>,
    },
}

/// Side-effect output channel for operator-facing events.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
}

/// Notifier that only logs. Used in tests and dry runs without a bot token.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) {
        tracing::info!("notification: {text}");
    }
}
