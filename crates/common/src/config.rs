use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, MarginType, Result, Venue};

/// How the stop-loss for a signal is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopLossMode {
    /// Use the stop written in the signal.
    FromSignal,
    /// Replace it with `entry * (1 -/+ stop_loss_percent/100)`.
    Calculate,
}

/// Position-sizing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingMode {
    FixedAmount,
    RiskPercent,
    FixedMargin,
}

/// What to do when the mark price has drifted past the deviation band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviationAction {
    Skip,
    EnterAtMarket,
    EnterAndAdjustTargets,
}

/// What to do when a signal arrives for a symbol that already has an open
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateAction {
    Ignore,
    Add,
    Increase,
    Close,
    Flip,
}

/// One monitored broadcast channel and the parser assigned to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Channel id in API form or display form (`-100…`); normalized on use.
    pub id: i64,
    /// Name of the parser registered for this channel's message format.
    pub parser: String,
    /// Leverage used when the message carries none; falls back to
    /// `trading.default_leverage`, then 1.
    pub default_leverage: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub venue: Venue,
    pub api_key: String,
    pub api_secret: String,
    /// Required by Bitget only.
    pub passphrase: Option<String>,
    pub testnet: bool,
    /// Route orders to the in-process paper venue instead of a real one.
    pub dry_run: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            venue: Venue::Binance,
            api_key: String::new(),
            api_secret: String::new(),
            passphrase: None,
            testnet: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// The single chat authorized to issue commands.
    pub command_chat_id: i64,
    pub authorized_user_ids: Vec<i64>,
    /// Chats that receive notifications (fills, alerts, rejections).
    pub notification_chat_ids: Vec<i64>,
    /// Catch-up polling interval for channels that miss pushes.
    pub poll_interval_secs: u64,
    /// Backoff bounds for transient polling failures, in milliseconds.
    pub poll_base_delay_ms: u64,
    pub poll_max_delay_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            command_chat_id: 0,
            authorized_user_ids: Vec::new(),
            notification_chat_ids: Vec::new(),
            poll_interval_secs: 30,
            poll_base_delay_ms: 500,
            poll_max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DuplicateConfig {
    pub same_direction: DuplicateAction,
    pub opposite_direction: DuplicateAction,
    /// Minimum spacing between entries on the same symbol, in seconds.
    pub min_seconds_between: u64,
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            same_direction: DuplicateAction::Ignore,
            opposite_direction: DuplicateAction::Ignore,
            min_seconds_between: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub default_leverage: u32,
    /// Fraction of the initial quantity closed at each target, in percent.
    /// Applied positionally; the last value repeats for extra targets.
    pub target_close_percents: Vec<f64>,
    pub move_stop_to_breakeven: bool,
    pub margin_type: MarginType,
    pub duplicates: DuplicateConfig,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            default_leverage: 5,
            target_close_percents: vec![25.0, 25.0, 25.0, 25.0],
            move_stop_to_breakeven: true,
            margin_type: MarginType::Isolated,
            duplicates: DuplicateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_leverage: u32,
    pub stop_loss_mode: StopLossMode,
    /// Used when `stop_loss_mode = Calculate`.
    pub stop_loss_percent: f64,
    pub risk_per_trade_percent: f64,
    pub max_drawdown_percent: f64,
    pub max_daily_loss_percent: f64,
    /// Minimum distance between stop-loss and estimated liquidation price,
    /// as a percent of entry.
    pub safe_distance_from_liquidation_percent: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_leverage: 20,
            stop_loss_mode: StopLossMode::FromSignal,
            stop_loss_percent: 2.0,
            risk_per_trade_percent: 1.0,
            max_drawdown_percent: 20.0,
            max_daily_loss_percent: 5.0,
            safe_distance_from_liquidation_percent: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub mode: SizingMode,
    /// Notional per trade for `FixedAmount`, in USDT.
    pub fixed_amount_usdt: f64,
    /// Margin per trade for `FixedMargin`, in USDT.
    pub fixed_margin_usdt: f64,
    /// Equity percent risked per trade for `RiskPercent`.
    pub risk_percent: f64,
    /// Per-symbol `FixedAmount` overrides.
    pub per_symbol_usdt: HashMap<String, f64>,
    pub min_position_usdt: f64,
    pub max_position_usdt: f64,
    /// Cap as a percent of equity.
    pub max_position_percent: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            mode: SizingMode::FixedAmount,
            fixed_amount_usdt: 100.0,
            fixed_margin_usdt: 20.0,
            risk_percent: 1.0,
            per_symbol_usdt: HashMap::new(),
            min_position_usdt: 10.0,
            max_position_usdt: 1_000.0,
            max_position_percent: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    pub max_price_deviation_percent: f64,
    pub deviation_action: DeviationAction,
    pub max_slippage_percent: f64,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            max_price_deviation_percent: 0.5,
            deviation_action: DeviationAction::Skip,
            max_slippage_percent: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownConfig {
    pub after_stop_loss_minutes: u64,
    pub after_liquidation_minutes: u64,
    pub long_cooldown_minutes: u64,
    pub consecutive_losses_for_long_cooldown: u32,
    pub wins_to_reset_loss_counter: u32,
    pub reduce_size_after_losses: bool,
    pub size_multiplier_after_1_loss: f64,
    pub size_multiplier_after_2_losses: f64,
    pub size_multiplier_after_3_losses: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            after_stop_loss_minutes: 15,
            after_liquidation_minutes: 60,
            long_cooldown_minutes: 120,
            consecutive_losses_for_long_cooldown: 3,
            wins_to_reset_loss_counter: 2,
            reduce_size_after_losses: true,
            size_multiplier_after_1_loss: 0.75,
            size_multiplier_after_2_losses: 0.5,
            size_multiplier_after_3_losses: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub data_dir: String,
    pub autosave_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            autosave_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfigSection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfigSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// The whole configuration tree, loaded once at boot and treated as
/// immutable afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub telegram: TelegramConfig,
    pub channels: Vec<ChannelConfig>,
    pub trading: TradingConfig,
    pub risk: RiskConfig,
    pub sizing: SizingConfig,
    pub entry: EntryConfig,
    pub cooldown: CooldownConfig,
    pub persistence: PersistenceConfig,
    pub retry: RetryConfigSection,
}

impl AppConfig {
    /// Load the layered configuration: `appsettings.json`, then
    /// `appsettings.user.json`, then environment variables (`.env` honored)
    /// where `SECTION__KEY` maps to `section.key`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let dir = dir.as_ref();

        let mut tree = read_json_layer(&dir.join("appsettings.json"))?.unwrap_or(Value::Object(
            serde_json::Map::new(),
        ));
        if let Some(user) = read_json_layer(&dir.join("appsettings.user.json"))? {
            merge_json(&mut tree, user);
        }
        apply_env_overrides(&mut tree, std::env::vars());

        let config: AppConfig = serde_json::from_value(tree)
            .map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid combinations before any subsystem starts.
    pub fn validate(&self) -> Result<()> {
        if !self.exchange.dry_run {
            if self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty() {
                return Err(Error::Config(
                    "exchange.api_key and exchange.api_secret are required outside dry_run".into(),
                ));
            }
            if self.exchange.venue == Venue::Bitget && self.exchange.passphrase.is_none() {
                return Err(Error::Config("exchange.passphrase is required for bitget".into()));
            }
        }
        if self.channels.is_empty() {
            return Err(Error::Config("at least one channel must be configured".into()));
        }
        for ch in &self.channels {
            if ch.parser.is_empty() {
                return Err(Error::Config(format!("channel '{}' has no parser assigned", ch.name)));
            }
        }
        if self.risk.max_leverage == 0 {
            return Err(Error::Config("risk.max_leverage must be at least 1".into()));
        }
        if self.entry.max_price_deviation_percent < 0.0 {
            return Err(Error::Config("entry.max_price_deviation_percent must be >= 0".into()));
        }
        if self.sizing.min_position_usdt > self.sizing.max_position_usdt {
            return Err(Error::Config(
                "sizing.min_position_usdt exceeds sizing.max_position_usdt".into(),
            ));
        }
        if !self.trading.target_close_percents.is_empty() {
            let sum: f64 = self.trading.target_close_percents.iter().sum();
            if !(99.0..=101.0).contains(&sum) {
                return Err(Error::Config(format!(
                    "trading.target_close_percents must sum to 100, got {sum}"
                )));
            }
        }
        for m in [
            self.cooldown.size_multiplier_after_1_loss,
            self.cooldown.size_multiplier_after_2_losses,
            self.cooldown.size_multiplier_after_3_losses,
        ] {
            if !(0.0..=1.0).contains(&m) {
                return Err(Error::Config("cooldown size multipliers must be within [0, 1]".into()));
            }
        }
        Ok(())
    }

    /// Default leverage for a channel: per-channel, then global, then 1.
    pub fn default_leverage_for(&self, channel: &ChannelConfig) -> u32 {
        channel
            .default_leverage
            .unwrap_or(self.trading.default_leverage)
            .max(1)
    }
}

fn read_json_layer(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let value = serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(value))
}

/// Deep-merge `overlay` into `base`. Objects merge key by key; anything else
/// replaces.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}

/// Overlay environment variables: `EXCHANGE__API_KEY=x` becomes
/// `exchange.api_key = "x"`. Values parse as JSON when they can, so numbers,
/// booleans and arrays come through typed.
fn apply_env_overrides(tree: &mut Value, vars: impl Iterator<Item = (String, String)>) {
    for (key, raw) in vars {
        if !key.contains("__") {
            continue;
        }
        let path: Vec<String> = key.split("__").map(|s| s.to_lowercase()).collect();
        if path.iter().any(|s| s.is_empty()) {
            continue;
        }
        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        set_path(tree, &path, value);
    }
}

fn set_path(tree: &mut Value, path: &[String], value: Value) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let map = match tree {
        Value::Object(map) => map,
        other => {
            *other = Value::Object(serde_json::Map::new());
            match other {
                Value::Object(map) => map,
                _ => unreachable!(),
            }
        }
    };
    if rest.is_empty() {
        map.insert(head.clone(), value);
    } else {
        let slot = map
            .entry(head.clone())
            .or_insert(Value::Object(serde_json::Map::new()));
        set_path(slot, rest, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_tree() -> Value {
        serde_json::json!({
            "exchange": { "venue": "binance", "api_key": "k", "api_secret": "s" },
            "channels": [ { "name": "alpha", "id": -1001234, "parser": "hashtag" } ],
        })
    }

    #[test]
    fn user_layer_overrides_base() {
        let mut tree = base_tree();
        merge_json(
            &mut tree,
            serde_json::json!({ "exchange": { "testnet": true }, "sizing": { "fixed_amount_usdt": 50.0 } }),
        );
        let cfg: AppConfig = serde_json::from_value(tree).unwrap();
        assert!(cfg.exchange.testnet);
        assert_eq!(cfg.exchange.api_key, "k");
        assert_eq!(cfg.sizing.fixed_amount_usdt, 50.0);
    }

    #[test]
    fn env_override_reaches_nested_key() {
        let mut tree = base_tree();
        let vars = vec![
            ("EXCHANGE__API_KEY".to_string(), "from-env".to_string()),
            ("SIZING__MAX_POSITION_USDT".to_string(), "250".to_string()),
            ("PLAIN_VAR".to_string(), "ignored".to_string()),
        ];
        apply_env_overrides(&mut tree, vars.into_iter());
        let cfg: AppConfig = serde_json::from_value(tree).unwrap();
        assert_eq!(cfg.exchange.api_key, "from-env");
        assert_eq!(cfg.sizing.max_position_usdt, 250.0);
    }

    #[test]
    fn validation_rejects_missing_credentials() {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({
            "channels": [ { "name": "alpha", "id": 1, "parser": "hashtag" } ],
        }))
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_target_percents() {
        let mut cfg: AppConfig = serde_json::from_value(base_tree()).unwrap();
        cfg.trading.target_close_percents = vec![50.0, 20.0];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dry_run_needs_no_credentials() {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({
            "exchange": { "dry_run": true },
            "channels": [ { "name": "alpha", "id": 1, "parser": "hashtag" } ],
        }))
        .unwrap();
        assert!(cfg.validate().is_ok());
    }
}
