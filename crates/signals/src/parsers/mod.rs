pub mod dollar;
pub mod hashtag;

pub use dollar::DollarParser;
pub use hashtag::HashtagParser;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use common::{Direction, SignalSource, TradingSignal};

/// Typed reasons a recognized message failed to parse. A malformed but
/// recognized message must fail, never degrade into a half-filled signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Signal format not recognized")]
    FormatNotRecognized,
    #[error("No targets found")]
    NoTargets,
    #[error("Invalid entry price")]
    InvalidEntryPrice,
    #[error("Invalid stop loss price")]
    InvalidStopLoss,
    #[error("Invalid leverage")]
    InvalidLeverage,
}

/// Turns raw message text into a `TradingSignal`. Implementations are
/// identified by a stable name; the channel table maps channels to names,
/// so a new message format is only a new parser instance.
pub trait SignalParser: Send + Sync {
    fn name(&self) -> &str;

    fn parse(
        &self,
        text: &str,
        source: SignalSource,
        default_leverage: u32,
    ) -> Result<TradingSignal, ParseError>;
}

// ─── Shared extraction helpers ───────────────────────────────────────────────

static DIRECTION_LONG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(long|buy)\b").expect("valid regex"));
static DIRECTION_SHORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(short|sell)\b").expect("valid regex"));
static ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)entry(?:\s*(?:zone|price))?\s*[:=]?\s*([0-9]*\.?[0-9]+)(?:\s*[-–~]\s*([0-9]*\.?[0-9]+))?")
        .expect("valid regex")
});
static STOP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:stop\s*-?\s*loss|stop|\bsl\b)\s*[:=]?\s*([0-9]*\.?[0-9]+)")
        .expect("valid regex")
});
static TARGET_INDEXED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:target|take\s*-?\s*profit|tp)\s*(\d{1,2})\s*[:=.)]\s*([0-9]*\.?[0-9]+)")
        .expect("valid regex")
});
static TARGETS_LIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:targets?|take\s*-?\s*profits?|tps?)\b\s*[:=]?\s*([^\n|]*)")
        .expect("valid regex")
});
static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]*\.?[0-9]+").expect("valid regex"));
static LEVERAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:lev(?:erage)?\s*[:=]?\s*x?\s*([0-9]{1,3})|([0-9]{1,3})\s*x\b|x\s*([0-9]{1,3})\b)")
        .expect("valid regex")
});

pub(crate) fn extract_direction(text: &str) -> Option<Direction> {
    // A message naming both sides is ambiguous; refuse rather than guess.
    match (DIRECTION_LONG.is_match(text), DIRECTION_SHORT.is_match(text)) {
        (true, false) => Some(Direction::Long),
        (false, true) => Some(Direction::Short),
        _ => None,
    }
}

/// Entry price; a two-value range averages into one.
pub(crate) fn extract_entry(text: &str) -> Result<f64, ParseError> {
    let caps = ENTRY.captures(text).ok_or(ParseError::FormatNotRecognized)?;
    let first: f64 = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or(ParseError::InvalidEntryPrice)?;
    let entry = match caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok()) {
        Some(second) => (first + second) / 2.0,
        None => first,
    };
    if entry > 0.0 && entry.is_finite() {
        Ok(entry)
    } else {
        Err(ParseError::InvalidEntryPrice)
    }
}

pub(crate) fn extract_stop_loss(text: &str) -> Result<f64, ParseError> {
    let stop: f64 = STOP
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or(ParseError::InvalidStopLoss)?;
    if stop > 0.0 && stop.is_finite() {
        Ok(stop)
    } else {
        Err(ParseError::InvalidStopLoss)
    }
}

/// All target prices, in message order. Handles both one-target-per-line
/// layouts (`Target 1: 101`) and comma/space lists (`Targets: 101, 102`).
/// List capture stops at a newline or `|` so trailing segments such as a
/// leverage suffix never leak in as targets.
pub(crate) fn extract_targets(text: &str) -> Result<Vec<f64>, ParseError> {
    let mut indexed: Vec<(u32, f64)> = TARGET_INDEXED
        .captures_iter(text)
        .filter_map(|caps| {
            let index: u32 = caps[1].parse().ok()?;
            let value: f64 = caps[2].parse().ok()?;
            (value > 0.0 && value.is_finite()).then_some((index, value))
        })
        .collect();

    let mut targets: Vec<f64> = if indexed.is_empty() {
        TARGETS_LIST
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .flat_map(|rest| {
                NUMBER
                    .find_iter(rest.as_str())
                    .filter_map(|num| num.as_str().parse::<f64>().ok())
                    .filter(|v| *v > 0.0 && v.is_finite())
                    .collect::<Vec<_>>()
            })
            .collect()
    } else {
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, value)| value).collect()
    };

    targets.truncate(10);
    if targets.is_empty() {
        Err(ParseError::NoTargets)
    } else {
        Ok(targets)
    }
}

/// Leverage from the text, or the caller's default. Zero is invalid.
pub(crate) fn extract_leverage(text: &str, default: u32) -> Result<u32, ParseError> {
    let Some(caps) = LEVERAGE.captures(text) else {
        return Ok(default.max(1));
    };
    let leverage: u32 = caps
        .iter()
        .skip(1)
        .flatten()
        .next()
        .and_then(|m| m.as_str().parse().ok())
        .ok_or(ParseError::InvalidLeverage)?;
    if (1..=125).contains(&leverage) {
        Ok(leverage)
    } else {
        Err(ParseError::InvalidLeverage)
    }
}
