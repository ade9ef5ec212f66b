use once_cell::sync::Lazy;
use regex::Regex;

use common::{SignalSource, TradingSignal};

use super::{
    extract_direction, extract_entry, extract_leverage, extract_stop_loss, extract_targets,
    ParseError, SignalParser,
};

static TICKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"#\s*([A-Za-z0-9]{2,15})(?:\s*/\s*([A-Za-z]{3,5}))?").expect("valid regex")
});

/// Parser for the hashtag-ticker message format:
///
/// ```text
/// #BTC/USDT LONG
/// Entry: 60000 - 60500
/// Targets: 61000, 62000, 63000
/// Stop loss: 58000
/// Leverage: 10x
/// ```
///
/// The quote asset defaults to USDT when the hashtag has no `/QUOTE` part.
pub struct HashtagParser {
    default_leverage: Option<u32>,
}

impl HashtagParser {
    pub const NAME: &'static str = "hashtag";

    pub fn new(default_leverage: Option<u32>) -> Self {
        Self { default_leverage }
    }
}

impl SignalParser for HashtagParser {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn parse(
        &self,
        text: &str,
        source: SignalSource,
        default_leverage: u32,
    ) -> Result<TradingSignal, ParseError> {
        let caps = TICKER.captures(text).ok_or(ParseError::FormatNotRecognized)?;
        let base = caps
            .get(1)
            .map(|m| m.as_str().to_uppercase())
            .ok_or(ParseError::FormatNotRecognized)?;
        let quote = caps
            .get(2)
            .map(|m| m.as_str().to_uppercase())
            .unwrap_or_else(|| "USDT".to_string());
        let symbol = format!("{base}{quote}");

        let direction = extract_direction(text).ok_or(ParseError::FormatNotRecognized)?;
        let entry = extract_entry(text)?;
        let stop_loss = extract_stop_loss(text)?;
        let targets = extract_targets(text)?;
        let fallback = self.default_leverage.unwrap_or(default_leverage);
        let leverage = extract_leverage(text, fallback)?;

        Ok(TradingSignal::new(
            source, symbol, direction, entry, stop_loss, targets, leverage,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Direction;

    fn source() -> SignalSource {
        SignalSource {
            channel_name: "alpha".into(),
            channel_id: -1001234,
            message_id: 42,
        }
    }

    #[test]
    fn parses_a_full_multiline_signal() {
        let text = "#BTC/USDT LONG\nEntry: 60000\nTargets: 61000, 62000, 63000\nStop loss: 58000\nLeverage: 10x";
        let signal = HashtagParser::new(None).parse(text, source(), 5).unwrap();

        assert_eq!(signal.symbol, "BTCUSDT");
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry_price, 60000.0);
        assert_eq!(signal.stop_loss, 58000.0);
        assert_eq!(signal.targets, vec![61000.0, 62000.0, 63000.0]);
        assert_eq!(signal.leverage, 10);
    }

    #[test]
    fn averages_a_two_value_entry_range() {
        let text = "#ETH/USDT SHORT\nEntry: 3000 - 3100\nTargets: 2900, 2800\nSL: 3200";
        let signal = HashtagParser::new(None).parse(text, source(), 5).unwrap();
        assert_eq!(signal.entry_price, 3050.0);
    }

    #[test]
    fn quote_defaults_to_usdt() {
        let text = "#SOL LONG\nEntry: 150\nTargets: 155, 160\nStop: 140";
        let signal = HashtagParser::new(None).parse(text, source(), 5).unwrap();
        assert_eq!(signal.symbol, "SOLUSDT");
    }

    #[test]
    fn per_line_targets_collect_in_order() {
        let text = "#BTC/USDT LONG\nEntry: 100\nTarget 1: 101\nTarget 2: 102\nTarget 3: 103\nStop: 95";
        let signal = HashtagParser::new(None).parse(text, source(), 5).unwrap();
        assert_eq!(signal.targets, vec![101.0, 102.0, 103.0]);
    }

    #[test]
    fn leverage_falls_back_parser_then_caller() {
        let text = "#BTC/USDT LONG\nEntry: 100\nTargets: 101\nStop: 95";
        let with_parser_default = HashtagParser::new(Some(20)).parse(text, source(), 5).unwrap();
        assert_eq!(with_parser_default.leverage, 20);

        let with_caller_default = HashtagParser::new(None).parse(text, source(), 5).unwrap();
        assert_eq!(with_caller_default.leverage, 5);
    }

    #[test]
    fn missing_targets_is_a_typed_failure() {
        let text = "#BTC/USDT LONG\nEntry: 100\nStop: 95";
        let err = HashtagParser::new(None).parse(text, source(), 5).unwrap_err();
        assert_eq!(err, ParseError::NoTargets);
    }

    #[test]
    fn missing_stop_is_a_typed_failure() {
        let text = "#BTC/USDT LONG\nEntry: 100\nTargets: 101, 102";
        let err = HashtagParser::new(None).parse(text, source(), 5).unwrap_err();
        assert_eq!(err, ParseError::InvalidStopLoss);
    }

    #[test]
    fn both_directions_in_one_message_is_not_recognized() {
        let text = "#BTC/USDT LONG or SHORT?\nEntry: 100\nTargets: 101\nStop: 95";
        let err = HashtagParser::new(None).parse(text, source(), 5).unwrap_err();
        assert_eq!(err, ParseError::FormatNotRecognized);
    }

    #[test]
    fn oversized_leverage_is_invalid() {
        let text = "#BTC/USDT LONG\nEntry: 100\nTargets: 101\nStop: 95\nLeverage: 500x";
        let err = HashtagParser::new(None).parse(text, source(), 5).unwrap_err();
        assert_eq!(err, ParseError::InvalidLeverage);
    }
}
