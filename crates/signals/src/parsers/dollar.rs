use once_cell::sync::Lazy;
use regex::Regex;

use common::{SignalSource, TradingSignal};

use super::{
    extract_direction, extract_entry, extract_leverage, extract_stop_loss, extract_targets,
    ParseError, SignalParser,
};

static TICKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s*([A-Za-z0-9]{2,15})\b").expect("valid regex"));

/// Parser for the dollar-ticker message format, usually a single line:
///
/// ```text
/// $BTC LONG | Entry: 60000 | SL: 58000 | TP: 61000 62000 63000 | Lev: 10x
/// ```
pub struct DollarParser {
    default_leverage: Option<u32>,
}

impl DollarParser {
    pub const NAME: &'static str = "dollar";

    pub fn new(default_leverage: Option<u32>) -> Self {
        Self { default_leverage }
    }
}

impl SignalParser for DollarParser {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn parse(
        &self,
        text: &str,
        source: SignalSource,
        default_leverage: u32,
    ) -> Result<TradingSignal, ParseError> {
        let base = TICKER
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_uppercase())
            .ok_or(ParseError::FormatNotRecognized)?;
        let symbol = format!("{base}USDT");

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
            channel_name: "beta".into(),
            channel_id: -1005678,
            message_id: 7,
        }
    }

    #[test]
    fn parses_a_single_line_signal() {
        let text = "$BTC LONG | Entry: 60000 | SL: 58000 | TP: 61000 62000 | Lev: 10x";
        let signal = DollarParser::new(None).parse(text, source(), 5).unwrap();

        assert_eq!(signal.symbol, "BTCUSDT");
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.entry_price, 60000.0);
        assert_eq!(signal.stop_loss, 58000.0);
        assert_eq!(signal.targets, vec![61000.0, 62000.0]);
        assert_eq!(signal.leverage, 10);
    }

    #[test]
    fn parses_a_short_with_entry_range() {
        let text = "$ETH short entry 3000-3100 sl 3200 tp 2900, 2800, 2700";
        let signal = DollarParser::new(None).parse(text, source(), 3).unwrap();

        assert_eq!(signal.direction, Direction::Short);
        assert_eq!(signal.entry_price, 3050.0);
        assert_eq!(signal.targets, vec![2900.0, 2800.0, 2700.0]);
        assert_eq!(signal.leverage, 3);
    }

    #[test]
    fn hashtag_text_is_not_recognized() {
        let text = "#BTC/USDT LONG\nEntry: 100\nTargets: 101\nStop: 95";
        let err = DollarParser::new(None).parse(text, source(), 5).unwrap_err();
        assert_eq!(err, ParseError::FormatNotRecognized);
    }
}
