use proptest::prelude::*;

use common::{Direction, SignalSource};
use signals::{DollarParser, HashtagParser, SignalParser};

fn source() -> SignalSource {
    SignalSource {
        channel_name: "prop".into(),
        channel_id: 1,
        message_id: 1,
    }
}

proptest! {
    /// Rendering a signal canonically and re-parsing it yields the same
    /// fields, for the hashtag format.
    #[test]
    fn hashtag_round_trips_canonical_rendering(
        entry in 1.0f64..50_000.0,
        stop_frac in 0.5f64..0.95,
        t1_frac in 1.01f64..1.2,
        t2_frac in 1.21f64..1.5,
        leverage in 1u32..=125,
        long in proptest::bool::ANY,
    ) {
        let (direction, stop, t1, t2) = if long {
            (Direction::Long, entry * stop_frac, entry * t1_frac, entry * t2_frac)
        } else {
            (Direction::Short, entry / stop_frac, entry / t1_frac, entry / t2_frac)
        };
        let word = if long { "LONG" } else { "SHORT" };
        let text = format!(
            "#BTC/USDT {word}\nEntry: {entry}\nTargets: {t1}, {t2}\nStop loss: {stop}\nLeverage: {leverage}x"
        );

        let parsed = HashtagParser::new(None).parse(&text, source(), 1).unwrap();
        prop_assert_eq!(parsed.symbol, "BTCUSDT");
        prop_assert_eq!(parsed.direction, direction);
        prop_assert_eq!(parsed.entry_price, entry);
        prop_assert_eq!(parsed.stop_loss, stop);
        prop_assert_eq!(parsed.targets, vec![t1, t2]);
        prop_assert_eq!(parsed.leverage, leverage);
    }

    /// Same property for the dollar format.
    #[test]
    fn dollar_round_trips_canonical_rendering(
        entry in 1.0f64..50_000.0,
        stop_frac in 0.5f64..0.95,
        t1_frac in 1.01f64..1.5,
        leverage in 1u32..=125,
    ) {
        let stop = entry * stop_frac;
        let t1 = entry * t1_frac;
        let text =
            format!("$ETH LONG | Entry: {entry} | SL: {stop} | TP: {t1} | Lev: {leverage}x");

        let parsed = DollarParser::new(None).parse(&text, source(), 1).unwrap();
        prop_assert_eq!(parsed.symbol, "ETHUSDT");
        prop_assert_eq!(parsed.entry_price, entry);
        prop_assert_eq!(parsed.stop_loss, stop);
        prop_assert_eq!(parsed.targets, vec![t1]);
        prop_assert_eq!(parsed.leverage, leverage);
    }
}
