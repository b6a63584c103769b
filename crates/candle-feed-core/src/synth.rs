//! Synthetic OHLCV generation.
//!
//! Bars produced here come from a bounded random walk. They are internally
//! consistent placeholder data, not a market simulation, and must never be
//! presented as real price history.

use rand::Rng;
use rust_decimal::Decimal;

use crate::candle::Candle;
use crate::error::FeedError;

const PRICE_DP: u32 = 2;

/// Smallest price a synthetic bar may carry after rounding.
fn min_price() -> Decimal {
    Decimal::new(1, PRICE_DP)
}

fn to_decimal(value: f64) -> Decimal {
    // Draws are bounded and finite; a failed conversion only means no movement.
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

/// Parameters of the random walk that do not depend on the timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleSynthesizer {
    /// Wick size as a fraction of volatility (`k`).
    wick_fraction: f64,
    volume_min: u64,
    volume_max: u64,
}

impl Default for CandleSynthesizer {
    fn default() -> Self {
        Self {
            wick_fraction: 0.5,
            volume_min: 500_000,
            volume_max: 1_500_000,
        }
    }
}

impl CandleSynthesizer {
    pub fn new(wick_fraction: f64, volume_min: u64, volume_max: u64) -> Result<Self, FeedError> {
        if !(0.0..=1.0).contains(&wick_fraction) {
            return Err(FeedError::InvalidConfig(format!(
                "wick fraction {wick_fraction} outside [0, 1]"
            )));
        }
        if volume_min > volume_max {
            return Err(FeedError::InvalidConfig(format!(
                "volume range {volume_min}..{volume_max} is empty"
            )));
        }
        Ok(Self {
            wick_fraction,
            volume_min,
            volume_max,
        })
    }

    /// Produce one bar for `bucket_start` around `base_price`.
    ///
    /// Open and close each move by up to `volatility / 2` in either direction;
    /// wicks extend the body by up to `volatility * wick_fraction`. Prices are
    /// rounded to cents and volume to a whole number.
    pub fn synthesize<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        symbol: &str,
        bucket_start: i64,
        base_price: Decimal,
        volatility: f64,
    ) -> Candle {
        let half = volatility.abs() / 2.0;
        let wick_max = volatility.abs() * self.wick_fraction;

        let open_move = to_decimal(rng.random_range(-half..=half));
        let close_move = to_decimal(rng.random_range(-half..=half));
        let wick = to_decimal(rng.random_range(0.0..=wick_max));

        let open = (base_price * (Decimal::ONE + open_move))
            .round_dp(PRICE_DP)
            .max(min_price());
        let close = (open * (Decimal::ONE + close_move))
            .round_dp(PRICE_DP)
            .max(min_price());

        let body_high = open.max(close);
        let body_low = open.min(close);
        let high = (body_high * (Decimal::ONE + wick)).round_dp(PRICE_DP);
        let low = (body_low * (Decimal::ONE - wick))
            .round_dp(PRICE_DP)
            .max(min_price())
            .min(body_low);

        let volume = Decimal::from(rng.random_range(self.volume_min..=self.volume_max));

        Candle {
            bucket_start,
            symbol: symbol.to_string(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Produce `count` consecutive bars ending at `end_bucket`, each bar's close
    /// seeding the next one. Buckets run from `end_bucket - (count - 1) * width`
    /// up to `end_bucket`.
    #[allow(clippy::too_many_arguments)]
    pub fn synthesize_series<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        symbol: &str,
        end_bucket: i64,
        count: usize,
        width_secs: i64,
        base_price: Decimal,
        volatility: f64,
    ) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(count);
        let mut price = base_price;
        let first = end_bucket - (count as i64 - 1) * width_secs;

        for i in 0..count as i64 {
            let candle = self.synthesize(rng, symbol, first + i * width_secs, price, volatility);
            price = candle.close;
            candles.push(candle);
        }
        candles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rust_decimal_macros::dec;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn synthesized_candles_are_consistent() {
        let synth = CandleSynthesizer::default();
        let mut rng = rng();
        for i in 0..2_000 {
            let c = synth.synthesize(&mut rng, "BTCUSDT", i * 60, dec!(95000), 0.24);
            assert!(c.low <= c.open.min(c.close), "low above body: {c:?}");
            assert!(c.high >= c.open.max(c.close), "high below body: {c:?}");
            assert!(c.low > Decimal::ZERO);
        }
    }

    #[test]
    fn prices_have_at_most_two_decimals() {
        let synth = CandleSynthesizer::default();
        let mut rng = rng();
        for _ in 0..500 {
            let c = synth.synthesize(&mut rng, "BTCUSDT", 0, dec!(95000.37), 0.015);
            for price in [c.open, c.high, c.low, c.close] {
                assert!(price.scale() <= 2, "too many decimals: {price}");
            }
            assert_eq!(c.volume.fract(), Decimal::ZERO);
        }
    }

    #[test]
    fn open_stays_within_half_volatility() {
        let synth = CandleSynthesizer::default();
        let mut rng = rng();
        for _ in 0..500 {
            let c = synth.synthesize(&mut rng, "BTCUSDT", 0, dec!(10000), 0.1);
            // 10000 * (1 ± 0.05), plus a cent of rounding slack.
            assert!(c.open >= dec!(9499.99) && c.open <= dec!(10500.01));
        }
    }

    #[test]
    fn volume_within_configured_range() {
        let synth = CandleSynthesizer::new(0.3, 10, 20).unwrap();
        let mut rng = rng();
        for _ in 0..200 {
            let c = synth.synthesize(&mut rng, "BTCUSDT", 0, dec!(100), 0.01);
            assert!(c.volume >= dec!(10) && c.volume <= dec!(20));
        }
    }

    #[test]
    fn zero_volatility_is_flat() {
        let synth = CandleSynthesizer::new(0.5, 1, 1).unwrap();
        let mut rng = rng();
        let c = synth.synthesize(&mut rng, "BTCUSDT", 0, dec!(123.45), 0.0);
        assert_eq!(c.open, dec!(123.45));
        assert_eq!(c.close, dec!(123.45));
        assert_eq!(c.high, dec!(123.45));
        assert_eq!(c.low, dec!(123.45));
    }

    #[test]
    fn tiny_base_price_stays_positive() {
        let synth = CandleSynthesizer::default();
        let mut rng = rng();
        for _ in 0..200 {
            let c = synth.synthesize(&mut rng, "X", 0, dec!(0.01), 0.9);
            assert!(c.low > Decimal::ZERO);
            assert!(c.is_consistent());
        }
    }

    #[test]
    fn series_is_spaced_and_ends_at_end_bucket() {
        let synth = CandleSynthesizer::default();
        let mut rng = rng();
        let end = 1_736_956_800;
        let series = synth.synthesize_series(&mut rng, "BTCUSDT", end, 100, 3600, dec!(95000), 0.06);

        assert_eq!(series.len(), 100);
        assert_eq!(series.last().unwrap().bucket_start, end);
        assert_eq!(series[0].bucket_start, end - 99 * 3600);
        for pair in series.windows(2) {
            assert_eq!(pair[1].bucket_start - pair[0].bucket_start, 3600);
        }
    }

    #[test]
    fn series_walk_is_continuous_in_base() {
        let synth = CandleSynthesizer::default();
        let mut rng = rng();
        let series = synth.synthesize_series(&mut rng, "BTCUSDT", 600, 11, 60, dec!(100), 0.02);
        for pair in series.windows(2) {
            // Next open is within half volatility of the previous close.
            let bound = pair[0].close * dec!(0.011);
            assert!((pair[1].open - pair[0].close).abs() <= bound);
        }
    }

    #[test]
    fn empty_series() {
        let synth = CandleSynthesizer::default();
        let mut rng = rng();
        assert!(
            synth
                .synthesize_series(&mut rng, "BTCUSDT", 600, 0, 60, dec!(100), 0.02)
                .is_empty()
        );
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(CandleSynthesizer::new(1.5, 0, 1).is_err());
        assert!(CandleSynthesizer::new(0.5, 10, 1).is_err());
    }
}
