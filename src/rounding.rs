use num::rational::Ratio;

/// Rounds `value` half-up to `places` decimal places.
///
/// Ties are resolved away from zero on the scaled digit, so
/// `round_half_up(0.125, 2) == 0.13` and `round_half_up(-0.125, 2) == -0.13`.
pub fn round_half_up(value: f64, places: i32) -> f64 {
    let pow = 10f64.powi(places);
    let digit = pow * value;
    let frac = digit - digit.trunc();
    let rounded = if frac >= 0.5 {
        digit.ceil()
    } else {
        digit.floor()
    };
    rounded / pow
}

/// Converts an exact rational to a float with `places` decimal places,
/// rounding half away from zero.
///
/// Percentage derivations are specified in rational arithmetic so that
/// e.g. `100 - free/total * 100` carries no intermediate float error; only
/// the final fixed-precision conversion rounds.
pub fn ratio_round(value: Ratio<i128>, places: u32) -> f64 {
    let pow = 10i128.pow(places);
    let scaled = value * Ratio::from_integer(pow);
    let num = *scaled.numer();
    let den = *scaled.denom();

    let rounded = if num >= 0 {
        (2 * num + den) / (2 * den)
    } else {
        -((2 * -num + den) / (2 * den))
    };

    rounded as f64 / pow as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_up_basic() {
        assert_eq!(round_half_up(0.333_333, 4), 0.3333);
        assert_eq!(round_half_up(0.25, 1), 0.3);
        assert_eq!(round_half_up(0.125, 2), 0.13);
        assert_eq!(round_half_up(300.004, 2), 300.0);
    }

    #[test]
    fn test_round_half_up_negative_ties_away_from_zero() {
        assert_eq!(round_half_up(-0.25, 1), -0.3);
        assert_eq!(round_half_up(-2.5, 0), -3.0);
    }

    #[test]
    fn test_round_half_up_is_stable() {
        for value in [0.333_333f64, 2.675, 99.995, -14.005, 6.720_094] {
            let once = round_half_up(value, 2);
            assert_eq!(round_half_up(once, 2), once);
        }
    }

    #[test]
    fn test_ratio_round_percentages() {
        // 100000 / 1488096 * 100 = 6.7200945...
        let pps = Ratio::new(100_000i128, 1_488_096) * Ratio::from_integer(100);
        assert_eq!(ratio_round(pps, 2), 6.72);

        // 100 - 25/100 * 100 = 75 exactly
        let usage = Ratio::from_integer(100i128)
            - Ratio::new(25i128, 100) * Ratio::from_integer(100);
        assert_eq!(ratio_round(usage, 2), 75.0);
    }

    #[test]
    fn test_ratio_round_half_away_from_zero() {
        assert_eq!(ratio_round(Ratio::new(1i128, 8), 2), 0.13);
        assert_eq!(ratio_round(Ratio::new(-1i128, 8), 2), -0.13);
        assert_eq!(ratio_round(Ratio::new(1i128, 3), 2), 0.33);
    }
}
