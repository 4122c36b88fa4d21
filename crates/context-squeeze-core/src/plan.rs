//! Global token budget planning.

use crate::error::{Result, SqueezeError};

/// Fail unless `fraction` lies in the open interval (0, 1).
pub fn validate_reduction(fraction: f64) -> Result<()> {
    if fraction.is_finite() && fraction > 0.0 && fraction < 1.0 {
        Ok(())
    } else {
        Err(SqueezeError::InvalidReduction(fraction))
    }
}

/// Compute the target token count: `round(original * (1 - fraction))`.
///
/// ```rust
/// use context_squeeze_core::plan::plan;
///
/// assert_eq!(plan(3500, 0.3).unwrap(), 2450);
/// assert!(plan(3500, 1.0).is_err());
/// ```
pub fn plan(original_tokens: usize, reduction_fraction: f64) -> Result<usize> {
    validate_reduction(reduction_fraction)?;
    Ok((original_tokens as f64 * (1.0 - reduction_fraction)).round() as usize)
}

/// Parse a reduction typed by a person: `"30%"`, `"0.3"` and `"30"` all
/// mean thirty percent. The result is validated like [`plan`] does.
pub fn parse_reduction(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let fraction = if let Some(pct) = raw.strip_suffix('%') {
        parse_number(pct.trim(), raw)? / 100.0
    } else {
        let value = parse_number(raw, raw)?;
        if value > 1.0 {
            value / 100.0
        } else {
            value
        }
    };
    validate_reduction(fraction)?;
    Ok(fraction)
}

fn parse_number(s: &str, raw: &str) -> Result<f64> {
    s.parse::<f64>()
        .map_err(|_| SqueezeError::Config(format!("cannot parse reduction '{}'", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_rounded() {
        assert_eq!(plan(3500, 0.3).unwrap(), 2450);
        assert_eq!(plan(10, 0.25).unwrap(), 8); // 7.5 rounds away from zero
        assert_eq!(plan(0, 0.5).unwrap(), 0);
    }

    #[test]
    fn target_below_original_for_realistic_sizes() {
        for pct in 1..100 {
            let fraction = pct as f64 / 100.0;
            let target = plan(10_000, fraction).unwrap();
            assert!(target < 10_000, "fraction {}", fraction);
            assert_eq!(target, (10_000.0 * (1.0 - fraction)).round() as usize);
        }
    }

    #[test]
    fn bounds_are_exclusive() {
        for bad in [0.0, 1.0, -0.1, 1.5, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                plan(100, bad),
                Err(SqueezeError::InvalidReduction(_))
            ));
        }
    }

    #[test]
    fn parse_reduction_accepts_common_spellings() {
        assert!((parse_reduction("30%").unwrap() - 0.3).abs() < 1e-9);
        assert!((parse_reduction("0.3").unwrap() - 0.3).abs() < 1e-9);
        assert!((parse_reduction(" 30 ").unwrap() - 0.3).abs() < 1e-9);
        assert!(parse_reduction("abc").is_err());
        assert!(parse_reduction("100%").is_err());
        assert!(parse_reduction("0").is_err());
    }
}
