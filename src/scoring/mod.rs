//! Cross-sectional scoring.
//!
//! A raw metric is placed within the distribution of that metric across the
//! current candidate set (z-score → normal CDF percentile) and mapped onto a
//! 1–10 scale, so metrics with different natural ranges become comparable.

/// Abramowitz & Stegun 7.1.26 coefficients for erf.
const A1: f64 = 0.254829592;
const A2: f64 = -0.284496736;
const A3: f64 = 1.421413741;
const A4: f64 = -1.453152027;
const A5: f64 = 1.061405429;
const P: f64 = 0.3275911;

/// Fewer valid values than this and nothing gets a score.
pub const MIN_POPULATION: usize = 2;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by N).
pub fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < MIN_POPULATION {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / values.len() as f64).sqrt()
}

pub fn z_score(value: f64, mean: f64, std_dev: f64) -> f64 {
    if std_dev == 0.0 {
        return 0.0;
    }
    (value - mean) / std_dev
}

/// Standard normal CDF via the A&S rational approximation of erf.
pub fn z_to_percentile(z: f64) -> f64 {
    let sign = if z < 0.0 { -1.0 } else { 1.0 };
    let x = z.abs() / std::f64::consts::SQRT_2;

    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    let erf = 1.0 - poly * (-x * x).exp();

    0.5 * (1.0 + sign * erf)
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Map a percentile onto `1..=10`, one decimal. `invert` for lower-is-better.
pub fn percentile_to_score(percentile: f64, invert: bool) -> f64 {
    let p = percentile.clamp(0.0, 1.0);
    let p = if invert { 1.0 - p } else { p };
    round1(1.0 + p * 9.0).clamp(1.0, 10.0)
}

/// Mean and spread of one metric over the qualifying population.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distribution {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
}

impl Distribution {
    /// Only positive, finite values participate. `None` below [`MIN_POPULATION`].
    pub fn from_population(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let valid: Vec<f64> = values
            .into_iter()
            .filter(|v| v.is_finite() && *v > 0.0)
            .collect();

        if valid.len() < MIN_POPULATION {
            return None;
        }

        let mean = mean(&valid);
        Some(Self {
            mean,
            std_dev: std_dev(&valid, mean),
            count: valid.len(),
        })
    }

    pub fn percentile(&self, value: f64) -> f64 {
        z_to_percentile(z_score(value, self.mean, self.std_dev))
    }

    pub fn score(&self, value: f64, invert: bool) -> f64 {
        percentile_to_score(self.percentile(value), invert)
    }
}

/// Score every member against the population of its own values.
pub fn score_population(values: &[Option<f64>], invert: bool) -> Vec<Option<f64>> {
    let dist = Distribution::from_population(values.iter().flatten().copied());
    values
        .iter()
        .map(|v| Some(dist.as_ref()?.score((*v)?, invert)))
        .collect()
}

/// Sum of independently scored 1–10 components, one decimal.
pub fn composite(components: &[Option<f64>]) -> Option<f64> {
    let mut total = 0.0;
    for c in components {
        total += (*c)?;
    }
    Some(round1(total))
}

/// Letter grade for a 2–20 GRIP composite.
pub fn grip_grade(score: Option<f64>) -> &'static str {
    match score {
        None => "-",
        Some(s) if s >= 18.0 => "S",
        Some(s) if s >= 16.0 => "A",
        Some(s) if s >= 14.0 => "B",
        Some(s) if s >= 12.0 => "C",
        Some(s) if s >= 10.0 => "D",
        Some(_) => "F",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_percentile_at_zero() {
        assert!((z_to_percentile(0.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_percentile_known_values() {
        assert!((z_to_percentile(1.0) - 0.841_344_746).abs() < 1e-6);
        assert!((z_to_percentile(-1.96) - 0.024_997_895).abs() < 1e-6);
        assert!(z_to_percentile(8.0) > 0.999_999);
    }

    proptest! {
        #[test]
        fn percentile_is_symmetric(z in -8.0f64..8.0) {
            prop_assert!((z_to_percentile(-z) - (1.0 - z_to_percentile(z))).abs() < 1e-12);
        }

        #[test]
        fn percentile_is_monotonic(a in -8.0f64..8.0, b in -8.0f64..8.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(z_to_percentile(lo) <= z_to_percentile(hi));
        }

        #[test]
        fn score_is_bounded_and_ordered(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            for invert in [false, true] {
                let s = percentile_to_score(lo, invert);
                prop_assert!((1.0..=10.0).contains(&s));
            }
            prop_assert!(percentile_to_score(lo, false) <= percentile_to_score(hi, false));
            prop_assert!(percentile_to_score(lo, true) >= percentile_to_score(hi, true));
        }
    }

    #[test]
    fn test_population_statistics() {
        let pegs = [0.5, 1.0, 1.5, 2.0, 2.5];
        let d = Distribution::from_population(pegs).unwrap();
        assert!((d.mean - 1.5).abs() < 1e-12);
        assert!((d.std_dev - 0.5f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_peg_scores_inverted_extremes() {
        let pegs: Vec<Option<f64>> = [0.5, 1.0, 1.5, 2.0, 2.5].into_iter().map(Some).collect();
        let scores: Vec<f64> = score_population(&pegs, true).into_iter().flatten().collect();

        let max = scores.iter().cloned().fold(f64::MIN, f64::max);
        let min = scores.iter().cloned().fold(f64::MAX, f64::min);
        assert_eq!(scores[0], max);
        assert_eq!(scores[4], min);
        assert_eq!(scores[2], 5.5);
        assert!(scores[0] > 9.0);
        assert!(scores[4] < 2.0);
    }

    #[test]
    fn test_degenerate_populations() {
        assert!(Distribution::from_population([1.0]).is_none());
        // negatives and non-finite values do not count
        assert!(Distribution::from_population([1.0, -2.0, f64::NAN, f64::INFINITY]).is_none());
        assert_eq!(score_population(&[Some(3.0), None], false), vec![None, None]);

        let flat = Distribution::from_population([2.0, 2.0, 2.0]).unwrap();
        assert_eq!(flat.std_dev, 0.0);
        assert_eq!(flat.score(2.0, false), 5.5);
    }

    #[test]
    fn test_composite_and_grade() {
        assert_eq!(composite(&[Some(9.3), Some(7.84)]), Some(17.1));
        assert_eq!(composite(&[Some(9.3), None]), None);
        assert_eq!(grip_grade(Some(18.0)), "S");
        assert_eq!(grip_grade(Some(12.5)), "C");
        assert_eq!(grip_grade(Some(2.0)), "F");
        assert_eq!(grip_grade(None), "-");
    }
}
