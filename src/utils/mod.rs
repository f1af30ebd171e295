use std::time::{Duration, Instant};
use tracing::info;

/// Logs how long a CLI command took when dropped.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let timer = Self { label: label.into(), start: Instant::now() };
        info!("⏱  Starting: {}", timer.label);
        timer
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!("⏱  Finished: {} (took {:.2?})", self.label, self.elapsed());
    }
}

/// Thousands separators, e.g. market caps and counts.
pub fn fmt_number(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Fixed decimals, or a dash for undefined metrics.
pub fn fmt_opt(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", decimals, v),
        _ => "—".to_string(),
    }
}

/// Compact dollar amount: 1.2T, 350.0B, 12.5M.
pub fn fmt_money(value: f64) -> String {
    let abs = value.abs();
    let (scaled, suffix) = if abs >= 1e12 {
        (value / 1e12, "T")
    } else if abs >= 1e9 {
        (value / 1e9, "B")
    } else if abs >= 1e6 {
        (value / 1e6, "M")
    } else {
        return fmt_number(value.round() as i64);
    };
    format!("{:.1}{}", scaled, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_number() {
        assert_eq!(fmt_number(10_000), "10,000");
        assert_eq!(fmt_number(334), "334");
        assert_eq!(fmt_number(-1_500_000), "-1,500,000");
    }

    #[test]
    fn test_fmt_opt() {
        assert_eq!(fmt_opt(Some(1.23456), 2), "1.23");
        assert_eq!(fmt_opt(None, 2), "—");
        assert_eq!(fmt_opt(Some(f64::NAN), 2), "—");
    }

    #[test]
    fn test_fmt_money() {
        assert_eq!(fmt_money(3.2e12), "3.2T");
        assert_eq!(fmt_money(450e9), "450.0B");
        assert_eq!(fmt_money(-12.5e6), "-12.5M");
        assert_eq!(fmt_money(9_500.0), "9,500");
    }
}
