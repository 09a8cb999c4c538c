//! Streaming sample statistics.
//!
//! Every measured quantity (RTT samples, inter-packet gaps, SCE run
//! lengths) is summarized by one of these accumulators: single pass,
//! constant memory, no sample retention. The variance uses Welford's
//! update rather than a sum of squares, which loses precision once a
//! capture runs into millions of samples.

use serde::Serialize;
use std::time::Duration;

const NS_PER_MS: f64 = 1_000_000.0;

/// Running min/max/mean/variance over plain f64 samples.
#[derive(Debug, Clone, Default)]
pub struct ValueStats {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl ValueStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one sample in O(1).
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = x;
            self.max = x;
        } else {
            if x < self.min {
                self.min = x;
            }
            if x > self.max {
                self.max = x;
            }
        }
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// True until the first sample is pushed. Reports use this to tell
    /// "no data" apart from an all-zero sample stream.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance, m2/(n-1). Zero until two samples exist.
    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Index of dispersion, variance over mean. Zero when the mean is zero.
    pub fn burstiness(&self) -> f64 {
        if self.mean == 0.0 {
            0.0
        } else {
            self.variance() / self.mean
        }
    }

    pub fn summary(&self) -> Option<ValueSummary> {
        if self.is_empty() {
            return None;
        }
        Some(ValueSummary {
            n: self.count,
            min: self.min,
            max: self.max,
            mean: self.mean,
            stddev: self.stddev(),
            variance: self.variance(),
            burstiness: self.burstiness(),
        })
    }
}

/// Running statistics over durations, carried internally in nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct DurationStats {
    ns: ValueStats,
}

impl DurationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, d: Duration) {
        self.ns.push(d.as_nanos() as f64);
    }

    pub fn is_empty(&self) -> bool {
        self.ns.is_empty()
    }

    pub fn count(&self) -> u64 {
        self.ns.count()
    }

    pub fn mean_ms(&self) -> f64 {
        self.ns.mean() / NS_PER_MS
    }

    /// Millisecond summary for reports; `None` when no sample was pushed.
    pub fn summary(&self) -> Option<DurationSummary> {
        let s = self.ns.summary()?;
        Some(DurationSummary {
            n: s.n,
            min: s.min / NS_PER_MS,
            max: s.max / NS_PER_MS,
            mean: s.mean / NS_PER_MS,
            stddev: s.stddev / NS_PER_MS,
            variance: s.variance / (NS_PER_MS * NS_PER_MS),
            burstiness: s.burstiness / NS_PER_MS,
        })
    }
}

/// Serializable snapshot of a `ValueStats` (unitless samples).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueSummary {
    pub n: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub variance: f64,
    pub burstiness: f64,
}

/// Serializable snapshot of a `DurationStats`. All fields are in
/// milliseconds (variance in ms^2).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DurationSummary {
    pub n: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub variance: f64,
    pub burstiness: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_pass_variance(samples: &[f64]) -> f64 {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)
    }

    #[test]
    fn empty_accumulator() {
        let s = ValueStats::new();
        assert!(s.is_empty());
        assert_eq!(s.count(), 0);
        assert_eq!(s.variance(), 0.0);
        assert_eq!(s.burstiness(), 0.0);
        assert!(s.summary().is_none());
    }

    #[test]
    fn single_sample_has_zero_variance() {
        let mut s = ValueStats::new();
        s.push(42.0);
        assert!(!s.is_empty());
        assert_eq!(s.min(), 42.0);
        assert_eq!(s.max(), 42.0);
        assert_eq!(s.mean(), 42.0);
        assert_eq!(s.variance(), 0.0);
        assert_eq!(s.stddev(), 0.0);
    }

    #[test]
    fn min_max_mean_exact() {
        let mut s = ValueStats::new();
        for x in [3.0, 1.0, 4.0, 1.0, 5.0] {
            s.push(x);
        }
        assert_eq!(s.count(), 5);
        assert_eq!(s.min(), 1.0);
        assert_eq!(s.max(), 5.0);
        assert!((s.mean() - 2.8).abs() < 1e-12);
    }

    #[test]
    fn welford_matches_two_pass_variance() {
        let samples: Vec<f64> = (0..1000)
            .map(|i| {
                // deterministic but irregular spread
                let x = (i as f64 * 0.721).sin() * 500.0 + 1000.0;
                x * x % 777.0
            })
            .collect();
        let mut s = ValueStats::new();
        for &x in &samples {
            s.push(x);
        }
        let expected = two_pass_variance(&samples);
        assert!(
            (s.variance() - expected).abs() / expected < 1e-9,
            "welford {} vs two-pass {}",
            s.variance(),
            expected
        );
    }

    #[test]
    fn burstiness_is_variance_over_mean() {
        let mut s = ValueStats::new();
        for x in [2.0, 4.0, 6.0] {
            s.push(x);
        }
        assert!((s.burstiness() - s.variance() / 4.0).abs() < 1e-12);
    }

    #[test]
    fn burstiness_of_zero_mean_stream() {
        let mut s = ValueStats::new();
        s.push(0.0);
        s.push(0.0);
        assert_eq!(s.mean(), 0.0);
        assert_eq!(s.burstiness(), 0.0);
    }

    #[test]
    fn duration_summary_in_milliseconds() {
        let mut s = DurationStats::new();
        s.push(Duration::from_millis(10));
        s.push(Duration::from_millis(30));
        let sum = s.summary().unwrap();
        assert_eq!(sum.n, 2);
        assert!((sum.min - 10.0).abs() < 1e-9);
        assert!((sum.max - 30.0).abs() < 1e-9);
        assert!((sum.mean - 20.0).abs() < 1e-9);
        // variance of {10, 30} ms is 200 ms^2
        assert!((sum.variance - 200.0).abs() < 1e-6);
        assert!((sum.burstiness - 10.0).abs() < 1e-9);
    }

    #[test]
    fn duration_empty_summary_is_none() {
        assert!(DurationStats::new().summary().is_none());
    }
}
