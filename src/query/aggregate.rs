//! Streaming metric aggregation.
//!
//! Single pass, constant memory. Variance uses Welford's online algorithm so
//! stddev never needs a second pass over the rows.

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricAggregate {
    /// Values that parsed as numbers.
    pub count: u64,
    /// Rows where the metric path was missing or non-numeric.
    pub skipped: u64,
    pub sum: Option<f64>,
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub std_dev: Option<f64>,
}

/// Welford accumulator.
pub struct StreamingStats {
    count: u64,
    skipped: u64,
    sum: f64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
}

impl StreamingStats {
    pub fn new() -> Self {
        Self {
            count: 0,
            skipped: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            mean: 0.0,
            m2: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn finish(self) -> MetricAggregate {
        if self.count == 0 {
            return MetricAggregate {
                count: 0,
                skipped: self.skipped,
                sum: None,
                avg: None,
                min: None,
                max: None,
                std_dev: None,
            };
        }
        // Population standard deviation.
        let variance = self.m2 / self.count as f64;
        MetricAggregate {
            count: self.count,
            skipped: self.skipped,
            sum: Some(self.sum),
            avg: Some(self.mean),
            min: Some(self.min),
            max: Some(self.max),
            std_dev: Some(variance.max(0.0).sqrt()),
        }
    }
}

impl Default for StreamingStats {
    fn default() -> Self {
        Self::new()
    }
}
