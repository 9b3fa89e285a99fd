//! Seasonality
//!
//! Maps virtual time onto a load scale. Samples are `(timestamp, scale)` pairs;
//! the table's period is the largest sample timestamp and lookups wrap with
//! `t mod period`, so `scale_at(t) == scale_at(t + period)`.
//!
//! The arrival generator turns the scale into an inter-arrival gap: a higher
//! scale gives shorter gaps and therefore higher throughput.

use std::path::Path;

/// Floor applied to the scale before inverting it
pub const MIN_SCALE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SeasonalityError {
    #[error("seasonality table has no samples")]
    Empty,

    #[error("invalid sample ({time}, {scale}): values must be finite and non-negative")]
    InvalidSample { time: f64, scale: f64 },

    #[error("line {line}: cannot parse {content:?}")]
    Parse { line: usize, content: String },

    #[error("cannot read seasonality file: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeasonalityTable {
    // sorted by timestamp
    samples: Vec<(f64, f64)>,
    period: f64,
}

impl SeasonalityTable {
    pub fn new(mut samples: Vec<(f64, f64)>) -> Result<Self, SeasonalityError> {
        if samples.is_empty() {
            return Err(SeasonalityError::Empty);
        }

        for &(time, scale) in &samples {
            if !time.is_finite() || !scale.is_finite() || time < 0.0 || scale < 0.0 {
                return Err(SeasonalityError::InvalidSample { time, scale });
            }
        }

        // stable: equal timestamps keep their configured order
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        let period = samples.iter().map(|s| s.0).fold(0.0, f64::max);

        Ok(Self { samples, period })
    }

    /// A table with a single sample - the scale never changes.
    pub fn flat(scale: f64) -> Result<Self, SeasonalityError> {
        Self::new(vec![(0.0, scale)])
    }

    /// Parse the `time;scaler_value` format (header line optional).
    pub fn from_csv_str(content: &str) -> Result<Self, SeasonalityError> {
        let mut samples = Vec::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let mut fields = line.split(';').map(str::trim);
            let parsed = match (fields.next(), fields.next()) {
                (Some(t), Some(s)) => t.parse::<f64>().ok().zip(s.parse::<f64>().ok()),
                _ => None,
            };

            match parsed {
                Some(sample) => samples.push(sample),
                // a header is only allowed on the first line
                None if idx == 0 => continue,
                None => {
                    return Err(SeasonalityError::Parse {
                        line: idx + 1,
                        content: line.to_string(),
                    })
                }
            }
        }

        Self::new(samples)
    }

    pub fn from_csv_file<P: AsRef<Path>>(path: P) -> Result<Self, SeasonalityError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SeasonalityError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_csv_str(&content)
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    /// Scale of the sample nearest to `t mod period`.
    ///
    /// Ties go to the earlier sample. A zero period (single timestamp) does not
    /// wrap.
    pub fn scale_at(&self, t: f64) -> f64 {
        let t = if self.period > 0.0 {
            t.rem_euclid(self.period)
        } else {
            t
        };

        let mut best = self.samples[0];
        let mut best_distance = (best.0 - t).abs();
        for &sample in &self.samples[1..] {
            let distance = (sample.0 - t).abs();
            if distance < best_distance {
                best = sample;
                best_distance = distance;
            }
        }

        best.1
    }

    /// Inter-arrival gap at time `t`: `base_interval / scale_at(t)`.
    pub fn interval_at(&self, t: f64, base_interval: f64) -> f64 {
        base_interval / self.scale_at(t).max(MIN_SCALE)
    }
}
