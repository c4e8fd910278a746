use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A single timestamped sample destined for the metrics backend.
///
/// Points are immutable once built. The name is shared (`Arc<str>`) so the
/// sink can hold a retry copy without reallocating.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    name: Arc<str>,
    value: f64,
    timestamp: u64,
}

impl MetricPoint {
    /// Creates a point from a dotted name, value and unix timestamp (seconds).
    pub fn new(name: impl Into<Arc<str>>, value: f64, timestamp: u64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }

    /// Dotted metric name, without any backend namespace prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Unix timestamp in whole seconds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

impl fmt::Display for MetricPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.value, self.timestamp)
    }
}

/// Converts a wall-clock instant to whole unix seconds.
///
/// Times before the epoch clamp to zero.
pub fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
