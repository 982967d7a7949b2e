//! The timestamp oracle seam.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;

use sluice_proto::{compose_ts, LOGICAL_BITS};

use crate::PumpError;

/// Source of globally ordered commit timestamps.
///
/// Production deployments adapt the cluster's timestamp service to this
/// trait; [`ClockOracle`] is the in-process fallback for standalone mode
/// and tests.
#[async_trait]
pub trait TimestampOracle: Send + Sync {
    /// A fresh timestamp, strictly greater than any previously returned.
    async fn get_ts(&self) -> Result<i64, PumpError>;
}

/// Hybrid-logical-clock oracle backed by the local wall clock.
///
/// Physical milliseconds in the high bits, a logical counter in the low
/// [`LOGICAL_BITS`]; the counter disambiguates calls within one
/// millisecond and rides over clock steps backwards.
pub struct ClockOracle {
    last: Mutex<(i64, i64)>,
}

impl ClockOracle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Mutex::new((0, 0)),
        }
    }

    fn next(&self) -> i64 {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        let mut last = self.last.lock();
        if now_ms > last.0 {
            *last = (now_ms, 0);
        } else {
            last.1 += 1;
            if last.1 >= (1 << LOGICAL_BITS) {
                *last = (last.0 + 1, 0);
            }
        }
        compose_ts(last.0, last.1)
    }
}

impl Default for ClockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimestampOracle for ClockOracle {
    async fn get_ts(&self) -> Result<i64, PumpError> {
        Ok(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let oracle = ClockOracle::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let ts = oracle.get_ts().await.unwrap();
            assert!(ts > prev, "{ts} !> {prev}");
            prev = ts;
        }
    }

    #[tokio::test]
    async fn test_physical_part_is_wall_clock() {
        let oracle = ClockOracle::new();
        let ts = oracle.get_ts().await.unwrap();
        let physical = sluice_proto::extract_physical(ts);
        let now_ms = i64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_millis(),
        )
        .unwrap();
        assert!((now_ms - physical).abs() < 5_000);
    }
}
