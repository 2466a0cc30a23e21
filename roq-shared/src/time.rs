use std::ops::Add;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Pairs a monotonic [`Instant`] with the wall clock so that packet events
/// taken from the monotonic clock can be reported as UNIX timestamps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemInstant {
    instant: Instant,
    duration_since_unix_epoch: Duration,
}

impl SystemInstant {
    pub fn now() -> Self {
        Self::at(Instant::now())
    }

    /// Anchors the wall clock at a caller supplied instant, used when the
    /// monotonic clock comes from a runtime that can be paused.
    pub fn at(instant: Instant) -> Self {
        Self {
            instant,
            duration_since_unix_epoch: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }

    pub fn instant(&self, duration_since_unix_epoch: Duration) -> Instant {
        self.instant + duration_since_unix_epoch - self.duration_since_unix_epoch
    }

    pub fn duration_since_unix_epoch(&self) -> Duration {
        self.duration_since_unix_epoch
    }

    pub fn unix(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.instant)
            .add(self.duration_since_unix_epoch)
    }
}

/// Truncates a duration to whole microseconds, the precision of the
/// feedback wire format.
pub fn truncate_to_micros(d: Duration) -> Duration {
    Duration::from_micros(d.as_micros() as u64)
}
