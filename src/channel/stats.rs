//! Channel counters and snapshots.

use std::time::{Duration, Instant};

use super::Kind;

/// Monotonic operation counters, owned by the channel state lock.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counters {
    pub sends: u64,
    pub recvs: u64,
    pub bytes_sent: u64,
    pub bytes_recvd: u64,
    pub would_blocks: u64,
    pub timeouts: u64,
    pub canceled: u64,
    pub closed_errors: u64,
}

/// Point-in-time snapshot of one channel.
///
/// All fields are read under a single hold of the channel lock, so a
/// snapshot is internally consistent, depth never disagrees with the
/// counters it was taken with.
#[derive(Clone, Copy, Debug)]
pub struct ChannelStats {
    pub taken_at: Instant,
    pub kind: Kind,
    pub capacity: usize,
    /// Buffered values, including ones already spoken for by reserved
    /// receive permits.
    pub depth: usize,
    pub send_waiters: usize,
    pub recv_waiters: usize,
    pub zerocopy: bool,
    pub closed: bool,
    pub sends: u64,
    pub recvs: u64,
    pub bytes_sent: u64,
    pub bytes_recvd: u64,
    pub would_blocks: u64,
    pub timeouts: u64,
    pub canceled: u64,
    pub closed_errors: u64,
}

/// Rates derived from two snapshots of the same channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Throughput {
    pub sends_per_sec: f64,
    pub recvs_per_sec: f64,
    pub bytes_sent_per_sec: f64,
    pub bytes_recvd_per_sec: f64,
}

impl ChannelStats {
    /// Computes rates since an earlier snapshot. The interval is floored to
    /// one microsecond so back-to-back snapshots stay finite.
    pub fn throughput_since(&self, earlier: &ChannelStats) -> Throughput {
        let interval = self.taken_at.saturating_duration_since(earlier.taken_at).max(Duration::from_micros(1));
        let secs = interval.as_secs_f64();
        let rate = |now: u64, then: u64| now.saturating_sub(then) as f64 / secs;
        Throughput {
            sends_per_sec: rate(self.sends, earlier.sends),
            recvs_per_sec: rate(self.recvs, earlier.recvs),
            bytes_sent_per_sec: rate(self.bytes_sent, earlier.bytes_sent),
            bytes_recvd_per_sec: rate(self.bytes_recvd, earlier.bytes_recvd),
        }
    }
}

/// Thresholds for metrics emission, consumed by monitoring frontends.
#[derive(Clone, Copy, Debug)]
pub struct MetricsConfig {
    pub emit_interval: Duration,
    pub depth_threshold: usize,
}

impl MetricsConfig {
    /// Whether a snapshot is due, either by elapsed interval or by queue
    /// depth crossing the threshold.
    pub fn should_emit(&self, since_last: Duration, stats: &ChannelStats) -> bool {
        since_last >= self.emit_interval || stats.depth >= self.depth_threshold
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig { emit_interval: Duration::from_secs(1), depth_threshold: usize::MAX }
    }
}
