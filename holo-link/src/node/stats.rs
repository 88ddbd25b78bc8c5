//! Statistics tracking for link traffic

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Snapshot of link traffic
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Bytes received over the stream channel, including frame headers
    pub stream_in_bytes: u64,
    /// Bytes sent over the stream channel, including frame headers
    pub stream_out_bytes: u64,
    /// Bytes received as datagrams
    pub datagram_in_bytes: u64,
    /// Bytes sent as datagrams
    pub datagram_out_bytes: u64,
    /// Envelopes received on any channel
    pub messages_in: u64,
    /// Envelopes sent on any channel
    pub messages_out: u64,
    /// Datagrams dropped because the socket buffer was full
    pub datagrams_dropped: u64,
    /// Timestamp when stats collection started
    pub start_time: Instant,
    /// Input throughput in KB/s
    pub input_kbps: f64,
    /// Output throughput in KB/s
    pub output_kbps: f64,
}

impl NodeStats {
    /// Create a new NodeStats instance with zero counters
    pub fn new() -> Self {
        Self {
            stream_in_bytes: 0,
            stream_out_bytes: 0,
            datagram_in_bytes: 0,
            datagram_out_bytes: 0,
            messages_in: 0,
            messages_out: 0,
            datagrams_dropped: 0,
            start_time: Instant::now(),
            input_kbps: 0.0,
            output_kbps: 0.0,
        }
    }

    pub fn input_bytes(&self) -> u64 {
        self.stream_in_bytes + self.datagram_in_bytes
    }

    pub fn output_bytes(&self) -> u64 {
        self.stream_out_bytes + self.datagram_out_bytes
    }

    /// Update throughput calculations based on elapsed time
    pub fn update_throughput(&mut self) {
        let elapsed_secs = self.start_time.elapsed().as_secs_f64();
        if elapsed_secs > 0.0 {
            self.input_kbps = (self.input_bytes() as f64) / 1024.0 / elapsed_secs;
            self.output_kbps = (self.output_bytes() as f64) / 1024.0 / elapsed_secs;
        }
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "In: {:.2} KB/s ({} msgs), Out: {:.2} KB/s ({} msgs), UDP in/out: {}/{} bytes, dropped: {}",
            self.input_kbps,
            self.messages_in,
            self.output_kbps,
            self.messages_out,
            self.datagram_in_bytes,
            self.datagram_out_bytes,
            self.datagrams_dropped
        )
    }
}

/// Thread-safe traffic counters shared by a node and its transports
///
/// Uses atomic operations for lock-free concurrent updates
#[derive(Debug)]
pub struct StatsTracker {
    stream_in_bytes: AtomicU64,
    stream_out_bytes: AtomicU64,
    datagram_in_bytes: AtomicU64,
    datagram_out_bytes: AtomicU64,
    messages_in: AtomicU64,
    messages_out: AtomicU64,
    datagrams_dropped: AtomicU64,
    start_time: std::sync::Mutex<Instant>,
}

/// Shared handle to a tracker
pub type SharedStats = Arc<StatsTracker>;

impl StatsTracker {
    /// Create a new StatsTracker
    pub fn new() -> Self {
        Self {
            stream_in_bytes: AtomicU64::new(0),
            stream_out_bytes: AtomicU64::new(0),
            datagram_in_bytes: AtomicU64::new(0),
            datagram_out_bytes: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            datagrams_dropped: AtomicU64::new(0),
            start_time: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn record_stream_in(&self, bytes: usize) {
        self.stream_in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_out(&self, bytes: usize) {
        self.stream_out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datagram_in(&self, bytes: usize) {
        self.datagram_in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datagram_out(&self, bytes: usize) {
        self.datagram_out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn start_time(&self) -> Instant {
        *self
            .start_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Get current statistics snapshot
    pub fn get_stats(&self) -> NodeStats {
        let mut stats = NodeStats {
            stream_in_bytes: self.stream_in_bytes.load(Ordering::Relaxed),
            stream_out_bytes: self.stream_out_bytes.load(Ordering::Relaxed),
            datagram_in_bytes: self.datagram_in_bytes.load(Ordering::Relaxed),
            datagram_out_bytes: self.datagram_out_bytes.load(Ordering::Relaxed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            start_time: self.start_time(),
            input_kbps: 0.0,
            output_kbps: 0.0,
        };
        stats.update_throughput();
        stats
    }

    /// Reset all counters and restart the throughput timer
    pub fn reset(&self) {
        for counter in [
            &self.stream_in_bytes,
            &self.stream_out_bytes,
            &self.datagram_in_bytes,
            &self.datagram_out_bytes,
            &self.messages_in,
            &self.messages_out,
            &self.datagrams_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self
            .start_time
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_creation() {
        let stats = NodeStats::new();
        assert_eq!(stats.input_bytes(), 0);
        assert_eq!(stats.output_bytes(), 0);
        assert_eq!(stats.input_kbps, 0.0);
        assert_eq!(stats.output_kbps, 0.0);
    }

    #[test]
    fn test_stats_display() {
        let mut stats = NodeStats::new();
        stats.stream_in_bytes = 1024;
        stats.datagram_out_bytes = 2048;
        stats.update_throughput();

        let display = format!("{}", stats);
        assert!(display.contains("In:"));
        assert!(display.contains("Out:"));
        assert!(display.contains("KB/s"));
    }

    #[test]
    fn test_tracker_operations() {
        let tracker = StatsTracker::new();

        tracker.record_stream_in(100);
        tracker.record_datagram_in(44);
        tracker.record_stream_out(20);
        tracker.record_datagram_out(44);
        tracker.record_datagram_out(44);
        tracker.record_datagram_dropped();

        let stats = tracker.get_stats();
        assert_eq!(stats.input_bytes(), 144);
        assert_eq!(stats.output_bytes(), 108);
        assert_eq!(stats.messages_in, 2);
        assert_eq!(stats.messages_out, 3);
        assert_eq!(stats.datagrams_dropped, 1);

        tracker.reset();
        let stats = tracker.get_stats();
        assert_eq!(stats.input_bytes(), 0);
        assert_eq!(stats.messages_out, 0);
        assert_eq!(stats.datagrams_dropped, 0);
    }

    #[test]
    fn test_throughput_calculation() {
        let tracker = StatsTracker::new();
        tracker.record_stream_in(10240);
        tracker.record_datagram_out(20480);

        // Simulate some time passing
        std::thread::sleep(std::time::Duration::from_millis(100));
        let stats = tracker.get_stats();

        assert!(stats.input_kbps > 0.0);
        assert!(stats.output_kbps > 0.0);
    }
}
