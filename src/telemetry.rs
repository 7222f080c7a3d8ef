//! Shared counters read across the muxer, bitrate controller and
//! health watchdog
//!
//! One explicitly owned [`StreamStats`] object is handed to every
//! component that needs telemetry. Writers use atomic increments so the
//! periodic control loops can take consistent snapshots without locks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Rolling one-second bitrate estimate
///
/// Accumulates byte counts and recomputes bytes/sec once at least a
/// second of wall time has elapsed since the previous measurement.
pub struct BitrateEstimator {
    inner: Mutex<EstimatorWindow>,
    rate: AtomicU64,
}

struct EstimatorWindow {
    bytes: u64,
    measured_at: Instant,
}

impl BitrateEstimator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EstimatorWindow {
                bytes: 0,
                measured_at: Instant::now(),
            }),
            rate: AtomicU64::new(0),
        }
    }

    /// Record bytes and refresh the estimate if the window elapsed.
    /// Returns the new rate when a measurement was taken.
    pub fn add(&self, len: usize) -> Option<u64> {
        let mut window = self.inner.lock();
        window.bytes += len as u64;
        let elapsed = window.measured_at.elapsed();
        if elapsed.as_secs_f64() >= 1.0 {
            let rate = (window.bytes as f64 / elapsed.as_secs_f64()) as u64;
            window.bytes = 0;
            window.measured_at = Instant::now();
            self.rate.store(rate, Ordering::Relaxed);
            return Some(rate);
        }
        None
    }

    /// Force a measurement with whatever accumulated, window permitting zero.
    pub fn measure(&self) -> u64 {
        let mut window = self.inner.lock();
        let elapsed = window.measured_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let rate = (window.bytes as f64 / elapsed) as u64;
            window.bytes = 0;
            window.measured_at = Instant::now();
            self.rate.store(rate, Ordering::Relaxed);
        }
        self.rate.load(Ordering::Relaxed)
    }

    /// Last computed bytes/sec
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }
}

impl Default for BitrateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Telemetry shared between the muxer, transport, bitrate controller
/// and watchdog
pub struct StreamStats {
    /// Muxed audio bytes since publish start
    total_audio_bytes: AtomicU64,
    /// Muxed video bytes since publish start
    total_video_bytes: AtomicU64,
    /// Application-wide bytes accepted for output but not yet written
    total_bytes_in_queue: AtomicI64,
    /// One-second estimate of bytes muxed per second
    input_rate: BitrateEstimator,
    /// One-second estimate of bytes written per second (set by the transport)
    output_bitrate: AtomicU64,
    /// Video bitrate currently requested from the encoder (bits/s)
    video_bitrate: AtomicU64,
    /// Sticky bandwidth-shortage flag owned by the bitrate controller
    not_enough_bandwidth: AtomicBool,
}

impl StreamStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_audio_bytes: AtomicU64::new(0),
            total_video_bytes: AtomicU64::new(0),
            total_bytes_in_queue: AtomicI64::new(0),
            input_rate: BitrateEstimator::new(),
            output_bitrate: AtomicU64::new(0),
            video_bitrate: AtomicU64::new(0),
            not_enough_bandwidth: AtomicBool::new(false),
        })
    }

    /// Reset everything at publish start / monitor start
    pub fn reset(&self) {
        self.total_audio_bytes.store(0, Ordering::Relaxed);
        self.total_video_bytes.store(0, Ordering::Relaxed);
        self.total_bytes_in_queue.store(0, Ordering::Relaxed);
        self.output_bitrate.store(0, Ordering::Relaxed);
        self.video_bitrate.store(0, Ordering::Relaxed);
        self.not_enough_bandwidth.store(false, Ordering::Relaxed);
    }

    pub fn add_audio_bytes(&self, len: usize) {
        self.total_audio_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn add_video_bytes(&self, len: usize) {
        self.total_video_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn total_audio_bytes(&self) -> u64 {
        self.total_audio_bytes.load(Ordering::Relaxed)
    }

    pub fn total_video_bytes(&self) -> u64 {
        self.total_video_bytes.load(Ordering::Relaxed)
    }

    /// Record bytes queued for output across all producers
    pub fn add_queued_bytes(&self, len: usize) {
        self.total_bytes_in_queue.fetch_add(len as i64, Ordering::Relaxed);
    }

    /// Record bytes confirmed written; the depth never goes negative
    pub fn sub_queued_bytes(&self, len: usize) {
        let previous = self.total_bytes_in_queue.fetch_sub(len as i64, Ordering::Relaxed);
        if previous - (len as i64) < 0 {
            self.total_bytes_in_queue.store(0, Ordering::Relaxed);
        }
    }

    pub fn bytes_in_queue(&self) -> u64 {
        self.total_bytes_in_queue.load(Ordering::Relaxed).max(0) as u64
    }

    /// Feed the input bitrate estimator with muxed bytes
    pub fn add_input_bytes(&self, len: usize) {
        self.input_rate.add(len);
    }

    /// Bytes muxed per second over the last window
    pub fn input_bitrate(&self) -> u64 {
        self.input_rate.rate()
    }

    pub fn set_output_bitrate(&self, rate: u64) {
        self.output_bitrate.store(rate, Ordering::Relaxed);
    }

    /// Bytes written per second over the last window
    pub fn output_bitrate(&self) -> u64 {
        self.output_bitrate.load(Ordering::Relaxed)
    }

    pub fn set_video_bitrate(&self, bitrate: u64) {
        self.video_bitrate.store(bitrate, Ordering::Relaxed);
    }

    /// Currently requested encoder bitrate (bits/s)
    pub fn video_bitrate(&self) -> u64 {
        self.video_bitrate.load(Ordering::Relaxed)
    }

    pub fn set_not_enough_bandwidth(&self, flag: bool) {
        self.not_enough_bandwidth.store(flag, Ordering::Relaxed);
    }

    pub fn not_enough_bandwidth(&self) -> bool {
        self.not_enough_bandwidth.load(Ordering::Relaxed)
    }
}

/// Shared handle to the stream telemetry
pub type SharedStats = Arc<StreamStats>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_depth_never_negative() {
        let stats = StreamStats::new();
        stats.add_queued_bytes(100);
        stats.sub_queued_bytes(60);
        assert_eq!(stats.bytes_in_queue(), 40);

        // Draining more than was queued clamps at zero
        stats.sub_queued_bytes(500);
        assert_eq!(stats.bytes_in_queue(), 0);

        stats.add_queued_bytes(10);
        assert_eq!(stats.bytes_in_queue(), 10);
    }

    #[test]
    fn test_reset_clears_counters() {
        let stats = StreamStats::new();
        stats.add_audio_bytes(10);
        stats.add_video_bytes(20);
        stats.add_queued_bytes(30);
        stats.set_not_enough_bandwidth(true);
        stats.reset();
        assert_eq!(stats.total_audio_bytes(), 0);
        assert_eq!(stats.total_video_bytes(), 0);
        assert_eq!(stats.bytes_in_queue(), 0);
        assert!(!stats.not_enough_bandwidth());
    }

    #[test]
    fn test_estimator_waits_for_window() {
        let estimator = BitrateEstimator::new();
        // Inside the one-second window no measurement is produced
        assert!(estimator.add(1000).is_none());
        assert_eq!(estimator.rate(), 0);
    }
}
