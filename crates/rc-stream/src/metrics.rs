//! Lock-free per-session stream metrics.
//!
//! Counters and last-sample gauges are plain atomics so the capture loop
//! can update them without contention; `snapshot` produces a point-in-time
//! copy with the derived bandwidth and millisecond conversions used by the
//! periodic metrics log.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct StreamMetrics {
    frames_captured: AtomicU64,
    frames_encoded: AtomicU64,
    frames_sent: AtomicU64,
    frames_skipped: AtomicU64,
    frames_dropped: AtomicU64,
    total_bytes_sent: AtomicU64,

    last_capture_nanos: AtomicU64,
    last_scale_nanos: AtomicU64,
    last_encode_nanos: AtomicU64,
    last_frame_size: AtomicU64,
    current_quality: AtomicU32,

    started_at: Instant,
}

/// Point-in-time copy of the metrics plus derived values.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub frames_encoded: u64,
    pub frames_sent: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub total_bytes_sent: u64,
    pub last_capture_ms: f64,
    pub last_scale_ms: f64,
    pub last_encode_ms: f64,
    pub last_frame_size: u64,
    pub current_quality: u32,
    pub uptime: Duration,
    /// totalBytesSent / uptime / 1024.
    pub bandwidth_kbps: f64,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            frames_captured: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            total_bytes_sent: AtomicU64::new(0),
            last_capture_nanos: AtomicU64::new(0),
            last_scale_nanos: AtomicU64::new(0),
            last_encode_nanos: AtomicU64::new(0),
            last_frame_size: AtomicU64::new(0),
            current_quality: AtomicU32::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn record_capture(&self, elapsed: Duration) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        self.last_capture_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_scale(&self, elapsed: Duration) {
        self.last_scale_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_encode(&self, elapsed: Duration, frame_size: usize) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.last_encode_nanos
            .store(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.last_frame_size
            .store(frame_size as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.frames_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_quality(&self, quality: u32) {
        self.current_quality.store(quality, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.started_at.elapsed();
        let total_bytes_sent = self.total_bytes_sent.load(Ordering::Relaxed);
        let bandwidth_kbps = if uptime.as_secs_f64() > 0.0 {
            total_bytes_sent as f64 / uptime.as_secs_f64() / 1024.0
        } else {
            0.0
        };

        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            total_bytes_sent,
            last_capture_ms: self.last_capture_nanos.load(Ordering::Relaxed) as f64 / 1e6,
            last_scale_ms: self.last_scale_nanos.load(Ordering::Relaxed) as f64 / 1e6,
            last_encode_ms: self.last_encode_nanos.load(Ordering::Relaxed) as f64 / 1e6,
            last_frame_size: self.last_frame_size.load(Ordering::Relaxed),
            current_quality: self.current_quality.load(Ordering::Relaxed),
            uptime,
            bandwidth_kbps,
        }
    }
}

impl Default for StreamMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = StreamMetrics::new();
        metrics.record_capture(Duration::from_millis(3));
        metrics.record_capture(Duration::from_millis(5));
        metrics.record_encode(Duration::from_millis(8), 40_000);
        metrics.record_sent(40_000);
        metrics.record_skip();
        metrics.record_drop();
        metrics.set_quality(75);

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_captured, 2);
        assert_eq!(snap.frames_encoded, 1);
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.frames_skipped, 1);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.total_bytes_sent, 40_000);
        assert_eq!(snap.last_frame_size, 40_000);
        assert_eq!(snap.current_quality, 75);
    }

    #[test]
    fn test_nanos_to_ms_conversion() {
        let metrics = StreamMetrics::new();
        metrics.record_capture(Duration::from_nanos(2_500_000));
        metrics.record_encode(Duration::from_nanos(12_000_000), 1);

        let snap = metrics.snapshot();
        assert!((snap.last_capture_ms - 2.5).abs() < 1e-9);
        assert!((snap.last_encode_ms - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_bandwidth_is_bytes_per_second_over_1024() {
        let metrics = StreamMetrics::new();
        metrics.record_sent(1024 * 100);
        std::thread::sleep(Duration::from_millis(20));

        let snap = metrics.snapshot();
        let expected = snap.total_bytes_sent as f64 / snap.uptime.as_secs_f64() / 1024.0;
        assert!((snap.bandwidth_kbps - expected).abs() < 1e-6);
        assert!(snap.bandwidth_kbps > 0.0);
    }
}
