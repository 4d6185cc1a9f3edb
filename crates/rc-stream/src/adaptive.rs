//! Adaptive controllers feeding back into the encoder.
//!
//! [`AdaptiveBitrate`] turns periodic transport statistics (round-trip time
//! and fraction lost) into an applied bitrate plus a soft FPS hint.
//! [`AdaptiveQuality`] turns per-frame encode timing and output size into a
//! JPEG quality level for the still-frame path.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ─── Bitrate ────────────────────────────────────────────────────────

/// Number of `(rtt, loss)` samples kept in the window.
const BITRATE_WINDOW: usize = 8;
/// Minimum time between bitrate adjustments.
const BITRATE_COOLDOWN: Duration = Duration::from_secs(2);
/// Multiplicative backoff applied on congestion.
const DECREASE_FACTOR: f64 = 0.8;
/// FPS moves in steps of this size.
const FPS_STEP: u32 = 5;

/// The adjustment the session applies to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateUpdate {
    pub bitrate: u32,
    pub fps: u32,
}

/// Congestion-driven bitrate/FPS controller.
///
/// Loss above 8% or RTT above 400 ms backs the bitrate off multiplicatively
/// and drops the FPS hint one step; a clean window (loss < 2%, RTT < 150 ms)
/// recovers additively toward the ceilings.
pub struct AdaptiveBitrate {
    current_bitrate: u32,
    min_bitrate: u32,
    max_bitrate: u32,
    current_fps: u32,
    min_fps: u32,
    max_fps: u32,
    last_adjust: Instant,
    samples: VecDeque<(Duration, f64)>,
}

impl AdaptiveBitrate {
    pub fn new(initial_bitrate: u32, min_bitrate: u32, max_bitrate: u32, max_fps: u32) -> Self {
        let max_bitrate = max_bitrate.max(min_bitrate);
        Self {
            current_bitrate: initial_bitrate.clamp(min_bitrate, max_bitrate),
            min_bitrate,
            max_bitrate,
            current_fps: max_fps,
            min_fps: 10,
            max_fps,
            // Allow the first adjustment immediately.
            last_adjust: Instant::now()
                .checked_sub(BITRATE_COOLDOWN)
                .unwrap_or_else(Instant::now),
            samples: VecDeque::with_capacity(BITRATE_WINDOW),
        }
    }

    /// Record one transport stats sample.
    pub fn record_sample(&mut self, rtt: Duration, fraction_lost: f64) {
        if self.samples.len() == BITRATE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back((rtt, fraction_lost));
    }

    /// Re-evaluate; returns the update to apply when something changed.
    pub fn adjust(&mut self) -> Option<RateUpdate> {
        if self.samples.is_empty() || self.last_adjust.elapsed() < BITRATE_COOLDOWN {
            return None;
        }

        let n = self.samples.len() as f64;
        let avg_rtt: f64 = self
            .samples
            .iter()
            .map(|(rtt, _)| rtt.as_secs_f64())
            .sum::<f64>()
            / n;
        let avg_loss: f64 = self.samples.iter().map(|(_, loss)| loss).sum::<f64>() / n;

        let (mut bitrate, mut fps) = (self.current_bitrate, self.current_fps);

        if avg_loss > 0.08 || avg_rtt > 0.400 {
            bitrate = ((bitrate as f64 * DECREASE_FACTOR) as u32).max(self.min_bitrate);
            fps = fps.saturating_sub(FPS_STEP).max(self.min_fps);
        } else if avg_loss < 0.02 && avg_rtt < 0.150 {
            let step = (self.max_bitrate / 16).max(1);
            bitrate = bitrate.saturating_add(step).min(self.max_bitrate);
            fps = (fps + FPS_STEP).min(self.max_fps);
        }

        if bitrate == self.current_bitrate && fps == self.current_fps {
            return None;
        }

        self.current_bitrate = bitrate;
        self.current_fps = fps;
        self.last_adjust = Instant::now();

        tracing::debug!(
            bitrate,
            fps,
            avg_rtt_ms = avg_rtt * 1000.0,
            avg_loss,
            "adaptive bitrate adjusted"
        );

        Some(RateUpdate { bitrate, fps })
    }

    /// Raise the bitrate ceiling without bypassing the controller.
    pub fn set_max_bitrate(&mut self, max: u32) {
        self.max_bitrate = max.max(self.min_bitrate);
        self.current_bitrate = self.current_bitrate.min(self.max_bitrate);
    }

    /// Raise the FPS ceiling without bypassing the controller.
    pub fn set_max_fps(&mut self, max: u32) {
        self.max_fps = max.max(self.min_fps);
        self.current_fps = self.current_fps.min(self.max_fps);
    }

    pub fn current_bitrate(&self) -> u32 {
        self.current_bitrate
    }

    pub fn current_fps(&self) -> u32 {
        self.current_fps
    }
}

// ─── Quality ────────────────────────────────────────────────────────

const QUALITY_WINDOW: usize = 30;
const QUALITY_COOLDOWN: Duration = Duration::from_millis(500);
const QUALITY_MIN_SAMPLES: usize = 5;
const QUALITY_FLOOR: u32 = 20;

/// Encode-timing-driven JPEG quality controller for the still-frame path.
pub struct AdaptiveQuality {
    base_quality: u32,
    quality: u32,
    min_quality: u32,
    max_quality: u32,
    encode_times: VecDeque<Duration>,
    frame_sizes: VecDeque<usize>,
    drop_count: u64,
    send_count: u64,
    last_adjust: Instant,
}

impl AdaptiveQuality {
    pub fn new(base_quality: u32) -> Self {
        Self {
            base_quality,
            quality: base_quality,
            min_quality: QUALITY_FLOOR,
            max_quality: Self::ceiling(base_quality),
            encode_times: VecDeque::with_capacity(QUALITY_WINDOW),
            frame_sizes: VecDeque::with_capacity(QUALITY_WINDOW),
            drop_count: 0,
            send_count: 0,
            last_adjust: Instant::now()
                .checked_sub(QUALITY_COOLDOWN)
                .unwrap_or_else(Instant::now),
        }
    }

    fn ceiling(base: u32) -> u32 {
        (base + 15).min(95)
    }

    /// Record one frame's encode time, output size, and drop outcome.
    pub fn record_frame(&mut self, encode_time: Duration, size: usize, dropped: bool) {
        if self.encode_times.len() == QUALITY_WINDOW {
            self.encode_times.pop_front();
        }
        if self.frame_sizes.len() == QUALITY_WINDOW {
            self.frame_sizes.pop_front();
        }
        self.encode_times.push_back(encode_time);
        self.frame_sizes.push_back(size);
        if dropped {
            self.drop_count += 1;
        } else {
            self.send_count += 1;
        }
    }

    /// Re-evaluate quality under the cooldown; returns the current value.
    pub fn adjust(&mut self) -> u32 {
        if self.encode_times.len() < QUALITY_MIN_SAMPLES
            || self.last_adjust.elapsed() < QUALITY_COOLDOWN
        {
            return self.quality;
        }

        let avg_encode_ms = self
            .encode_times
            .iter()
            .map(|t| t.as_secs_f64() * 1000.0)
            .sum::<f64>()
            / self.encode_times.len() as f64;
        let avg_size = self.frame_sizes.iter().sum::<usize>() as f64 / self.frame_sizes.len() as f64;
        let total = self.drop_count + self.send_count;
        let drop_rate = if total > 0 {
            self.drop_count as f64 / total as f64
        } else {
            0.0
        };

        let mut quality = self.quality;
        if avg_encode_ms > 30.0 || drop_rate > 0.1 || avg_size > 80.0 * 1024.0 {
            quality = quality.saturating_sub(5);
        } else if avg_encode_ms < 15.0 && drop_rate < 0.02 && avg_size < 40.0 * 1024.0 {
            quality += 3;
        }
        quality = quality.clamp(self.min_quality, self.max_quality);

        if quality != self.quality {
            tracing::debug!(
                from = self.quality,
                to = quality,
                avg_encode_ms,
                avg_size,
                drop_rate,
                "adaptive quality adjusted"
            );
            self.quality = quality;
            self.drop_count = 0;
            self.send_count = 0;
            self.last_adjust = Instant::now();
        }

        self.quality
    }

    /// Reset to a new base quality and recompute the ceiling.
    pub fn set_base_quality(&mut self, base: u32) {
        self.base_quality = base;
        self.quality = base.clamp(self.min_quality, Self::ceiling(base));
        self.max_quality = Self::ceiling(base);
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn max_quality(&self) -> u32 {
        self.max_quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;

    #[test]
    fn test_quality_increase_on_light_load() {
        let mut quality = AdaptiveQuality::new(75);
        assert_eq!(quality.max_quality(), 90);

        for _ in 0..10 {
            quality.record_frame(Duration::from_millis(10), 30 * KIB, false);
        }
        assert_eq!(quality.adjust(), 78);
    }

    #[test]
    fn test_quality_decrease_on_heavy_load() {
        let mut quality = AdaptiveQuality::new(75);
        for _ in 0..10 {
            quality.record_frame(Duration::from_millis(40), 90 * KIB, false);
        }
        assert_eq!(quality.adjust(), 70);
    }

    #[test]
    fn test_quality_stays_clamped() {
        let mut quality = AdaptiveQuality::new(25);
        // Hammer it with heavy frames; it must never go below the floor.
        for round in 0..20 {
            for _ in 0..10 {
                quality.record_frame(Duration::from_millis(50), 100 * KIB, round % 2 == 0);
            }
            let q = quality.adjust();
            assert!((QUALITY_FLOOR..=quality.max_quality()).contains(&q));
            // Bypass the cooldown for the next round.
            quality.last_adjust = Instant::now() - QUALITY_COOLDOWN;
        }
        assert_eq!(quality.quality(), QUALITY_FLOOR);
    }

    #[test]
    fn test_quality_ceiling_is_base_plus_15_capped() {
        assert_eq!(AdaptiveQuality::new(75).max_quality(), 90);
        assert_eq!(AdaptiveQuality::new(90).max_quality(), 95);

        let mut quality = AdaptiveQuality::new(75);
        quality.set_base_quality(85);
        assert_eq!(quality.quality(), 85);
        assert_eq!(quality.max_quality(), 95);
    }

    #[test]
    fn test_quality_needs_samples_and_cooldown() {
        let mut quality = AdaptiveQuality::new(75);

        // Too few samples: unchanged.
        for _ in 0..QUALITY_MIN_SAMPLES - 1 {
            quality.record_frame(Duration::from_millis(10), 30 * KIB, false);
        }
        assert_eq!(quality.adjust(), 75);

        // Enough samples: adjusts, then the cooldown blocks a second step.
        for _ in 0..QUALITY_MIN_SAMPLES {
            quality.record_frame(Duration::from_millis(10), 30 * KIB, false);
        }
        assert_eq!(quality.adjust(), 78);
        assert_eq!(quality.adjust(), 78);
    }

    #[test]
    fn test_bitrate_backs_off_on_loss() {
        let mut bitrate = AdaptiveBitrate::new(4_000_000, 500_000, 8_000_000, 30);
        for _ in 0..4 {
            bitrate.record_sample(Duration::from_millis(50), 0.15);
        }
        let update = bitrate.adjust().unwrap();
        assert_eq!(update.bitrate, 3_200_000);
        assert_eq!(update.fps, 25);
    }

    #[test]
    fn test_bitrate_backs_off_on_high_rtt() {
        let mut bitrate = AdaptiveBitrate::new(4_000_000, 500_000, 8_000_000, 30);
        for _ in 0..4 {
            bitrate.record_sample(Duration::from_millis(500), 0.0);
        }
        assert!(bitrate.adjust().is_some());
        assert!(bitrate.current_bitrate() < 4_000_000);
    }

    #[test]
    fn test_bitrate_recovers_and_clamps_at_max() {
        let mut bitrate = AdaptiveBitrate::new(7_900_000, 500_000, 8_000_000, 30);
        for _ in 0..4 {
            bitrate.record_sample(Duration::from_millis(20), 0.0);
        }
        let update = bitrate.adjust().unwrap();
        assert_eq!(update.bitrate, 8_000_000);
        assert_eq!(update.fps, 30);

        // Already at the ceiling: nothing further to apply.
        bitrate.last_adjust = Instant::now() - BITRATE_COOLDOWN;
        assert!(bitrate.adjust().is_none());
    }

    #[test]
    fn test_bitrate_floor_holds() {
        let mut bitrate = AdaptiveBitrate::new(600_000, 500_000, 8_000_000, 30);
        for _ in 0..10 {
            for _ in 0..4 {
                bitrate.record_sample(Duration::from_millis(600), 0.3);
            }
            bitrate.adjust();
            bitrate.last_adjust = Instant::now() - BITRATE_COOLDOWN;
        }
        assert_eq!(bitrate.current_bitrate(), 500_000);
        assert_eq!(bitrate.current_fps(), 10);
    }

    #[test]
    fn test_raising_ceiling_does_not_jump_current() {
        let mut bitrate = AdaptiveBitrate::new(2_000_000, 500_000, 4_000_000, 30);
        bitrate.set_max_bitrate(16_000_000);
        assert_eq!(bitrate.current_bitrate(), 2_000_000);

        bitrate.set_max_fps(60);
        assert_eq!(bitrate.current_fps(), 30);
    }

    #[test]
    fn test_middling_conditions_leave_rate_alone() {
        let mut bitrate = AdaptiveBitrate::new(4_000_000, 500_000, 8_000_000, 30);
        for _ in 0..4 {
            bitrate.record_sample(Duration::from_millis(250), 0.05);
        }
        assert!(bitrate.adjust().is_none());
    }
}
