//! Audio capture capability and G.711 mu-law encoding.
//!
//! The platform backend delivers 20 ms frames of mu-law bytes to a sink
//! callback; the session decides whether to forward them (audio can be
//! toggled mid-stream without stopping the capture device).

use crate::error::StreamError;

/// G.711 sample rate.
pub const MULAW_SAMPLE_RATE: u32 = 8_000;
/// Frame duration shipped to the audio track.
pub const AUDIO_FRAME_MS: u64 = 20;
/// Samples (and mu-law bytes) per 20 ms frame.
pub const SAMPLES_PER_FRAME: usize = (MULAW_SAMPLE_RATE as usize * AUDIO_FRAME_MS as usize) / 1000;

/// Receives encoded 20 ms mu-law frames on the capture thread.
pub type AudioSink = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Platform audio loopback capture.
pub trait AudioCapturer: Send {
    /// Start delivering frames to `sink`. The sink runs on the capture
    /// thread and must not block.
    fn start(&mut self, sink: AudioSink) -> Result<(), StreamError>;

    /// Stop capture; idempotent.
    fn stop(&mut self);
}

// ─── mu-law ─────────────────────────────────────────────────────────

/// Encode one linear 16-bit PCM sample to a G.711 mu-law byte.
///
/// Segment search widens the shift until the magnitude fits the 4-bit
/// mantissa; the top segment clamps, producing the plateau at 0x80/0x00
/// for full-scale input. Properties: `enc(0) == 0xFF`,
/// `enc(n) ^ enc(-n) == 0x80`, and the byte value never increases as the
/// input magnitude grows.
pub fn mulaw_encode_sample(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let magnitude = (sample as i32).unsigned_abs().min(32_767);

    let mut exponent: u32 = 0;
    while (magnitude >> exponent) > 0x0F && exponent < 7 {
        exponent += 1;
    }
    let mantissa = ((magnitude >> exponent) as u8).min(0x0F);

    !(sign | ((exponent as u8) << 4) | mantissa)
}

/// Encode a PCM buffer, appending one mu-law byte per sample.
pub fn mulaw_encode(pcm: &[i16], out: &mut Vec<u8>) {
    out.reserve(pcm.len());
    out.extend(pcm.iter().map(|&s| mulaw_encode_sample(s)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_encodes_to_ff() {
        assert_eq!(mulaw_encode_sample(0), 0xFF);
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(mulaw_encode_sample(4), 0xFB);
        assert_eq!(mulaw_encode_sample(-4), 0x7B);
    }

    #[test]
    fn test_sign_symmetry() {
        for n in (-32_767i16..=32_767).step_by(97) {
            let pos = mulaw_encode_sample(n);
            let neg = mulaw_encode_sample(n.saturating_neg());
            assert_eq!(pos ^ neg, 0x80, "symmetry broken at {n}");
        }
        assert_eq!(mulaw_encode_sample(32_767) ^ mulaw_encode_sample(-32_767), 0x80);
    }

    #[test]
    fn test_monotone_nonincreasing_magnitude() {
        let mut prev = mulaw_encode_sample(0);
        for n in 1..=32_767i16 {
            let cur = mulaw_encode_sample(n);
            assert!(cur <= prev, "non-monotonic at {n}: {cur:#x} > {prev:#x}");
            prev = cur;
        }
    }

    #[test]
    fn test_i16_min_is_clamped() {
        // -32768 has no positive counterpart; it must behave like -32767.
        assert_eq!(mulaw_encode_sample(i16::MIN), mulaw_encode_sample(-32_767));
    }

    #[test]
    fn test_buffer_encode() {
        let mut out = Vec::new();
        mulaw_encode(&[0, 4, -4], &mut out);
        assert_eq!(out, vec![0xFF, 0xFB, 0x7B]);
    }

    #[test]
    fn test_frame_sizing() {
        assert_eq!(SAMPLES_PER_FRAME, 160);
    }
}
