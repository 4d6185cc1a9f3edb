//! Encoder facade.
//!
//! Owns a hardware backend when the platform provides one, a software
//! OpenH264 fallback, and the last successfully encoded frame (resent
//! during secure-desktop quiet periods). The GPU fast path is initialized
//! lazily on the first texture frame and disabled for the session only
//! after [`GPU_FAILURE_LIMIT`] consecutive failures, so the transient
//! failures that follow a monitor switch don't poison it.

mod jpeg;
mod software;

pub use jpeg::JpegFrameEncoder;
pub use software::SoftwareBackend;

use crate::capture::{Frame, GpuTextureHandle};
use crate::config::EncoderConfig;
use crate::convert::{nv12_len, to_nv12};
use crate::error::StreamError;
use crate::pool::global_pool;

/// Consecutive GPU encode failures tolerated before the GPU input path is
/// disabled for the session.
pub const GPU_FAILURE_LIMIT: u32 = 3;

/// Hardware video transform capability.
///
/// The transform consumes NV12 (CPU path) or a GPU texture directly (fast
/// path, once the GPU pipeline is up). `flush` runs the drain/restart
/// sequence that recovers a transform stuck after a device-manager change.
pub trait HardwareBackend: Send {
    fn init_gpu_pipeline(&mut self) -> Result<(), StreamError>;
    fn close_gpu_pipeline(&mut self);

    fn encode_nv12(
        &mut self,
        nv12: &[u8],
        width: u32,
        height: u32,
        keyframe: bool,
    ) -> Result<Option<Vec<u8>>, StreamError>;

    fn encode_texture(
        &mut self,
        texture: &GpuTextureHandle,
        keyframe: bool,
    ) -> Result<Option<Vec<u8>>, StreamError>;

    fn force_keyframe(&mut self);
    fn flush(&mut self) -> Result<(), StreamError>;
    fn set_bitrate(&mut self, bps: u32) -> Result<(), StreamError>;
    fn set_fps(&mut self, fps: u32) -> Result<(), StreamError>;
    fn close(&mut self);
}

/// Single encode surface in front of the hardware and software backends.
pub struct VideoEncoder {
    config: EncoderConfig,
    hardware: Option<Box<dyn HardwareBackend>>,
    software: SoftwareBackend,
    pending_keyframe: bool,
    gpu_pipeline_ready: bool,
    gpu_failures: u32,
    gpu_disabled: bool,
    last_encoded: Option<Vec<u8>>,
    closed: bool,
}

impl VideoEncoder {
    pub fn new(config: EncoderConfig, hardware: Option<Box<dyn HardwareBackend>>) -> Self {
        let software = SoftwareBackend::new(config.bitrate, config.fps);
        if hardware.is_some() {
            tracing::info!("video encoder using hardware backend");
        } else {
            tracing::info!("video encoder using software backend");
        }
        Self {
            config,
            hardware,
            software,
            pending_keyframe: false,
            gpu_pipeline_ready: false,
            gpu_failures: 0,
            gpu_disabled: false,
            last_encoded: None,
            closed: false,
        }
    }

    /// Encode a CPU-side frame; `None` when the backend skipped it.
    pub fn encode(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>, StreamError> {
        if self.closed {
            return Err(StreamError::Fatal("encoder closed".into()));
        }

        let pool = global_pool();
        let mut nv12 = pool.acquire(frame.width, frame.height);
        debug_assert_eq!(nv12.len(), nv12_len(frame.width, frame.height));
        to_nv12(frame, &mut nv12);

        let keyframe = self.pending_keyframe;
        let result = match self.hardware.as_mut() {
            Some(hw) => match hw.encode_nv12(&nv12, frame.width, frame.height, keyframe) {
                Ok(encoded) => Ok(encoded),
                Err(e) => {
                    // Per-frame fallback: a wedged transform must not drop
                    // the frame on the floor.
                    tracing::debug!("hardware encode failed, using software for this frame: {e}");
                    self.software
                        .encode_nv12(&nv12, frame.width, frame.height, keyframe)
                }
            },
            None => self
                .software
                .encode_nv12(&nv12, frame.width, frame.height, keyframe),
        };

        pool.release(nv12);
        self.finish_encode(result)
    }

    /// Encode straight from a GPU texture (duplication fast path).
    ///
    /// Fails with `NotSupported` once the GPU input path has been disabled;
    /// the caller then converts on the CPU instead.
    pub fn encode_texture(
        &mut self,
        texture: &GpuTextureHandle,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        if self.closed {
            return Err(StreamError::Fatal("encoder closed".into()));
        }
        if self.gpu_disabled {
            return Err(StreamError::NotSupported("gpu input disabled".into()));
        }
        let Some(hw) = self.hardware.as_mut() else {
            return Err(StreamError::NotSupported("no hardware backend".into()));
        };

        if !self.gpu_pipeline_ready {
            if let Err(e) = hw.init_gpu_pipeline() {
                self.note_gpu_failure();
                return Err(e);
            }
            self.gpu_pipeline_ready = true;
            tracing::info!("gpu encode pipeline initialized");
        }

        let keyframe = self.pending_keyframe;
        match hw.encode_texture(texture, keyframe) {
            Ok(encoded) => {
                self.gpu_failures = 0;
                self.finish_encode(Ok(encoded))
            }
            Err(e) => {
                self.note_gpu_failure();
                Err(e)
            }
        }
    }

    fn finish_encode(
        &mut self,
        result: Result<Option<Vec<u8>>, StreamError>,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        if let Ok(Some(encoded)) = &result {
            self.pending_keyframe = false;
            self.last_encoded = Some(encoded.clone());
        }
        result
    }

    fn note_gpu_failure(&mut self) {
        self.gpu_failures += 1;
        if self.gpu_failures >= GPU_FAILURE_LIMIT {
            tracing::warn!(
                failures = self.gpu_failures,
                "disabling gpu input path for this session"
            );
            self.gpu_disabled = true;
            self.gpu_pipeline_ready = false;
            if let Some(hw) = self.hardware.as_mut() {
                hw.close_gpu_pipeline();
            }
        }
    }

    /// Request an IDR on the next encoded frame.
    pub fn force_keyframe(&mut self) {
        self.pending_keyframe = true;
        if let Some(hw) = self.hardware.as_mut() {
            hw.force_keyframe();
        }
        self.software.force_keyframe();
    }

    /// Run the backend's drain/restart sequence.
    pub fn flush(&mut self) {
        if let Some(hw) = self.hardware.as_mut() {
            if let Err(e) = hw.flush() {
                tracing::debug!("encoder flush failed: {e}");
            }
        }
    }

    /// Close the GPU pipeline so it is lazily recreated on the next
    /// texture frame (monitor switch to a different adapter).
    pub fn reset_gpu_pipeline(&mut self) {
        if let Some(hw) = self.hardware.as_mut() {
            hw.close_gpu_pipeline();
        }
        self.gpu_pipeline_ready = false;
    }

    /// Whether texture input is currently usable.
    pub fn gpu_input_enabled(&self) -> bool {
        self.hardware.is_some() && !self.gpu_disabled
    }

    /// Whether a hardware backend is attached at all.
    pub fn is_hardware(&self) -> bool {
        self.hardware.is_some()
    }

    /// Bytes of the last successfully encoded frame, for resend during
    /// secure-desktop quiet periods.
    pub fn last_encoded_frame(&self) -> Option<&[u8]> {
        self.last_encoded.as_deref()
    }

    pub fn set_bitrate(&mut self, bps: u32) -> Result<(), StreamError> {
        self.config.set_bitrate(bps)?;
        if let Some(hw) = self.hardware.as_mut() {
            hw.set_bitrate(bps)?;
        }
        self.software.set_bitrate(bps)?;
        Ok(())
    }

    pub fn set_fps(&mut self, fps: u32) -> Result<(), StreamError> {
        self.config.set_fps(fps)?;
        if let Some(hw) = self.hardware.as_mut() {
            hw.set_fps(fps)?;
        }
        self.software.set_fps(fps)?;
        Ok(())
    }

    pub fn set_quality(&mut self, name: &str) -> Result<(), StreamError> {
        self.config.set_quality(name)
    }

    pub fn set_codec(&mut self, name: &str) -> Result<(), StreamError> {
        self.config.set_codec(name)
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Idempotent teardown of both backends.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(hw) = self.hardware.as_mut() {
            hw.close_gpu_pipeline();
            hw.close();
        }
        self.software.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Hardware backend whose texture path fails on demand.
    struct FlakyHardware {
        fail_textures: u32,
        init_calls: Arc<AtomicU32>,
        close_pipeline_calls: Arc<AtomicU32>,
    }

    impl FlakyHardware {
        fn boxed(fail_textures: u32) -> (Box<dyn HardwareBackend>, Arc<AtomicU32>, Arc<AtomicU32>) {
            let init = Arc::new(AtomicU32::new(0));
            let closed = Arc::new(AtomicU32::new(0));
            let hw = Box::new(Self {
                fail_textures,
                init_calls: Arc::clone(&init),
                close_pipeline_calls: Arc::clone(&closed),
            });
            (hw, init, closed)
        }
    }

    impl HardwareBackend for FlakyHardware {
        fn init_gpu_pipeline(&mut self) -> Result<(), StreamError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close_gpu_pipeline(&mut self) {
            self.close_pipeline_calls.fetch_add(1, Ordering::SeqCst);
        }

        fn encode_nv12(
            &mut self,
            nv12: &[u8],
            _width: u32,
            _height: u32,
            _keyframe: bool,
        ) -> Result<Option<Vec<u8>>, StreamError> {
            Ok(Some(nv12[..8.min(nv12.len())].to_vec()))
        }

        fn encode_texture(
            &mut self,
            texture: &GpuTextureHandle,
            _keyframe: bool,
        ) -> Result<Option<Vec<u8>>, StreamError> {
            if self.fail_textures > 0 {
                self.fail_textures -= 1;
                return Err(StreamError::Transient("gpu submit failed".into()));
            }
            Ok(Some(texture.id.to_le_bytes().to_vec()))
        }

        fn force_keyframe(&mut self) {}
        fn flush(&mut self) -> Result<(), StreamError> {
            Ok(())
        }
        fn set_bitrate(&mut self, _bps: u32) -> Result<(), StreamError> {
            Ok(())
        }
        fn set_fps(&mut self, _fps: u32) -> Result<(), StreamError> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    fn frame() -> Frame {
        Frame {
            data: vec![128u8; 16 * 16 * 4],
            width: 16,
            height: 16,
            stride: 16 * 4,
            format: PixelFormat::Bgra,
        }
    }

    fn texture() -> GpuTextureHandle {
        GpuTextureHandle {
            id: 7,
            width: 16,
            height: 16,
        }
    }

    #[test]
    fn test_gpu_pipeline_initialized_lazily() {
        let (hw, init, _) = FlakyHardware::boxed(0);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));

        // CPU frames never touch the GPU pipeline.
        encoder.encode(&frame()).unwrap();
        assert_eq!(init.load(Ordering::SeqCst), 0);

        encoder.encode_texture(&texture()).unwrap();
        encoder.encode_texture(&texture()).unwrap();
        assert_eq!(init.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_gpu_disabled_after_three_consecutive_failures() {
        let (hw, _, closed) = FlakyHardware::boxed(3);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));

        for _ in 0..2 {
            assert!(encoder.encode_texture(&texture()).is_err());
            assert!(encoder.gpu_input_enabled());
        }
        assert!(encoder.encode_texture(&texture()).is_err());
        assert!(!encoder.gpu_input_enabled());
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        // Once disabled, texture input reports NotSupported.
        assert!(matches!(
            encoder.encode_texture(&texture()),
            Err(StreamError::NotSupported(_))
        ));
    }

    #[test]
    fn test_gpu_failure_count_resets_on_success() {
        let (hw, _, _) = FlakyHardware::boxed(2);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));

        assert!(encoder.encode_texture(&texture()).is_err());
        assert!(encoder.encode_texture(&texture()).is_err());
        assert!(encoder.encode_texture(&texture()).is_ok());

        // Two fresh failures must not disable the path: the streak reset.
        let (hw, _, _) = FlakyHardware::boxed(2);
        encoder.hardware = Some(hw);
        assert!(encoder.encode_texture(&texture()).is_err());
        assert!(encoder.encode_texture(&texture()).is_err());
        assert!(encoder.gpu_input_enabled());
    }

    #[test]
    fn test_last_encoded_frame_cached() {
        let (hw, _, _) = FlakyHardware::boxed(0);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));
        assert!(encoder.last_encoded_frame().is_none());

        let encoded = encoder.encode(&frame()).unwrap().unwrap();
        assert_eq!(encoder.last_encoded_frame().unwrap(), &encoded[..]);
    }

    #[test]
    fn test_keyframe_request_consumed_by_next_encode() {
        let (hw, _, _) = FlakyHardware::boxed(0);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));
        encoder.force_keyframe();
        assert!(encoder.pending_keyframe);
        encoder.encode(&frame()).unwrap();
        assert!(!encoder.pending_keyframe);
    }

    #[test]
    fn test_reset_gpu_pipeline_recreates_lazily() {
        let (hw, init, closed) = FlakyHardware::boxed(0);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));

        encoder.encode_texture(&texture()).unwrap();
        assert_eq!(init.load(Ordering::SeqCst), 1);

        encoder.reset_gpu_pipeline();
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        encoder.encode_texture(&texture()).unwrap();
        assert_eq!(init.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_setter_validation_propagates() {
        let (hw, _, _) = FlakyHardware::boxed(0);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));

        assert!(matches!(
            encoder.set_bitrate(0),
            Err(StreamError::InvalidBitrate(_))
        ));
        assert!(matches!(
            encoder.set_fps(0),
            Err(StreamError::InvalidFps(_))
        ));
        assert!(matches!(
            encoder.set_codec("av1"),
            Err(StreamError::InvalidCodec(_))
        ));

        encoder.set_bitrate(1_000_000).unwrap();
        encoder.set_fps(24).unwrap();
        assert_eq!(encoder.config().bitrate, 1_000_000);
        assert_eq!(encoder.config().fps, 24);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (hw, _, _) = FlakyHardware::boxed(0);
        let mut encoder = VideoEncoder::new(EncoderConfig::new(16, 16), Some(hw));
        encoder.close();
        encoder.close();
        assert!(encoder.encode(&frame()).is_err());
    }
}
