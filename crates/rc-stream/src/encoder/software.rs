//! Software H264 backend wrapping OpenH264.
//!
//! Used whenever no hardware transform is available, and per-frame when the
//! hardware path hiccups. Accepts NV12, deinterleaves the chroma plane to
//! I420, and produces Annex B NAL units. The underlying encoder is created
//! lazily and rebuilt when the resolution or rate parameters change.

use openh264::encoder::{
    BitRate, Complexity, Encoder, EncoderConfig, FrameRate, FrameType, RateControlMode,
    SpsPpsStrategy, UsageType,
};
use openh264::formats::YUVSource;
use openh264::OpenH264API;

use crate::error::StreamError;

/// Planar I420 scratch buffer fed to OpenH264.
struct I420Buffer {
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    width: usize,
    height: usize,
}

impl YUVSource for I420Buffer {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        (self.width, self.width / 2, self.width / 2)
    }

    fn y(&self) -> &[u8] {
        &self.y
    }

    fn u(&self) -> &[u8] {
        &self.u
    }

    fn v(&self) -> &[u8] {
        &self.v
    }
}

impl I420Buffer {
    fn new(width: usize, height: usize) -> Self {
        let chroma = (width / 2) * (height / 2);
        Self {
            y: vec![0u8; width * height],
            u: vec![0u8; chroma],
            v: vec![0u8; chroma],
            width,
            height,
        }
    }

    /// Split an NV12 buffer (Y plane + interleaved UV) into planar I420.
    ///
    /// The source may be slightly larger than the scratch planes when the
    /// capture dimensions were odd and got masked to even.
    fn fill_from_nv12(&mut self, nv12: &[u8]) {
        let pixels = self.width * self.height;
        self.y.copy_from_slice(&nv12[..pixels]);

        let uv = &nv12[pixels..];
        for (i, pair) in uv.chunks_exact(2).take(self.u.len()).enumerate() {
            self.u[i] = pair[0];
            self.v[i] = pair[1];
        }
    }
}

/// OpenH264-backed encoder with the facade's backend contract.
pub struct SoftwareBackend {
    encoder: Option<Encoder>,
    scratch: Option<I420Buffer>,
    width: u32,
    height: u32,
    bitrate: u32,
    fps: u32,
    /// Rate parameters changed; rebuild the encoder on the next frame.
    dirty: bool,
    frame_count: u64,
}

impl SoftwareBackend {
    pub fn new(bitrate: u32, fps: u32) -> Self {
        Self {
            encoder: None,
            scratch: None,
            width: 0,
            height: 0,
            bitrate,
            fps,
            dirty: false,
            frame_count: 0,
        }
    }

    fn ensure_encoder(&mut self, width: u32, height: u32) -> Result<(), StreamError> {
        // OpenH264 requires even dimensions.
        let width = width & !1;
        let height = height & !1;
        if width == 0 || height == 0 {
            return Err(StreamError::Fatal("encoder dimensions must be non-zero".into()));
        }

        if self.encoder.is_some() && !self.dirty && self.width == width && self.height == height {
            return Ok(());
        }

        let config = EncoderConfig::new()
            .bitrate(BitRate::from_bps(self.bitrate))
            .max_frame_rate(FrameRate::from_hz(self.fps as f32))
            .usage_type(UsageType::ScreenContentRealTime)
            .rate_control_mode(RateControlMode::Bitrate)
            .complexity(Complexity::Low)
            .skip_frames(false)
            .sps_pps_strategy(SpsPpsStrategy::ConstantId);

        let api = OpenH264API::from_source();
        let encoder = Encoder::with_api_config(api, config)
            .map_err(|e| StreamError::Fatal(format!("openh264 encoder creation failed: {e}")))?;

        tracing::info!(
            width,
            height,
            bitrate = self.bitrate,
            fps = self.fps,
            "openh264 software encoder initialized"
        );

        self.encoder = Some(encoder);
        self.scratch = Some(I420Buffer::new(width as usize, height as usize));
        self.width = width;
        self.height = height;
        self.dirty = false;
        Ok(())
    }

    /// Encode one NV12 frame into Annex B NAL units.
    ///
    /// Returns `None` when rate control skips the frame.
    pub fn encode_nv12(
        &mut self,
        nv12: &[u8],
        width: u32,
        height: u32,
        keyframe: bool,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        self.ensure_encoder(width, height)?;

        let encoder = self.encoder.as_mut().ok_or_else(|| {
            StreamError::Fatal("software encoder unavailable".into())
        })?;
        let scratch = self.scratch.as_mut().ok_or_else(|| {
            StreamError::Fatal("software encoder scratch unavailable".into())
        })?;

        if nv12.len() < scratch.width * scratch.height * 3 / 2 {
            return Err(StreamError::Transient(format!(
                "nv12 buffer too small: {} for {}x{}",
                nv12.len(),
                scratch.width,
                scratch.height
            )));
        }

        if keyframe {
            encoder.force_intra_frame();
        }

        scratch.fill_from_nv12(nv12);

        let bitstream = encoder
            .encode(scratch)
            .map_err(|e| StreamError::Transient(format!("openh264 encode error: {e}")))?;

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip) {
            return Ok(None);
        }

        let mut nal_data = Vec::with_capacity(nv12.len() / 10);
        bitstream.write_vec(&mut nal_data);
        if nal_data.is_empty() {
            return Ok(None);
        }

        self.frame_count += 1;
        if self.frame_count <= 3 || self.frame_count % 300 == 0 {
            tracing::debug!(
                frame = self.frame_count,
                nal_bytes = nal_data.len(),
                ?frame_type,
                "openh264 encoded frame"
            );
        }

        Ok(Some(nal_data))
    }

    /// Request the next frame be an IDR.
    pub fn force_keyframe(&mut self) {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.force_intra_frame();
        }
    }

    pub fn set_bitrate(&mut self, bps: u32) -> Result<(), StreamError> {
        if bps == 0 {
            return Err(StreamError::InvalidBitrate("bitrate must be > 0".into()));
        }
        if bps != self.bitrate {
            self.bitrate = bps;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn set_fps(&mut self, fps: u32) -> Result<(), StreamError> {
        if fps == 0 || fps > 60 {
            return Err(StreamError::InvalidFps(format!("fps {fps} out of range 1..=60")));
        }
        if fps != self.fps {
            self.fps = fps;
            self.dirty = true;
        }
        Ok(())
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn close(&mut self) {
        self.encoder = None;
        self.scratch = None;
    }
}
