//! Shared mock capability providers for unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rc_protocol::{InputEvent, MonitorInfo};

use crate::audio::AudioCapturer;
use crate::capture::{
    Captured, Capturer, CursorProvider, DesktopSwitchNotifier, Frame, GpuTextureHandle,
    PixelFormat,
};
use crate::config::{CaptureConfig, EncoderConfig};
use crate::encoder::HardwareBackend;
use crate::error::StreamError;
use crate::input::InputHandler;
use crate::platform::PlatformFactory;
use crate::transport::{
    ChannelMessage, ChannelState, DataChannel, MediaTrack, MessageHandler, PeerTransport,
    StatsReport,
};

pub(crate) struct MockCapturer {
    pub bounds: (u32, u32),
    pub closes: Arc<AtomicU32>,
    pub fail_next: Arc<Mutex<Option<StreamError>>>,
}

impl Capturer for MockCapturer {
    fn capture(&mut self, _timeout: Duration) -> Result<Captured, StreamError> {
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        let (width, height) = self.bounds;
        Ok(Captured::cpu(Frame {
            data: vec![120u8; (width * height * 4) as usize],
            width,
            height,
            stride: width * 4,
            format: PixelFormat::Bgra,
        }))
    }

    fn capture_region(
        &mut self,
        _x: i32,
        _y: i32,
        width: u32,
        height: u32,
    ) -> Result<Frame, StreamError> {
        Ok(Frame {
            data: vec![0u8; (width * height * 4) as usize],
            width,
            height,
            stride: width * 4,
            format: PixelFormat::Bgra,
        })
    }

    fn bounds(&self) -> (u32, u32) {
        self.bounds
    }

    fn reinitialize(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn is_event_driven(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct MockHardware;

impl HardwareBackend for MockHardware {
    fn init_gpu_pipeline(&mut self) -> Result<(), StreamError> {
        Ok(())
    }
    fn close_gpu_pipeline(&mut self) {}
    fn encode_nv12(
        &mut self,
        nv12: &[u8],
        _width: u32,
        _height: u32,
        _keyframe: bool,
    ) -> Result<Option<Vec<u8>>, StreamError> {
        Ok(Some(nv12[..32.min(nv12.len())].to_vec()))
    }
    fn encode_texture(
        &mut self,
        texture: &GpuTextureHandle,
        _keyframe: bool,
    ) -> Result<Option<Vec<u8>>, StreamError> {
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

pub(crate) struct MockInputHandler {
    pub events: Arc<Mutex<Vec<InputEvent>>>,
}

impl InputHandler for MockInputHandler {
    fn handle(&mut self, event: &InputEvent) -> Result<(), StreamError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
    fn release_all_modifiers(&mut self) {}
    fn jiggle_pointer(&mut self) {}
}

pub(crate) struct FixedCursor(pub i32, pub i32);

impl CursorProvider for FixedCursor {
    fn cursor_position(&self) -> Option<(i32, i32, bool)> {
        Some((self.0, self.1, true))
    }
}

pub(crate) struct MockFactory {
    pub monitors: Vec<MonitorInfo>,
    pub capturer_closes: Mutex<Vec<Arc<AtomicU32>>>,
    pub capturer_fail_handles: Mutex<Vec<Arc<Mutex<Option<StreamError>>>>>,
    pub input_events: Arc<Mutex<Vec<InputEvent>>>,
    pub with_cursor: bool,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            monitors: vec![
                MonitorInfo {
                    index: 0,
                    name: "MOCK-0".into(),
                    width: 64,
                    height: 48,
                    x: 0,
                    y: 0,
                    is_primary: true,
                },
                MonitorInfo {
                    index: 1,
                    name: "MOCK-1".into(),
                    width: 128,
                    height: 96,
                    x: 64,
                    y: 0,
                    is_primary: false,
                },
            ],
            capturer_closes: Mutex::new(Vec::new()),
            capturer_fail_handles: Mutex::new(Vec::new()),
            input_events: Arc::new(Mutex::new(Vec::new())),
            with_cursor: false,
        }
    }

    pub fn with_cursor(mut self) -> Self {
        self.with_cursor = true;
        self
    }
}

impl PlatformFactory for MockFactory {
    fn new_capturer(&self, config: &CaptureConfig) -> Result<Box<dyn Capturer>, StreamError> {
        let monitor = self
            .monitors
            .iter()
            .find(|m| m.index == config.display_index)
            .ok_or(StreamError::DisplayNotFound(config.display_index))?;
        let closes = Arc::new(AtomicU32::new(0));
        let fail_next = Arc::new(Mutex::new(None));
        self.capturer_closes.lock().unwrap().push(Arc::clone(&closes));
        self.capturer_fail_handles
            .lock()
            .unwrap()
            .push(Arc::clone(&fail_next));
        Ok(Box::new(MockCapturer {
            bounds: (monitor.width, monitor.height),
            closes,
            fail_next,
        }))
    }

    fn new_fallback_capturer(
        &self,
        config: &CaptureConfig,
    ) -> Result<Box<dyn Capturer>, StreamError> {
        self.new_capturer(config)
    }

    fn new_input_handler(&self) -> Result<Box<dyn InputHandler>, StreamError> {
        Ok(Box::new(MockInputHandler {
            events: Arc::clone(&self.input_events),
        }))
    }

    fn new_audio_capturer(&self) -> Result<Box<dyn AudioCapturer>, StreamError> {
        Err(StreamError::NotSupported("mock audio".into()))
    }

    fn new_hardware_backend(&self, _config: &EncoderConfig) -> Option<Box<dyn HardwareBackend>> {
        Some(Box::new(MockHardware))
    }

    fn cursor_provider(&self) -> Option<Box<dyn CursorProvider>> {
        self.with_cursor
            .then(|| Box::new(FixedCursor(105, 207)) as Box<dyn CursorProvider>)
    }

    fn desktop_switch_notifier(&self) -> Option<Box<dyn DesktopSwitchNotifier>> {
        None
    }

    fn desktop_switch_supported(&self) -> bool {
        false
    }

    fn enumerate_monitors(&self) -> Result<Vec<MonitorInfo>, StreamError> {
        Ok(self.monitors.clone())
    }

    fn request_desktop_repaint(&self) {}

    fn send_sas(&self) -> Result<(), StreamError> {
        Err(StreamError::NotSupported("mock sas".into()))
    }

    fn lock_workstation(&self) -> Result<(), StreamError> {
        Ok(())
    }
}

pub(crate) struct MockChannel {
    pub state: Mutex<ChannelState>,
    pub sent: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn open() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChannelState::Open),
            sent: Mutex::new(Vec::new()),
        })
    }
}

impl DataChannel for MockChannel {
    fn ready_state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }
    fn send(&self, _data: &[u8]) -> Result<(), StreamError> {
        Ok(())
    }
    fn send_text(&self, text: &str) -> Result<(), StreamError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
    fn on_message(&self, _handler: MessageHandler) {}
    fn close(&self) {
        *self.state.lock().unwrap() = ChannelState::Closed;
    }
}

impl std::fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockChannel").finish()
    }
}

pub(crate) struct MockPeer {
    pub closes: AtomicU32,
}

impl MockPeer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            closes: AtomicU32::new(0),
        })
    }
}

impl PeerTransport for MockPeer {
    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
    fn get_stats(&self) -> StatsReport {
        StatsReport::default()
    }
}

pub(crate) struct MockTrack {
    pub samples: Mutex<Vec<Vec<u8>>>,
}

impl MockTrack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(Vec::new()),
        })
    }
}

impl MediaTrack for MockTrack {
    fn write_sample(&self, data: &[u8], _duration: Duration) -> Result<(), StreamError> {
        self.samples.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

/// Feed a channel message to a handler the way a transport would.
#[allow(dead_code)]
pub(crate) fn deliver(handler: &MessageHandler, text: &str) {
    handler(ChannelMessage::Text(text.to_string()));
}
