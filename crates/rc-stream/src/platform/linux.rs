//! Linux capability providers.
//!
//! Capture runs a GStreamer `ximagesrc` pipeline in a child process and
//! reads raw BGRx frames from its stdout; monitors come from `xrandr`;
//! input injection uses `enigo`; audio loopback uses the PulseAudio/
//! PipeWire monitor device via `cpal`; wallpaper suppression goes through
//! `gsettings`. Linux has no secure-desktop concept, so no desktop-switch
//! notifier is provided, and the compositor renders the cursor into the
//! captured stream, so no separate cursor provider either.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rc_protocol::{InputEvent, MonitorInfo, MouseButton};

use crate::audio::{AudioCapturer, AudioSink, MULAW_SAMPLE_RATE, SAMPLES_PER_FRAME};
use crate::capture::{Captured, Capturer, CursorProvider, DesktopSwitchNotifier, Frame, PixelFormat};
use crate::config::{CaptureConfig, EncoderConfig};
use crate::encoder::HardwareBackend;
use crate::error::StreamError;
use crate::input::InputHandler;
use crate::platform::PlatformFactory;
use crate::wallpaper::{WallpaperBackend, WallpaperState};

const CAPTURE_FPS: u32 = 30;

pub(crate) struct LinuxFactory;

impl LinuxFactory {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl PlatformFactory for LinuxFactory {
    fn new_capturer(&self, config: &CaptureConfig) -> Result<Box<dyn Capturer>, StreamError> {
        let monitor = monitor_by_index(config.display_index)?;
        Ok(Box::new(GstCapturer::spawn(&monitor)?))
    }

    fn new_fallback_capturer(
        &self,
        config: &CaptureConfig,
    ) -> Result<Box<dyn Capturer>, StreamError> {
        // Same blit path; a fresh pipeline recovers from a wedged one.
        self.new_capturer(config)
    }

    fn new_input_handler(&self) -> Result<Box<dyn InputHandler>, StreamError> {
        Ok(Box::new(EnigoInput::new()?))
    }

    fn new_audio_capturer(&self) -> Result<Box<dyn AudioCapturer>, StreamError> {
        Ok(Box::new(CpalAudioCapturer::new()))
    }

    fn new_hardware_backend(&self, _config: &EncoderConfig) -> Option<Box<dyn HardwareBackend>> {
        None
    }

    fn cursor_provider(&self) -> Option<Box<dyn CursorProvider>> {
        // Compositor-rendered; position is not separately queryable on
        // Wayland without a RemoteDesktop session.
        None
    }

    fn desktop_switch_notifier(&self) -> Option<Box<dyn DesktopSwitchNotifier>> {
        None
    }

    fn desktop_switch_supported(&self) -> bool {
        false
    }

    fn enumerate_monitors(&self) -> Result<Vec<MonitorInfo>, StreamError> {
        Ok(enumerate_monitors_xrandr().unwrap_or_else(fallback_monitors))
    }

    fn request_desktop_repaint(&self) {
        // Best effort: xrefresh forces every X client to redraw.
        match Command::new("xrefresh").status() {
            Ok(status) if status.success() => {}
            _ => tracing::debug!("xrefresh unavailable, skipping desktop repaint"),
        }
    }

    fn send_sas(&self) -> Result<(), StreamError> {
        Err(StreamError::NotSupported(
            "secure attention sequence".into(),
        ))
    }

    fn lock_workstation(&self) -> Result<(), StreamError> {
        let locked = Command::new("loginctl")
            .arg("lock-session")
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if locked {
            return Ok(());
        }

        Command::new("xdg-screensaver")
            .arg("lock")
            .status()
            .map_err(|e| StreamError::NotSupported(format!("no session locker: {e}")))
            .and_then(|status| {
                if status.success() {
                    Ok(())
                } else {
                    Err(StreamError::Fatal("xdg-screensaver lock failed".into()))
                }
            })
    }
}

// ─── Monitors ───────────────────────────────────────────────────────

fn monitor_by_index(index: u32) -> Result<MonitorInfo, StreamError> {
    let monitors = enumerate_monitors_xrandr().unwrap_or_else(fallback_monitors);
    monitors
        .into_iter()
        .find(|m| m.index == index)
        .ok_or(StreamError::DisplayNotFound(index))
}

fn fallback_monitors() -> Vec<MonitorInfo> {
    vec![MonitorInfo {
        index: 0,
        name: "Primary Display".to_string(),
        width: 1920,
        height: 1080,
        x: 0,
        y: 0,
        is_primary: true,
    }]
}

/// Parse `xrandr --query` output lines like
/// `HDMI-1 connected primary 1920x1080+0+0 (normal ...) 527mm x 296mm`.
fn enumerate_monitors_xrandr() -> Option<Vec<MonitorInfo>> {
    let output = Command::new("xrandr").arg("--query").output().ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let monitors = parse_xrandr_query(&stdout);
    if monitors.is_empty() {
        None
    } else {
        Some(monitors)
    }
}

fn parse_xrandr_query(stdout: &str) -> Vec<MonitorInfo> {
    let mut monitors = Vec::new();
    let mut index = 0u32;

    for line in stdout.lines() {
        if !line.contains(" connected") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }

        let name = parts[0].to_string();
        let is_primary = line.contains("primary");

        let mut width = 0u32;
        let mut height = 0u32;
        let mut pos_x = 0i32;
        let mut pos_y = 0i32;

        // Find the geometry token (WxH+X+Y).
        for part in &parts[2..] {
            if part.contains('x') && part.contains('+') {
                if let Some((res, pos)) = part.split_once('+') {
                    if let Some((w, h)) = res.split_once('x') {
                        width = w.parse().unwrap_or(0);
                        height = h.parse().unwrap_or(0);
                    }
                    if let Some((x, y)) = pos.split_once('+') {
                        pos_x = x.parse().unwrap_or(0);
                        pos_y = y.parse().unwrap_or(0);
                    }
                }
                break;
            }
        }

        if width == 0 || height == 0 {
            continue;
        }

        monitors.push(MonitorInfo {
            index,
            name,
            width,
            height,
            x: pos_x,
            y: pos_y,
            is_primary,
        });
        index += 1;
    }

    monitors
}

// ─── Capture ────────────────────────────────────────────────────────

/// Frames queued between the pipe reader thread and `capture`. Small so
/// stale frames are dropped rather than delivered late.
const FRAME_QUEUE_DEPTH: usize = 2;

/// Screen capturer backed by a `gst-launch-1.0 ximagesrc` child process
/// writing raw BGRx frames to stdout.
struct GstCapturer {
    child: Option<Child>,
    frames: Option<Receiver<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
    monitor: MonitorInfo,
    closed: bool,
}

impl GstCapturer {
    fn spawn(monitor: &MonitorInfo) -> Result<Self, StreamError> {
        let mut capturer = Self {
            child: None,
            frames: None,
            reader: None,
            monitor: monitor.clone(),
            closed: false,
        };
        capturer.launch()?;
        Ok(capturer)
    }

    fn launch(&mut self) -> Result<(), StreamError> {
        let m = &self.monitor;
        let pipeline = format!(
            "ximagesrc use-damage=false startx={} starty={} endx={} endy={} \
             ! video/x-raw,framerate={}/1 \
             ! videoconvert \
             ! video/x-raw,format=BGRx \
             ! fdsink fd=1",
            m.x,
            m.y,
            m.x + m.width as i32 - 1,
            m.y + m.height as i32 - 1,
            CAPTURE_FPS,
        );

        tracing::info!(monitor = %m.name, width = m.width, height = m.height, "launching capture pipeline");

        let mut child = Command::new("sh")
            .args(["-c", &format!("gst-launch-1.0 -q -e {pipeline}")])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| StreamError::NotSupported(format!("gst-launch unavailable: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Fatal("capture pipeline has no stdout".into()))?;

        let frame_len = m.width as usize * m.height as usize * 4;
        let (tx, rx): (SyncSender<Vec<u8>>, Receiver<Vec<u8>>) =
            std::sync::mpsc::sync_channel(FRAME_QUEUE_DEPTH);

        let reader = std::thread::Builder::new()
            .name("gst-frame-reader".into())
            .spawn(move || {
                let mut buf = vec![0u8; frame_len];
                loop {
                    if let Err(e) = stdout.read_exact(&mut buf) {
                        tracing::debug!("capture pipeline stdout closed: {e}");
                        return;
                    }
                    match tx.try_send(buf.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // Consumer is behind; drop the stale frame.
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            })
            .map_err(|e| StreamError::Fatal(format!("spawn frame reader: {e}")))?;

        self.child = Some(child);
        self.frames = Some(rx);
        self.reader = Some(reader);
        self.closed = false;
        Ok(())
    }

    fn teardown(&mut self) {
        self.frames = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Capturer for GstCapturer {
    fn capture(&mut self, timeout: Duration) -> Result<Captured, StreamError> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| StreamError::DeviceLost("capture pipeline not running".into()))?;

        match frames.recv_timeout(timeout) {
            Ok(data) => Ok(Captured::cpu(Frame {
                data,
                width: self.monitor.width,
                height: self.monitor.height,
                stride: self.monitor.width * 4,
                format: PixelFormat::Bgra,
            })),
            Err(RecvTimeoutError::Timeout) => {
                Err(StreamError::Transient("no dirty frame within timeout".into()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(StreamError::DeviceLost("capture pipeline exited".into()))
            }
        }
    }

    fn capture_region(
        &mut self,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> Result<Frame, StreamError> {
        // Full capture + crop; the pipeline is already sized to the monitor.
        let captured = self.capture(Duration::from_millis(200))?;
        let full = captured.frame;

        let x = x.max(0) as usize;
        let y = y.max(0) as usize;
        let width = (width as usize).min(full.width as usize - x.min(full.width as usize));
        let height = (height as usize).min(full.height as usize - y.min(full.height as usize));
        if width == 0 || height == 0 {
            return Err(StreamError::Transient("empty capture region".into()));
        }

        let stride = full.stride as usize;
        let mut data = Vec::with_capacity(width * height * 4);
        for row in y..y + height {
            let start = row * stride + x * 4;
            data.extend_from_slice(&full.data[start..start + width * 4]);
        }

        Ok(Frame {
            data,
            width: width as u32,
            height: height as u32,
            stride: width as u32 * 4,
            format: PixelFormat::Bgra,
        })
    }

    fn bounds(&self) -> (u32, u32) {
        (self.monitor.width, self.monitor.height)
    }

    fn reinitialize(&mut self) -> Result<(), StreamError> {
        tracing::info!("restarting capture pipeline");
        self.teardown();
        self.launch()
    }

    fn is_event_driven(&self) -> bool {
        // The pipeline paces frame delivery; capture blocks on the queue.
        true
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.teardown();
    }
}

impl Drop for GstCapturer {
    fn drop(&mut self) {
        self.close();
    }
}

// ─── Input ──────────────────────────────────────────────────────────

struct EnigoInput {
    enigo: enigo::Enigo,
}

impl EnigoInput {
    fn new() -> Result<Self, StreamError> {
        use enigo::Settings;

        let enigo = enigo::Enigo::new(&Settings::default())
            .map_err(|e| StreamError::NotSupported(format!("input backend unavailable: {e:?}")))?;
        Ok(Self { enigo })
    }

    fn press_modifiers(&mut self, modifiers: &[rc_protocol::Modifier], direction: enigo::Direction) {
        use enigo::{Key, Keyboard};

        for modifier in modifiers {
            let key = match modifier {
                rc_protocol::Modifier::Ctrl => Key::Control,
                rc_protocol::Modifier::Alt => Key::Alt,
                rc_protocol::Modifier::Shift => Key::Shift,
                rc_protocol::Modifier::Meta => Key::Meta,
            };
            if let Err(e) = self.enigo.key(key, direction) {
                tracing::warn!("enigo modifier failed: {e:?}");
            }
        }
    }
}

/// Map a web `KeyboardEvent.key` name to an enigo key.
fn map_key(name: &str) -> Option<enigo::Key> {
    use enigo::Key;

    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        return Some(Key::Unicode(c));
    }

    let key = match name {
        "Enter" => Key::Return,
        "Backspace" => Key::Backspace,
        "Tab" => Key::Tab,
        "Escape" => Key::Escape,
        "Delete" => Key::Delete,
        "Home" => Key::Home,
        "End" => Key::End,
        "PageUp" => Key::PageUp,
        "PageDown" => Key::PageDown,
        "ArrowUp" => Key::UpArrow,
        "ArrowDown" => Key::DownArrow,
        "ArrowLeft" => Key::LeftArrow,
        "ArrowRight" => Key::RightArrow,
        "Shift" => Key::Shift,
        "Control" => Key::Control,
        "Alt" => Key::Alt,
        "Meta" => Key::Meta,
        "CapsLock" => Key::CapsLock,
        "F1" => Key::F1,
        "F2" => Key::F2,
        "F3" => Key::F3,
        "F4" => Key::F4,
        "F5" => Key::F5,
        "F6" => Key::F6,
        "F7" => Key::F7,
        "F8" => Key::F8,
        "F9" => Key::F9,
        "F10" => Key::F10,
        "F11" => Key::F11,
        "F12" => Key::F12,
        _ => return None,
    };
    Some(key)
}

impl InputHandler for EnigoInput {
    fn handle(&mut self, event: &InputEvent) -> Result<(), StreamError> {
        use enigo::{Axis, Button, Coordinate, Direction, Keyboard, Mouse};

        let button_of = |b: MouseButton| match b {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
            MouseButton::Middle => Button::Middle,
        };

        match event {
            InputEvent::MouseMove { x, y } => {
                if let Err(e) = self.enigo.move_mouse(*x, *y, Coordinate::Abs) {
                    tracing::warn!("enigo move_mouse failed: {e:?}");
                }
            }
            InputEvent::MouseClick {
                x,
                y,
                button,
                modifiers,
            } => {
                let _ = self.enigo.move_mouse(*x, *y, Coordinate::Abs);
                self.press_modifiers(modifiers, Direction::Press);
                if let Err(e) = self.enigo.button(button_of(*button), Direction::Click) {
                    tracing::warn!("enigo click failed: {e:?}");
                }
                self.press_modifiers(modifiers, Direction::Release);
            }
            InputEvent::MouseDown { x, y, button } => {
                let _ = self.enigo.move_mouse(*x, *y, Coordinate::Abs);
                if let Err(e) = self.enigo.button(button_of(*button), Direction::Press) {
                    tracing::warn!("enigo press failed: {e:?}");
                }
            }
            InputEvent::MouseUp { x, y, button } => {
                let _ = self.enigo.move_mouse(*x, *y, Coordinate::Abs);
                if let Err(e) = self.enigo.button(button_of(*button), Direction::Release) {
                    tracing::warn!("enigo release failed: {e:?}");
                }
            }
            InputEvent::MouseScroll { delta, .. } => {
                if delta.abs() > 0.01 {
                    let clicks = (delta * 3.0) as i32;
                    if let Err(e) = self.enigo.scroll(clicks, Axis::Vertical) {
                        tracing::warn!("enigo scroll failed: {e:?}");
                    }
                }
            }
            InputEvent::KeyPress { key, modifiers } => {
                if let Some(key) = map_key(key) {
                    self.press_modifiers(modifiers, Direction::Press);
                    if let Err(e) = self.enigo.key(key, Direction::Click) {
                        tracing::warn!("enigo key failed: {e:?}");
                    }
                    self.press_modifiers(modifiers, Direction::Release);
                }
            }
            InputEvent::KeyDown { key, .. } => {
                if let Some(key) = map_key(key) {
                    if let Err(e) = self.enigo.key(key, Direction::Press) {
                        tracing::warn!("enigo key down failed: {e:?}");
                    }
                }
            }
            InputEvent::KeyUp { key, .. } => {
                if let Some(key) = map_key(key) {
                    if let Err(e) = self.enigo.key(key, Direction::Release) {
                        tracing::warn!("enigo key up failed: {e:?}");
                    }
                }
            }
        }
        Ok(())
    }

    fn release_all_modifiers(&mut self) {
        use enigo::{Direction, Key, Keyboard};

        for key in [Key::Shift, Key::Control, Key::Alt, Key::Meta] {
            let _ = self.enigo.key(key, Direction::Release);
        }
    }

    fn jiggle_pointer(&mut self) {
        use enigo::{Coordinate, Mouse};

        let _ = self.enigo.move_mouse(1, 0, Coordinate::Rel);
        let _ = self.enigo.move_mouse(-1, 0, Coordinate::Rel);
    }
}

// ─── Audio ──────────────────────────────────────────────────────────

struct CpalAudioCapturer {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalAudioCapturer {
    fn new() -> Self {
        Self {
            stop_flag: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl AudioCapturer for CpalAudioCapturer {
    fn start(&mut self, sink: AudioSink) -> Result<(), StreamError> {
        self.stop();

        self.stop_flag = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&self.stop_flag);

        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                if let Err(e) = run_audio_loop(stop, sink) {
                    tracing::warn!("audio capture ended with error: {e}");
                }
            })
            .map_err(|e| StreamError::Fatal(format!("spawn audio thread: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalAudioCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_audio_loop(stop: Arc<AtomicBool>, sink: AudioSink) -> Result<(), StreamError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();

    // Only a monitor/loopback device is acceptable: the default input is
    // typically a microphone, which must never be captured silently.
    let device = host
        .input_devices()
        .ok()
        .and_then(|mut devices| {
            devices.find(|d| {
                d.name()
                    .map(|n| n.contains(".monitor") || n.contains("Monitor"))
                    .unwrap_or(false)
            })
        })
        .ok_or_else(|| StreamError::NotSupported("no audio monitor device".into()))?;

    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
    let supported = device
        .default_input_config()
        .map_err(|e| StreamError::NotSupported(format!("audio config: {e}")))?;
    let src_rate = supported.sample_rate().0;
    let src_channels = supported.channels() as u32;
    let sample_format = supported.sample_format();

    tracing::info!(device = %device_name, src_rate, src_channels, "audio capture device");

    let pcm: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
    let pcm_writer = Arc::clone(&pcm);
    let stop_for_stream = Arc::clone(&stop);

    let config = cpal::StreamConfig {
        channels: src_channels as u16,
        sample_rate: cpal::SampleRate(src_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let err_fn = |e| tracing::warn!("audio stream error: {e}");
    let stream = match sample_format {
        cpal::SampleFormat::F32 => device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if stop_for_stream.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Ok(mut buf) = pcm_writer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| StreamError::NotSupported(format!("audio stream: {e}")))?,
        cpal::SampleFormat::I16 => device
            .build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if stop_for_stream.load(Ordering::Relaxed) {
                        return;
                    }
                    let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    if let Ok(mut buf) = pcm_writer.lock() {
                        buf.extend_from_slice(&floats);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| StreamError::NotSupported(format!("audio stream: {e}")))?,
        fmt => {
            return Err(StreamError::NotSupported(format!(
                "audio sample format {fmt:?}"
            )))
        }
    };

    stream
        .play()
        .map_err(|e| StreamError::NotSupported(format!("audio play: {e}")))?;

    // Drain, resample to 8kHz mono, mu-law encode, emit 20ms frames.
    let mut pending: Vec<u8> = Vec::with_capacity(SAMPLES_PER_FRAME * 4);
    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(5));

        let drained: Vec<f32> = {
            let mut buf = pcm.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buf)
        };
        if drained.is_empty() {
            continue;
        }

        let mono = resample_to_mono_8k(&drained, src_rate, src_channels);
        pending.reserve(mono.len());
        for sample in mono {
            pending.push(crate::audio::mulaw_encode_sample(sample));
        }

        while pending.len() >= SAMPLES_PER_FRAME {
            sink(&pending[..SAMPLES_PER_FRAME]);
            pending.drain(..SAMPLES_PER_FRAME);
        }
    }

    drop(stream);
    tracing::info!("audio capture loop exiting");
    Ok(())
}

/// Downmix interleaved PCM to mono and linear-resample to 8kHz i16.
fn resample_to_mono_8k(samples: &[f32], src_rate: u32, src_channels: u32) -> Vec<i16> {
    let channels = src_channels.max(1) as usize;
    let src_frames = samples.len() / channels;
    if src_frames == 0 {
        return Vec::new();
    }

    let dst_frames = (src_frames as u64 * MULAW_SAMPLE_RATE as u64 / src_rate as u64) as usize;
    let mut output = Vec::with_capacity(dst_frames);

    let mono_at = |frame: usize| -> f32 {
        let base = frame.min(src_frames - 1) * channels;
        let mut acc = 0.0f32;
        for ch in 0..channels {
            acc += samples.get(base + ch).copied().unwrap_or(0.0);
        }
        acc / channels as f32
    };

    for i in 0..dst_frames {
        let src_pos = i as f64 * src_rate as f64 / MULAW_SAMPLE_RATE as f64;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let s0 = mono_at(idx);
        let s1 = mono_at(idx + 1);
        let value = s0 + (s1 - s0) * frac;
        output.push((value.clamp(-1.0, 1.0) * 32_767.0) as i16);
    }

    output
}

// ─── Wallpaper ──────────────────────────────────────────────────────

const GSETTINGS_SCHEMA: &str = "org.gnome.desktop.background";

pub(crate) struct GnomeWallpaperBackend;

impl GnomeWallpaperBackend {
    pub(crate) fn new() -> Self {
        Self
    }

    fn gsettings_get(key: &str) -> Result<String, StreamError> {
        let output = Command::new("gsettings")
            .args(["get", GSETTINGS_SCHEMA, key])
            .output()
            .map_err(|e| StreamError::NotSupported(format!("gsettings unavailable: {e}")))?;
        if !output.status.success() {
            return Err(StreamError::NotSupported(format!(
                "gsettings get {key} failed"
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('\'')
            .to_string())
    }

    fn gsettings_set(key: &str, value: &str) -> Result<(), StreamError> {
        let status = Command::new("gsettings")
            .args(["set", GSETTINGS_SCHEMA, key, value])
            .status()
            .map_err(|e| StreamError::NotSupported(format!("gsettings unavailable: {e}")))?;
        if !status.success() {
            return Err(StreamError::Fatal(format!("gsettings set {key} failed")));
        }
        Ok(())
    }
}

impl WallpaperBackend for GnomeWallpaperBackend {
    fn current(&self) -> Result<WallpaperState, StreamError> {
        Ok(WallpaperState {
            wallpaper_path: Self::gsettings_get("picture-uri")?,
            desktop_env: std::env::var("XDG_CURRENT_DESKTOP").ok(),
            suppressed: false,
        })
    }

    fn set_solid_black(&self) -> Result<(), StreamError> {
        Self::gsettings_set("picture-uri", "")?;
        Self::gsettings_set("primary-color", "#000000")?;
        Ok(())
    }

    fn restore(&self, state: &WallpaperState) -> Result<(), StreamError> {
        Self::gsettings_set("picture-uri", &state.wallpaper_path)
    }
}
