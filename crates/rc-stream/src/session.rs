//! Per-viewer streaming session.
//!
//! A session binds one capturer, one encoder, the adaptive controllers,
//! and the media transport together, and runs four workers: the capture
//! loop (a dedicated blocking thread — capture APIs are thread-affine),
//! plus cursor, adaptive, and metrics tickers. Input and control messages
//! arrive on the transport callback thread and communicate with the
//! capture loop through atomic flags only.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use rc_protocol::{
    ControlReply, ControlRequest, CursorUpdate, InputEvent, MAX_BITRATE_BPS, MAX_FPS,
};

use crate::adaptive::{AdaptiveBitrate, AdaptiveQuality};
use crate::audio::{AudioCapturer, AudioSink, AUDIO_FRAME_MS};
use crate::capture::{
    Capturer, CursorProvider, DesktopSwitchMonitor, DesktopTransition, Frame, GpuTextureHandle,
};
use crate::config::{CaptureConfig, EncoderConfig};
use crate::convert::scale_frame;
use crate::encoder::{JpegFrameEncoder, VideoEncoder};
use crate::error::StreamError;
use crate::input::{release_held_input, InputHandler, KeyTracker};
use crate::metrics::StreamMetrics;
use crate::platform::PlatformFactory;
use crate::transport::{
    extract_remote_inbound_video_stats, ChannelMessage, ChannelState, DataChannel, MediaTrack,
    PeerTransport,
};
use crate::wallpaper::WallpaperManager;

/// Duplication wait per capture iteration.
const CAPTURE_WAIT: Duration = Duration::from_millis(100);
/// Consecutive acquire timeouts before falling back to software capture.
const TIMEOUT_FALLBACK_LIMIT: u32 = 50;
/// Unchanged encoded frames before the loop slows its polling.
const IDLE_STREAK_LIMIT: u32 = 30;
/// Extra delay per iteration once idle.
const IDLE_POLL_DELAY: Duration = Duration::from_millis(150);
/// How long SAS verification watches for a secure-desktop transition.
const SAS_VERIFY_WINDOW: Duration = Duration::from_millis(1200);
/// Transport stats poll cadence.
const ADAPTIVE_INTERVAL: Duration = Duration::from_millis(500);
/// Periodic log cadence for metrics and RTCP summaries.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);
/// The cached frame for screenshots is refreshed this often (in frames).
const SNAPSHOT_EVERY: u32 = 30;
/// Bitrate controller floor.
const MIN_BITRATE: u32 = 250_000;
/// Bitrate controller default ceiling (raisable via `set_bitrate`).
const DEFAULT_MAX_BITRATE: u32 = 8_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Capture loop mode. Transitions are returned, never recursed, so rapid
/// toggling (secure desktop flapping) cannot grow the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureMode {
    /// Tight loop driven by the provider's own frame pacing.
    Duplication,
    /// Loop paced by a ticker at the session FPS.
    Ticker,
    Stopped,
}

/// Hook consulted for SAS before falling back to the direct platform API.
pub type SasHook = Arc<dyn Fn() -> bool + Send + Sync>;

/// The session's three data channels.
pub struct SessionChannels {
    pub input: Arc<dyn DataChannel>,
    pub control: Arc<dyn DataChannel>,
    pub cursor: Arc<dyn DataChannel>,
}

/// Everything the signaling layer hands over when a viewer connects.
pub struct SessionParams {
    pub id: String,
    pub capture_config: CaptureConfig,
    pub peer: Arc<dyn PeerTransport>,
    pub video_track: Arc<dyn MediaTrack>,
    pub audio_track: Option<Arc<dyn MediaTrack>>,
    pub channels: SessionChannels,
    pub sas_hook: Option<SasHook>,
}

#[derive(Default)]
struct SessionFlags {
    is_active: AtomicBool,
    audio_enabled: AtomicBool,
    click_flush: AtomicBool,
    input_active: AtomicBool,
    cursor_stream_enabled: AtomicBool,
    capturer_swapped: AtomicBool,
    on_secure_desktop: AtomicBool,
}

struct InputState {
    handler: Box<dyn InputHandler>,
    tracker: KeyTracker,
}

/// Mutable state owned by the capture loop.
pub(crate) struct CaptureState {
    switch_monitor: Option<DesktopSwitchMonitor>,
    consecutive_timeouts: u32,
    idle_streak: u32,
    last_hash: u64,
    last_sample: Instant,
    next_tick: Instant,
    frames_since_snapshot: u32,
}

impl CaptureState {
    pub(crate) fn new(switch_monitor: Option<DesktopSwitchMonitor>) -> Self {
        Self {
            switch_monitor,
            consecutive_timeouts: 0,
            idle_streak: 0,
            last_hash: 0,
            last_sample: Instant::now(),
            next_tick: Instant::now(),
            frames_since_snapshot: 0,
        }
    }
}

pub struct Session {
    id: String,
    factory: Arc<dyn PlatformFactory>,
    wallpaper: Option<Arc<WallpaperManager>>,

    capture_config: Mutex<CaptureConfig>,
    capturer: Mutex<Box<dyn Capturer>>,
    /// Staged by `switch_monitor`; the capture loop swaps it in.
    pending_capturer: Mutex<Option<Box<dyn Capturer>>>,
    /// Replaced capturers awaiting loop-side closure.
    retired_capturers: Mutex<Vec<Box<dyn Capturer>>>,

    input: Mutex<InputState>,
    encoder: Mutex<VideoEncoder>,
    audio: Mutex<Option<Box<dyn AudioCapturer>>>,
    cursor_provider: Option<Arc<dyn CursorProvider>>,

    peer: Arc<dyn PeerTransport>,
    video_track: Arc<dyn MediaTrack>,
    audio_track: Option<Arc<dyn MediaTrack>>,
    channels: SessionChannels,
    sas_hook: Option<SasHook>,

    metrics: Arc<StreamMetrics>,
    bitrate: Mutex<AdaptiveBitrate>,
    quality: Mutex<AdaptiveQuality>,

    flags: SessionFlags,
    fps: AtomicU32,
    /// Origin of the captured monitor; cursor coords are made relative
    /// to it.
    monitor_origin: Mutex<(i32, i32)>,
    /// Recent frame kept for the screenshot path.
    last_frame: Mutex<Option<Frame>>,

    /// Back-reference handed to channel callbacks and worker tasks.
    self_ref: OnceLock<Weak<Session>>,
    started: AtomicBool,
    cleaned: AtomicBool,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Build a cold session. Capturer construction errors surface to the
    /// caller; everything else degrades gracefully at start.
    pub fn new(
        params: SessionParams,
        factory: Arc<dyn PlatformFactory>,
        wallpaper: Option<Arc<WallpaperManager>>,
    ) -> Result<Arc<Self>, StreamError> {
        params.capture_config.validate()?;

        let capturer = factory.new_capturer(&params.capture_config)?;
        let (width, height) = capturer.bounds();
        let input_handler = factory.new_input_handler()?;

        let encoder_config = EncoderConfig::new(width, height);
        let hardware = factory.new_hardware_backend(&encoder_config);
        let fps = encoder_config.fps;
        let initial_bitrate = encoder_config.bitrate;
        let encoder = VideoEncoder::new(encoder_config, hardware);

        let audio = match factory.new_audio_capturer() {
            Ok(capturer) => Some(capturer),
            Err(e) => {
                tracing::debug!("audio capture unavailable: {e}");
                None
            }
        };
        let cursor_provider: Option<Arc<dyn CursorProvider>> =
            factory.cursor_provider().map(Arc::from);

        let monitor_origin = factory
            .enumerate_monitors()
            .ok()
            .and_then(|monitors| {
                monitors
                    .into_iter()
                    .find(|m| m.index == params.capture_config.display_index)
            })
            .map(|m| (m.x, m.y))
            .unwrap_or((0, 0));

        let quality = AdaptiveQuality::new(params.capture_config.quality as u32);

        let session = Arc::new(Self {
            id: params.id,
            factory,
            wallpaper,
            capture_config: Mutex::new(params.capture_config),
            capturer: Mutex::new(capturer),
            pending_capturer: Mutex::new(None),
            retired_capturers: Mutex::new(Vec::new()),
            input: Mutex::new(InputState {
                handler: input_handler,
                tracker: KeyTracker::new(),
            }),
            encoder: Mutex::new(encoder),
            audio: Mutex::new(audio),
            cursor_provider,
            peer: params.peer,
            video_track: params.video_track,
            audio_track: params.audio_track,
            channels: params.channels,
            sas_hook: params.sas_hook,
            metrics: Arc::new(StreamMetrics::new()),
            bitrate: Mutex::new(AdaptiveBitrate::new(
                initial_bitrate,
                MIN_BITRATE,
                DEFAULT_MAX_BITRATE,
                fps,
            )),
            quality: Mutex::new(quality),
            flags: SessionFlags::default(),
            fps: AtomicU32::new(fps),
            monitor_origin: Mutex::new(monitor_origin),
            last_frame: Mutex::new(None),
            self_ref: OnceLock::new(),
            started: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            workers: Mutex::new(Vec::new()),
        });
        let _ = session.self_ref.set(Arc::downgrade(&session));
        session
            .flags
            .cursor_stream_enabled
            .store(true, Ordering::Relaxed);
        Ok(session)
    }

    fn weak(&self) -> Weak<Session> {
        self.self_ref.get().cloned().unwrap_or_default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.flags.is_active.load(Ordering::Relaxed)
    }

    /// Current capture dimensions.
    pub fn bounds(&self) -> (u32, u32) {
        lock(&self.capturer).bounds()
    }

    pub fn metrics(&self) -> Arc<StreamMetrics> {
        Arc::clone(&self.metrics)
    }

    /// JPEG of the most recent frame at the adaptive quality level.
    pub fn screenshot(&self) -> Result<Vec<u8>, StreamError> {
        let frame = lock(&self.last_frame)
            .clone()
            .ok_or_else(|| StreamError::Transient("no frame captured yet".into()))?;
        let quality = lock(&self.quality).quality();
        JpegFrameEncoder::new(quality as u8).encode(&frame)
    }

    /// Start streaming. May be called once; must run inside a tokio
    /// runtime.
    pub fn start(&self) -> Result<(), StreamError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(StreamError::Fatal("session already started".into()));
        }
        let me = self
            .weak()
            .upgrade()
            .ok_or_else(|| StreamError::Fatal("session dropped".into()))?;

        self.flags.is_active.store(true, Ordering::SeqCst);

        if let Some(wallpaper) = &self.wallpaper {
            if let Err(e) = wallpaper.suppress() {
                tracing::warn!("wallpaper suppression failed: {e}");
            }
        }

        // Immediate IDR so the viewer renders the first frame it receives.
        lock(&self.encoder).force_keyframe();

        self.wire_channels();

        let mut workers = lock(&self.workers);

        let capture_session = Arc::clone(&me);
        workers.push(tokio::task::spawn_blocking(move || {
            capture_session.run_capture();
        }));

        let metrics_session = Arc::clone(&me);
        workers.push(tokio::spawn(async move {
            metrics_session.run_metrics().await;
        }));

        let adaptive_session = Arc::clone(&me);
        workers.push(tokio::spawn(async move {
            adaptive_session.run_adaptive().await;
        }));

        if self.cursor_provider.is_some() {
            let cursor_session = Arc::clone(&me);
            workers.push(tokio::spawn(async move {
                cursor_session.run_cursor().await;
            }));
        }
        drop(workers);

        self.start_audio();

        tracing::info!(session = %self.id, "streaming started");
        Ok(())
    }

    fn wire_channels(&self) {
        let weak = self.weak();
        self.channels.input.on_message(Box::new(move |msg| {
            if let Some(session) = weak.upgrade() {
                session.handle_input_message(msg);
            }
        }));

        let weak = self.weak();
        self.channels.control.on_message(Box::new(move |msg| {
            if let Some(session) = weak.upgrade() {
                session.handle_control_message(msg);
            }
        }));
    }

    fn start_audio(&self) {
        let Some(audio_track) = self.audio_track.clone() else {
            return;
        };
        let mut audio = lock(&self.audio);
        let Some(capturer) = audio.as_mut() else {
            return;
        };

        let weak = self.weak();
        let sink: AudioSink = Box::new(move |frame: &[u8]| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            // Toggled off: keep capturing, stop forwarding.
            if !session.flags.audio_enabled.load(Ordering::Relaxed) {
                return;
            }
            let _ = audio_track.write_sample(frame, Duration::from_millis(AUDIO_FRAME_MS));
        });

        if let Err(e) = capturer.start(sink) {
            tracing::warn!("audio capture not started: {e}");
        }
    }

    /// Stop streaming and tear down. Idempotent; later calls are no-ops.
    pub async fn stop(&self) {
        let was_active = self.flags.is_active.swap(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        // Unblock transport-side reads before joining workers.
        self.peer.close();

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            let _ = worker.await;
        }

        self.do_cleanup();
        if was_active {
            tracing::info!(session = %self.id, "session stopped");
        }
    }

    fn do_cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(audio) = lock(&self.audio).as_mut() {
            audio.stop();
        }

        {
            let mut input = lock(&self.input);
            let InputState { handler, tracker } = &mut *input;
            release_held_input(tracker, handler.as_mut());
        }

        self.channels.cursor.close();
        self.channels.input.close();
        self.channels.control.close();

        lock(&self.encoder).close();

        if let Some(mut pending) = lock(&self.pending_capturer).take() {
            pending.close();
        }
        for mut old in lock(&self.retired_capturers).drain(..) {
            old.close();
        }
        lock(&self.capturer).close();

        self.peer.close();

        if let Some(wallpaper) = &self.wallpaper {
            if let Err(e) = wallpaper.restore() {
                tracing::warn!("wallpaper restore failed: {e}");
            }
        }

        tracing::debug!(session = %self.id, "cleanup complete");
    }

    // ─── Capture loop ───────────────────────────────────────────────

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.load(Ordering::Relaxed).max(1) as f64)
    }

    fn run_capture(&self) {
        let mut state = CaptureState::new(
            self.factory
                .desktop_switch_notifier()
                .map(DesktopSwitchMonitor::new),
        );
        let mut mode = if lock(&self.capturer).is_event_driven() {
            CaptureMode::Duplication
        } else {
            CaptureMode::Ticker
        };

        tracing::info!(session = %self.id, ?mode, "capture loop started");
        loop {
            mode = match mode {
                CaptureMode::Duplication => self.capture_iteration(&mut state, true),
                CaptureMode::Ticker => self.capture_iteration(&mut state, false),
                CaptureMode::Stopped => break,
            };
        }
        tracing::info!(session = %self.id, "capture loop stopped");
    }

    /// One capture loop iteration; returns the next mode.
    pub(crate) fn capture_iteration(&self, state: &mut CaptureState, event_driven: bool) -> CaptureMode {
        if !self.flags.is_active.load(Ordering::SeqCst) {
            return CaptureMode::Stopped;
        }

        // A monitor switch must be observed before the new capturer is
        // used; the old one is closed only here, after the swap.
        if self.flags.capturer_swapped.swap(false, Ordering::SeqCst) {
            if let Some(new_capturer) = lock(&self.pending_capturer).take() {
                let old = std::mem::replace(&mut *lock(&self.capturer), new_capturer);
                lock(&self.retired_capturers).push(old);
            }
            for mut old in lock(&self.retired_capturers).drain(..) {
                old.close();
            }
            {
                let mut encoder = lock(&self.encoder);
                encoder.reset_gpu_pipeline();
                encoder.force_keyframe();
            }
            state.idle_streak = 0;
            state.last_hash = 0;
        }

        if self.flags.click_flush.swap(false, Ordering::SeqCst) {
            lock(&self.encoder).flush();
        }

        if self.flags.input_active.swap(false, Ordering::SeqCst) {
            state.idle_streak = 0;
        }

        if let Some(monitor) = state.switch_monitor.as_mut() {
            if let Some(transition) = monitor.poll() {
                self.handle_desktop_transition(transition);
            }
        }

        if !event_driven {
            let now = Instant::now();
            if state.next_tick > now {
                std::thread::sleep(state.next_tick - now);
            }
            state.next_tick = Instant::now() + self.frame_interval();
        }

        let capture_start = Instant::now();
        let result = lock(&self.capturer).capture(CAPTURE_WAIT);
        match result {
            Ok(captured) => {
                state.consecutive_timeouts = 0;
                self.process_frame(
                    state,
                    captured.frame,
                    captured.texture,
                    capture_start.elapsed(),
                );
            }
            Err(e) if e.is_transient() => {
                tracing::debug!("capture retry: {e}");
                state.consecutive_timeouts += 1;
                self.maybe_resend_stale(state);
                if state.consecutive_timeouts >= TIMEOUT_FALLBACK_LIMIT
                    && !self.flags.on_secure_desktop.load(Ordering::Relaxed)
                {
                    self.fall_back_to_software();
                    state.consecutive_timeouts = 0;
                }
            }
            Err(e) if e.is_device_lost() => {
                tracing::warn!("capture device lost, reinitializing: {e}");
                if let Err(e2) = lock(&self.capturer).reinitialize() {
                    tracing::warn!("capture reinit failed: {e2}");
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
            Err(e) => {
                tracing::error!("capture failed: {e}");
                self.flags.is_active.store(false, Ordering::SeqCst);
                return CaptureMode::Stopped;
            }
        }

        if state.idle_streak >= IDLE_STREAK_LIMIT {
            std::thread::sleep(IDLE_POLL_DELAY);
        }

        if lock(&self.capturer).is_event_driven() {
            CaptureMode::Duplication
        } else {
            CaptureMode::Ticker
        }
    }

    fn process_frame(
        &self,
        state: &mut CaptureState,
        mut frame: Frame,
        texture: Option<GpuTextureHandle>,
        capture_elapsed: Duration,
    ) {
        self.metrics.record_capture(capture_elapsed);

        let scale_factor = lock(&self.capture_config).scale_factor;
        if scale_factor < 1.0 {
            let scale_start = Instant::now();
            if let Some(scaled) = scale_frame(&frame, scale_factor) {
                frame = scaled;
            }
            self.metrics.record_scale(scale_start.elapsed());
        }

        state.frames_since_snapshot += 1;
        if state.frames_since_snapshot >= SNAPSHOT_EVERY || lock(&self.last_frame).is_none() {
            *lock(&self.last_frame) = Some(frame.clone());
            state.frames_since_snapshot = 0;
        }

        let encode_start = Instant::now();
        let encoded = {
            let mut encoder = lock(&self.encoder);
            match texture.filter(|_| encoder.gpu_input_enabled()) {
                Some(tex) => match encoder.encode_texture(&tex) {
                    Ok(encoded) => Ok(encoded),
                    // The facade counts the failure; the frame still goes
                    // out through the CPU path.
                    Err(_) => encoder.encode(&frame),
                },
                None => encoder.encode(&frame),
            }
        };
        let encode_elapsed = encode_start.elapsed();

        match encoded {
            Ok(Some(bytes)) => {
                self.metrics.record_encode(encode_elapsed, bytes.len());

                let mut hasher = DefaultHasher::new();
                hasher.write(&bytes);
                let hash = hasher.finish();
                if hash == state.last_hash {
                    state.idle_streak += 1;
                } else {
                    state.idle_streak = 0;
                    state.last_hash = hash;
                }

                match self.video_track.write_sample(&bytes, self.frame_interval()) {
                    Ok(()) => {
                        self.metrics.record_sent(bytes.len());
                        lock(&self.quality).record_frame(encode_elapsed, bytes.len(), false);
                        state.last_sample = Instant::now();
                    }
                    Err(e) => {
                        tracing::debug!("track write failed: {e}");
                        self.metrics.record_drop();
                        lock(&self.quality).record_frame(encode_elapsed, bytes.len(), true);
                    }
                }
            }
            Ok(None) => self.metrics.record_skip(),
            Err(e) => {
                tracing::debug!("encode failed: {e}");
                self.metrics.record_drop();
                lock(&self.quality).record_frame(encode_elapsed, 0, true);
            }
        }
    }

    /// During secure-desktop quiet periods, replay the cached encoded
    /// frame at the target FPS so the viewer's decoder stays alive.
    fn maybe_resend_stale(&self, state: &mut CaptureState) {
        if !self.flags.on_secure_desktop.load(Ordering::Relaxed) {
            return;
        }
        if state.last_sample.elapsed() <= self.frame_interval() {
            return;
        }
        let cached = lock(&self.encoder)
            .last_encoded_frame()
            .map(|bytes| bytes.to_vec());
        if let Some(bytes) = cached {
            if self
                .video_track
                .write_sample(&bytes, self.frame_interval())
                .is_ok()
            {
                self.metrics.record_sent(bytes.len());
                state.last_sample = Instant::now();
            }
        }
    }

    fn fall_back_to_software(&self) {
        let config = lock(&self.capture_config).clone();
        match self.factory.new_fallback_capturer(&config) {
            Ok(fallback) => {
                tracing::warn!("acquire starved; switching to software capture");
                let mut old = std::mem::replace(&mut *lock(&self.capturer), fallback);
                old.close();
            }
            Err(e) => tracing::warn!("software capture fallback unavailable: {e}"),
        }
    }

    fn handle_desktop_transition(&self, transition: DesktopTransition) {
        match transition {
            DesktopTransition::ToSecure { name } => {
                tracing::warn!(desktop = %name, "secure desktop entered");
                self.flags.on_secure_desktop.store(true, Ordering::SeqCst);

                let config = lock(&self.capture_config).clone();
                match self.factory.new_fallback_capturer(&config) {
                    Ok(fallback) => {
                        let mut old = std::mem::replace(&mut *lock(&self.capturer), fallback);
                        old.close();
                    }
                    Err(e) => tracing::warn!("secure-desktop capture fallback failed: {e}"),
                }

                // Credential providers render lazily; a tiny pointer
                // wiggle makes them paint.
                lock(&self.input).handler.jiggle_pointer();

                let (width, height) = self.bounds();
                self.send_control_reply(&ControlReply::DesktopSwitch {
                    secure: true,
                    width,
                    height,
                });
            }
            DesktopTransition::ToDefault => {
                tracing::info!("returned to default desktop");
                self.flags.on_secure_desktop.store(false, Ordering::SeqCst);

                let config = lock(&self.capture_config).clone();
                match self.factory.new_capturer(&config) {
                    Ok(primary) => {
                        let mut old = std::mem::replace(&mut *lock(&self.capturer), primary);
                        old.close();
                        lock(&self.encoder).reset_gpu_pipeline();
                    }
                    // Stay on the software path; it still produces frames.
                    Err(e) => tracing::warn!("primary capture reinit failed: {e}"),
                }
                lock(&self.encoder).force_keyframe();

                let (width, height) = self.bounds();
                self.send_control_reply(&ControlReply::DesktopSwitch {
                    secure: false,
                    width,
                    height,
                });
            }
            DesktopTransition::Rebind { name } => {
                tracing::debug!(desktop = %name, "rebound to new default desktop");
            }
        }
    }

    // ─── Cursor loop ────────────────────────────────────────────────

    async fn run_cursor(&self) {
        let Some(provider) = self.cursor_provider.clone() else {
            return;
        };
        let mut last: Option<(i32, i32, bool)> = None;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if !self.flags.is_active.load(Ordering::Relaxed) {
                return;
            }
            let interval = if self.flags.cursor_stream_enabled.load(Ordering::Relaxed) {
                Duration::from_millis(1000 / 120)
            } else {
                Duration::from_millis(250)
            };
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }

            let Some((abs_x, abs_y, visible)) = provider.cursor_position() else {
                continue;
            };
            let (origin_x, origin_y) = *lock(&self.monitor_origin);
            let position = (abs_x - origin_x, abs_y - origin_y, visible);
            if last == Some(position) {
                continue;
            }
            last = Some(position);

            if self.channels.cursor.ready_state() != ChannelState::Open {
                continue;
            }
            let update = CursorUpdate {
                x: position.0,
                y: position.1,
                v: visible as u8,
            };
            if let Ok(json) = serde_json::to_string(&update) {
                let _ = self.channels.cursor.send_text(&json);
            }
        }
    }

    // ─── Adaptive loop ──────────────────────────────────────────────

    async fn run_adaptive(&self) {
        let mut ticks: u32 = 0;
        let summary_every = (SUMMARY_INTERVAL.as_millis() / ADAPTIVE_INTERVAL.as_millis()) as u32;
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if !self.flags.is_active.load(Ordering::Relaxed) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(ADAPTIVE_INTERVAL) => {}
                _ = shutdown.changed() => return,
            }
            if !self.flags.is_active.load(Ordering::Relaxed) {
                return;
            }

            let report = self.peer.get_stats();
            let Some(stats) = extract_remote_inbound_video_stats(&report) else {
                continue;
            };

            let update = {
                let mut bitrate = lock(&self.bitrate);
                bitrate.record_sample(stats.rtt, stats.fraction_lost);
                bitrate.adjust()
            };
            if let Some(update) = update {
                if let Err(e) = lock(&self.encoder).set_bitrate(update.bitrate) {
                    tracing::debug!("bitrate apply failed: {e}");
                }
                self.fps.store(update.fps, Ordering::Relaxed);
            }

            ticks += 1;
            if ticks % summary_every.max(1) == 0 {
                let (current_bitrate, current_fps) = {
                    let bitrate = lock(&self.bitrate);
                    (bitrate.current_bitrate(), bitrate.current_fps())
                };
                tracing::info!(
                    rtt_ms = stats.rtt.as_secs_f64() * 1000.0,
                    fraction_lost = stats.fraction_lost,
                    bitrate = current_bitrate,
                    fps = current_fps,
                    "rtcp summary"
                );
            }
        }
    }

    // ─── Metrics loop ───────────────────────────────────────────────

    async fn run_metrics(&self) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if !self.flags.is_active.load(Ordering::Relaxed) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(SUMMARY_INTERVAL) => {}
                _ = shutdown.changed() => return,
            }
            if !self.flags.is_active.load(Ordering::Relaxed) {
                return;
            }

            self.metrics.set_quality(lock(&self.quality).quality());
            let snap = self.metrics.snapshot();
            tracing::info!(
                captured = snap.frames_captured,
                encoded = snap.frames_encoded,
                sent = snap.frames_sent,
                skipped = snap.frames_skipped,
                dropped = snap.frames_dropped,
                bandwidth_kbps = snap.bandwidth_kbps,
                capture_ms = snap.last_capture_ms,
                encode_ms = snap.last_encode_ms,
                quality = snap.current_quality,
                "stream metrics"
            );
        }
    }

    // ─── Input / control handlers (transport callback thread) ──────

    fn handle_input_message(&self, msg: ChannelMessage) {
        if !self.flags.is_active.load(Ordering::Relaxed) {
            return;
        }
        let text = match msg {
            ChannelMessage::Text(text) => text,
            ChannelMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        };
        let event: InputEvent = match serde_json::from_str(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("bad input event: {e}");
                return;
            }
        };
        self.dispatch_input(&event);
    }

    pub(crate) fn dispatch_input(&self, event: &InputEvent) {
        self.flags.input_active.store(true, Ordering::SeqCst);
        if matches!(event, InputEvent::MouseDown { .. }) {
            // Clicks deserve an immediately coherent frame.
            self.flags.click_flush.store(true, Ordering::SeqCst);
        }

        let mut input = lock(&self.input);
        input.tracker.observe(event);
        if let Err(e) = input.handler.handle(event) {
            tracing::debug!("input injection failed: {e}");
        }
    }

    fn handle_control_message(&self, msg: ChannelMessage) {
        if !self.flags.is_active.load(Ordering::Relaxed) {
            return;
        }
        let text = match msg {
            ChannelMessage::Text(text) => text,
            ChannelMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        };
        match serde_json::from_str::<ControlRequest>(&text) {
            Ok(request) => self.handle_control(request),
            Err(e) => tracing::debug!("bad control message: {e}"),
        }
    }

    pub(crate) fn handle_control(&self, request: ControlRequest) {
        match request {
            ControlRequest::SetBitrate { value } => {
                let capped = value.min(MAX_BITRATE_BPS);
                lock(&self.bitrate).set_max_bitrate(capped);
                tracing::info!(bitrate = capped, "bitrate ceiling updated");
            }
            ControlRequest::SetFps { value } => {
                let fps = value.clamp(1, MAX_FPS);
                self.fps.store(fps, Ordering::Relaxed);
                lock(&self.bitrate).set_max_fps(fps);
                if let Err(e) = lock(&self.encoder).set_fps(fps) {
                    tracing::warn!("fps apply failed: {e}");
                }
            }
            ControlRequest::RequestKeyframe => {
                lock(&self.encoder).force_keyframe();
            }
            ControlRequest::ToggleAudio { value } => {
                self.flags.audio_enabled.store(value != 0, Ordering::SeqCst);
                tracing::info!(enabled = value != 0, "audio toggled");
            }
            ControlRequest::ListMonitors => match self.factory.enumerate_monitors() {
                Ok(monitors) => {
                    self.send_control_reply(&ControlReply::Monitors { monitors });
                }
                Err(e) => tracing::warn!("monitor enumeration failed: {e}"),
            },
            ControlRequest::SendSas => self.handle_send_sas(),
            ControlRequest::LockWorkstation => {
                let result = self.factory.lock_workstation();
                self.send_control_reply(&ControlReply::LockResult {
                    ok: result.is_ok(),
                    error: result.err().map(|e| e.to_string()),
                });
            }
            ControlRequest::SwitchMonitor { value } => self.handle_switch_monitor(value),
        }
    }

    fn handle_switch_monitor(&self, index: u32) {
        let mut config = lock(&self.capture_config).clone();
        config.display_index = index;

        let new_capturer = match self.factory.new_capturer(&config) {
            Ok(capturer) => capturer,
            Err(e) => {
                tracing::warn!(index, "monitor switch failed: {e}");
                return;
            }
        };
        let (width, height) = new_capturer.bounds();

        *lock(&self.capture_config) = config;

        if let Ok(monitors) = self.factory.enumerate_monitors() {
            if let Some(monitor) = monitors.into_iter().find(|m| m.index == index) {
                *lock(&self.monitor_origin) = (monitor.x, monitor.y);
            }
        }

        // Give the first acquire on the new output dirty regions.
        self.factory.request_desktop_repaint();

        *lock(&self.pending_capturer) = Some(new_capturer);
        self.flags.capturer_swapped.store(true, Ordering::SeqCst);

        self.send_control_reply(&ControlReply::MonitorSwitched {
            index,
            width,
            height,
        });
        tracing::info!(index, width, height, "monitor switch staged");
    }

    fn handle_send_sas(&self) {
        // Verification watches for the secure-desktop transition for up
        // to 1.2s; that cannot happen on the callback thread.
        let weak = self.weak();
        std::thread::spawn(move || {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let verification_supported = session.factory.desktop_switch_supported();

            let mut ok = false;
            let mut error = None;
            if let Some(hook) = &session.sas_hook {
                ok = hook();
            }
            if !ok {
                match session.factory.send_sas() {
                    Ok(()) => ok = true,
                    Err(e) => error = Some(e.to_string()),
                }
            }

            let mut verified = false;
            if ok && verification_supported {
                let deadline = Instant::now() + SAS_VERIFY_WINDOW;
                while Instant::now() < deadline {
                    if session.flags.on_secure_desktop.load(Ordering::Relaxed) {
                        verified = true;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }

            let warning = (ok && verification_supported && !verified)
                .then(|| "secure desktop transition not observed".to_string());

            session.send_control_reply(&ControlReply::SasResult {
                ok,
                verification_supported,
                verified,
                warning,
                error,
            });
        });
    }

    fn send_control_reply(&self, reply: &ControlReply) {
        if self.channels.control.ready_state() != ChannelState::Open {
            return;
        }
        match serde_json::to_string(reply) {
            Ok(json) => {
                if let Err(e) = self.channels.control.send_text(&json) {
                    tracing::debug!("control reply send failed: {e}");
                }
            }
            Err(e) => tracing::debug!("control reply encode failed: {e}"),
        }
    }
}
