//! Capture capability interface and desktop-switch detection.
//!
//! Platform backends implement [`Capturer`]: a GPU-duplication capturer
//! where the OS offers one, a software blit capturer as the fallback, or a
//! one-shot compositor screenshot backend. The session's capture loop only
//! sees the trait.
//!
//! Secure-desktop handling lives here as well: credential prompts and lock
//! screens run on a separate desktop that GPU duplication cannot render, so
//! the capture loop polls a [`DesktopSwitchMonitor`] and swaps strategies on
//! transitions.

use std::time::{Duration, Instant};

use crate::error::StreamError;

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Bgra,
    Rgba,
}

/// A captured frame: a contiguous pixel buffer where row `y` occupies
/// bytes `[y*stride, y*stride + width*4)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
}

impl Frame {
    pub fn expected_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Opaque handle to a GPU texture produced by a duplication capturer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuTextureHandle {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

/// One capture result: the CPU pixels, plus the GPU texture handle when
/// the backend can feed the encoder's fast path directly.
#[derive(Debug, Clone, PartialEq)]
pub struct Captured {
    pub frame: Frame,
    pub texture: Option<GpuTextureHandle>,
}

impl Captured {
    pub fn cpu(frame: Frame) -> Self {
        Self {
            frame,
            texture: None,
        }
    }
}

/// Screen capture capability, implemented per platform.
///
/// Event-driven backends (GPU duplication) block in `capture` until a dirty
/// frame arrives or `timeout` expires; polling backends return immediately
/// and rely on the caller's ticker for pacing.
pub trait Capturer: Send {
    /// Wait up to `timeout` for the next frame.
    ///
    /// Returns `Transient` on an empty acquire or timeout, `DeviceLost`
    /// when the GPU device needs rebuilding.
    fn capture(&mut self, timeout: Duration) -> Result<Captured, StreamError>;

    /// Capture a sub-rectangle of the display.
    fn capture_region(&mut self, x: i32, y: i32, width: u32, height: u32)
        -> Result<Frame, StreamError>;

    /// Current capture dimensions.
    fn bounds(&self) -> (u32, u32);

    /// Rebuild device state after `DeviceLost`.
    fn reinitialize(&mut self) -> Result<(), StreamError>;

    /// Whether `capture` blocks on the provider (duplication wait) rather
    /// than needing ticker pacing.
    fn is_event_driven(&self) -> bool;

    /// Release all platform resources. Safe to call more than once.
    fn close(&mut self);
}

/// Cursor position capability, independent of the capture pipeline so
/// cursor updates keep streaming while the capturer blocks.
pub trait CursorProvider: Send + Sync {
    /// Absolute cursor position and visibility, if the platform can
    /// report it.
    fn cursor_position(&self) -> Option<(i32, i32, bool)>;
}

// ─── Desktop switch detection ───────────────────────────────────────

/// Reports which desktop the capture thread is bound to and which desktop
/// currently receives input.
pub trait DesktopSwitchNotifier: Send {
    /// Name of the desktop the capture thread is attached to.
    fn current_desktop(&self) -> String;

    /// Name of the desktop currently receiving user input.
    fn input_desktop(&self) -> String;

    /// Re-attach the capture thread to the named desktop.
    fn rebind(&mut self, name: &str) -> Result<(), StreamError>;
}

/// Non-`Default` desktops (login, UAC, lock screen) are secure.
pub fn is_secure_desktop(name: &str) -> bool {
    !name.eq_ignore_ascii_case("default")
}

/// Transition observed between two desktop-switch polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DesktopTransition {
    /// Entered a secure desktop; capture must fall back to software.
    ToSecure { name: String },
    /// Returned to the default desktop; GPU duplication may resume.
    ToDefault,
    /// Still on a default desktop, but a different one; rebind only.
    Rebind { name: String },
}

/// Throttled poll cadence for desktop-switch checks.
pub const DESKTOP_SWITCH_CADENCE: Duration = Duration::from_millis(500);

/// Compares the thread desktop with the active input desktop on a
/// throttled cadence and reports transitions.
pub struct DesktopSwitchMonitor {
    notifier: Box<dyn DesktopSwitchNotifier>,
    cadence: Duration,
    last_check: Instant,
    current: String,
    on_secure: bool,
}

impl DesktopSwitchMonitor {
    pub fn new(notifier: Box<dyn DesktopSwitchNotifier>) -> Self {
        Self::with_cadence(notifier, DESKTOP_SWITCH_CADENCE)
    }

    pub fn with_cadence(notifier: Box<dyn DesktopSwitchNotifier>, cadence: Duration) -> Self {
        let current = notifier.current_desktop();
        let on_secure = is_secure_desktop(&current);
        Self {
            notifier,
            cadence,
            // First poll runs immediately.
            last_check: Instant::now().checked_sub(cadence).unwrap_or_else(Instant::now),
            current,
            on_secure,
        }
    }

    /// Whether the monitor currently believes a secure desktop is active.
    pub fn on_secure_desktop(&self) -> bool {
        self.on_secure
    }

    /// Check for a desktop transition; returns `None` inside the throttle
    /// window or when nothing changed.
    pub fn poll(&mut self) -> Option<DesktopTransition> {
        if self.last_check.elapsed() < self.cadence {
            return None;
        }
        self.last_check = Instant::now();

        let input = self.notifier.input_desktop();
        if input == self.current {
            return None;
        }

        let was_secure = self.on_secure;
        let now_secure = is_secure_desktop(&input);
        self.current = input.clone();
        self.on_secure = now_secure;

        let transition = match (was_secure, now_secure) {
            (false, true) => DesktopTransition::ToSecure { name: input },
            (true, false) => DesktopTransition::ToDefault,
            // Default -> Default with a different handle, or an unlikely
            // secure -> secure hop; either way only a rebind is needed.
            _ => DesktopTransition::Rebind { name: input },
        };

        if let DesktopTransition::ToDefault | DesktopTransition::Rebind { .. } = &transition {
            if let Err(e) = self.notifier.rebind(&self.current) {
                tracing::debug!("desktop rebind failed: {e}");
            }
        }

        Some(transition)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Scriptable notifier: the input desktop is whatever the test last set.
    pub(crate) struct FakeNotifier {
        pub input: Arc<Mutex<String>>,
        pub rebinds: Arc<Mutex<Vec<String>>>,
    }

    impl DesktopSwitchNotifier for FakeNotifier {
        fn current_desktop(&self) -> String {
            "Default".to_string()
        }

        fn input_desktop(&self) -> String {
            self.input.lock().unwrap().clone()
        }

        fn rebind(&mut self, name: &str) -> Result<(), StreamError> {
            self.rebinds.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn monitor(input: &Arc<Mutex<String>>) -> (DesktopSwitchMonitor, Arc<Mutex<Vec<String>>>) {
        let rebinds = Arc::new(Mutex::new(Vec::new()));
        let notifier = FakeNotifier {
            input: Arc::clone(input),
            rebinds: Arc::clone(&rebinds),
        };
        (
            DesktopSwitchMonitor::with_cadence(Box::new(notifier), Duration::ZERO),
            rebinds,
        )
    }

    #[test]
    fn test_classification() {
        assert!(!is_secure_desktop("Default"));
        assert!(!is_secure_desktop("default"));
        assert!(is_secure_desktop("Winlogon"));
        assert!(is_secure_desktop("Screen-saver"));
    }

    #[test]
    fn test_secure_round_trip() {
        let input = Arc::new(Mutex::new("Default".to_string()));
        let (mut monitor, _) = monitor(&input);

        assert_eq!(monitor.poll(), None);
        assert!(!monitor.on_secure_desktop());

        *input.lock().unwrap() = "Winlogon".to_string();
        assert_eq!(
            monitor.poll(),
            Some(DesktopTransition::ToSecure {
                name: "Winlogon".to_string()
            })
        );
        assert!(monitor.on_secure_desktop());
        assert_eq!(monitor.poll(), None); // no repeat while unchanged

        *input.lock().unwrap() = "Default".to_string();
        assert_eq!(monitor.poll(), Some(DesktopTransition::ToDefault));
        assert!(!monitor.on_secure_desktop());
    }

    #[test]
    fn test_default_to_default_rebinds() {
        let input = Arc::new(Mutex::new("Default".to_string()));
        let (mut monitor, rebinds) = monitor(&input);

        *input.lock().unwrap() = "default".to_string();
        assert_eq!(
            monitor.poll(),
            Some(DesktopTransition::Rebind {
                name: "default".to_string()
            })
        );
        assert_eq!(rebinds.lock().unwrap().as_slice(), ["default"]);
    }

    #[test]
    fn test_cadence_throttles_polls() {
        let input = Arc::new(Mutex::new("Default".to_string()));
        let rebinds = Arc::new(Mutex::new(Vec::new()));
        let notifier = FakeNotifier {
            input: Arc::clone(&input),
            rebinds,
        };
        let mut monitor =
            DesktopSwitchMonitor::with_cadence(Box::new(notifier), Duration::from_secs(60));

        // The first poll is allowed immediately; after that the 60s
        // cadence suppresses checks even across a real transition.
        assert_eq!(monitor.poll(), None);
        *input.lock().unwrap() = "Winlogon".to_string();
        assert_eq!(monitor.poll(), None);
        assert!(!monitor.on_secure_desktop());
    }
}
