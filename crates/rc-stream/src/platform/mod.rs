//! Platform capability providers.
//!
//! Everything OS-specific sits behind the capability traits (`Capturer`,
//! `InputHandler`, `AudioCapturer`, `WallpaperBackend`, `CursorProvider`,
//! `DesktopSwitchNotifier`) and this factory, selected once at startup.
//! Platforms without an implementation return `NotSupported` from the
//! factory instead of sprinkling `cfg` through the core.

#[cfg(target_os = "linux")]
mod linux;

use std::sync::Arc;

use rc_protocol::MonitorInfo;

use crate::audio::AudioCapturer;
use crate::capture::{Capturer, CursorProvider, DesktopSwitchNotifier};
use crate::config::{CaptureConfig, EncoderConfig};
use crate::encoder::HardwareBackend;
use crate::error::StreamError;
use crate::input::InputHandler;
use crate::wallpaper::WallpaperBackend;

/// Constructs the platform's capability providers.
pub trait PlatformFactory: Send + Sync {
    /// Primary capturer for the configured display.
    fn new_capturer(&self, config: &CaptureConfig) -> Result<Box<dyn Capturer>, StreamError>;

    /// Software fallback used on secure desktops and after repeated
    /// acquire timeouts.
    fn new_fallback_capturer(
        &self,
        config: &CaptureConfig,
    ) -> Result<Box<dyn Capturer>, StreamError>;

    fn new_input_handler(&self) -> Result<Box<dyn InputHandler>, StreamError>;

    fn new_audio_capturer(&self) -> Result<Box<dyn AudioCapturer>, StreamError>;

    /// Hardware video transform, when the platform has one.
    fn new_hardware_backend(&self, config: &EncoderConfig) -> Option<Box<dyn HardwareBackend>>;

    fn cursor_provider(&self) -> Option<Box<dyn CursorProvider>>;

    fn desktop_switch_notifier(&self) -> Option<Box<dyn DesktopSwitchNotifier>>;

    /// Whether this platform can observe secure-desktop transitions at all
    /// (drives the `verificationSupported` field of SAS replies).
    fn desktop_switch_supported(&self) -> bool;

    fn enumerate_monitors(&self) -> Result<Vec<MonitorInfo>, StreamError>;

    /// Force a desktop-wide repaint so the first acquire after a monitor
    /// switch has dirty regions. Best effort.
    fn request_desktop_repaint(&self);

    /// Emit the secure attention sequence (Ctrl+Alt+Del).
    fn send_sas(&self) -> Result<(), StreamError>;

    fn lock_workstation(&self) -> Result<(), StreamError>;
}

/// The factory for the current platform.
pub fn default_factory() -> Result<Arc<dyn PlatformFactory>, StreamError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(linux::LinuxFactory::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(StreamError::NotSupported(format!(
            "no platform backend for {}",
            std::env::consts::OS
        )))
    }
}

/// Wallpaper backend for the current platform (consumed by the process
/// wallpaper manager singleton).
pub fn default_wallpaper_backend() -> Result<Box<dyn WallpaperBackend>, StreamError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::GnomeWallpaperBackend::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(StreamError::NotSupported(format!(
            "no wallpaper backend for {}",
            std::env::consts::OS
        )))
    }
}
