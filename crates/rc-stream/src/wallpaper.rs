//! Refcounted wallpaper suppression with crash recovery.
//!
//! Streaming sessions blank the wallpaper to cut encode bandwidth; with
//! several concurrent sessions the suppression must be applied on the
//! first suppress and undone on the last restore, never in between. A
//! recovery record is persisted while suppressed so a crashed agent
//! restores the user's wallpaper on next startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::StreamError;

/// Recovery record schema, persisted as `wallpaper_state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallpaperState {
    pub wallpaper_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_env: Option<String>,
    pub suppressed: bool,
}

/// Per-OS wallpaper operations.
pub trait WallpaperBackend: Send {
    /// Read the current wallpaper so it can be restored later.
    fn current(&self) -> Result<WallpaperState, StreamError>;

    fn set_solid_black(&self) -> Result<(), StreamError>;

    fn restore(&self, state: &WallpaperState) -> Result<(), StreamError>;
}

struct ManagerInner {
    refcount: u32,
    saved: Option<WallpaperState>,
    backend: Box<dyn WallpaperBackend>,
}

/// Process-singleton suppression manager; see [`wallpaper_manager`] for the
/// shared instance.
pub struct WallpaperManager {
    inner: Mutex<ManagerInner>,
    state_path: PathBuf,
}

impl WallpaperManager {
    /// Build a manager persisting its recovery record under `data_dir`,
    /// and run crash recovery: a leftover record with `suppressed == true`
    /// means a previous process died mid-suppression, so restore now.
    pub fn new(backend: Box<dyn WallpaperBackend>, data_dir: &Path) -> Self {
        let state_path = data_dir.join("wallpaper_state.json");

        let manager = Self {
            inner: Mutex::new(ManagerInner {
                refcount: 0,
                saved: None,
                backend,
            }),
            state_path,
        };
        manager.recover_from_crash();
        manager
    }

    fn recover_from_crash(&self) {
        let Ok(raw) = fs::read_to_string(&self.state_path) else {
            return;
        };
        let state: WallpaperState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("unreadable wallpaper recovery record: {e}");
                let _ = fs::remove_file(&self.state_path);
                return;
            }
        };

        if state.suppressed {
            tracing::info!("restoring wallpaper left suppressed by a previous run");
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = inner.backend.restore(&state) {
                tracing::warn!("wallpaper crash recovery failed: {e}");
            }
        }
        let _ = fs::remove_file(&self.state_path);
    }

    /// Suppress the wallpaper. Only the 0 -> 1 transition touches the
    /// desktop; failures leave the refcount unchanged.
    pub fn suppress(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.refcount == 0 {
            let mut state = inner.backend.current()?;
            state.suppressed = true;

            self.persist(&state)?;

            if let Err(e) = inner.backend.set_solid_black() {
                let _ = fs::remove_file(&self.state_path);
                return Err(e);
            }
            inner.saved = Some(state);
        }

        inner.refcount += 1;
        tracing::debug!(refcount = inner.refcount, "wallpaper suppressed");
        Ok(())
    }

    /// Undo one suppression. Only the N -> 0 transition restores; calls
    /// with a zero refcount are no-ops.
    pub fn restore(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.refcount == 0 {
            return Ok(());
        }
        inner.refcount -= 1;
        if inner.refcount > 0 {
            return Ok(());
        }

        if let Some(state) = inner.saved.take() {
            inner.backend.restore(&state)?;
        }
        let _ = fs::remove_file(&self.state_path);
        tracing::debug!("wallpaper restored");
        Ok(())
    }

    fn persist(&self, state: &WallpaperState) -> Result<(), StreamError> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StreamError::Fatal(format!("create state dir: {e}")))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(parent, fs::Permissions::from_mode(0o700));
            }
        }

        let json = serde_json::to_string_pretty(state)
            .map_err(|e| StreamError::Fatal(format!("serialize wallpaper state: {e}")))?;
        fs::write(&self.state_path, json)
            .map_err(|e| StreamError::Fatal(format!("write wallpaper state: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.state_path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    /// Whether the recovery record currently exists on disk.
    pub fn record_exists(&self) -> bool {
        self.state_path.exists()
    }

    pub fn refcount(&self) -> u32 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).refcount
    }
}

/// The process-wide manager, initialized once with the platform backend
/// and the agent data directory.
pub fn wallpaper_manager() -> Option<Arc<WallpaperManager>> {
    static MANAGER: OnceLock<Option<Arc<WallpaperManager>>> = OnceLock::new();
    MANAGER
        .get_or_init(|| {
            let backend = crate::platform::default_wallpaper_backend().ok()?;
            let data_dir = dirs::data_local_dir()?.join("remotecast");
            Some(Arc::new(WallpaperManager::new(backend, &data_dir)))
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingBackend {
        blacks: Arc<AtomicU32>,
        restores: Arc<AtomicU32>,
        fail_black: bool,
    }

    impl WallpaperBackend for CountingBackend {
        fn current(&self) -> Result<WallpaperState, StreamError> {
            Ok(WallpaperState {
                wallpaper_path: "/usr/share/backgrounds/default.png".into(),
                desktop_env: Some("gnome".into()),
                suppressed: false,
            })
        }

        fn set_solid_black(&self) -> Result<(), StreamError> {
            if self.fail_black {
                return Err(StreamError::NotSupported("no desktop".into()));
            }
            self.blacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn restore(&self, _state: &WallpaperState) -> Result<(), StreamError> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rc-wallpaper-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn counting_manager(
        dir: &Path,
        fail_black: bool,
    ) -> (WallpaperManager, Arc<AtomicU32>, Arc<AtomicU32>) {
        let blacks = Arc::new(AtomicU32::new(0));
        let restores = Arc::new(AtomicU32::new(0));
        let backend = CountingBackend {
            blacks: Arc::clone(&blacks),
            restores: Arc::clone(&restores),
            fail_black,
        };
        (
            WallpaperManager::new(Box::new(backend), dir),
            blacks,
            restores,
        )
    }

    #[test]
    fn test_refcount_law() {
        let dir = scratch_dir("refcount");
        let (manager, blacks, restores) = counting_manager(&dir, false);

        // k suppresses followed by k restores: exactly one black, one restore.
        for _ in 0..3 {
            manager.suppress().unwrap();
            assert!(manager.record_exists());
        }
        assert_eq!(blacks.load(Ordering::SeqCst), 1);

        for i in (0..3).rev() {
            manager.restore().unwrap();
            assert_eq!(manager.record_exists(), i > 0);
        }
        assert_eq!(restores.load(Ordering::SeqCst), 1);

        // Below-zero restores are no-ops.
        manager.restore().unwrap();
        assert_eq!(restores.load(Ordering::SeqCst), 1);
        assert_eq!(manager.refcount(), 0);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failed_suppress_leaves_no_state() {
        let dir = scratch_dir("fail");
        let (manager, _, _) = counting_manager(&dir, true);

        assert!(manager.suppress().is_err());
        assert_eq!(manager.refcount(), 0);
        assert!(!manager.record_exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_crash_recovery_restores_and_clears() {
        let dir = scratch_dir("recovery");
        let state = WallpaperState {
            wallpaper_path: "/home/user/wall.jpg".into(),
            desktop_env: None,
            suppressed: true,
        };
        fs::write(
            dir.join("wallpaper_state.json"),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();

        let (manager, _, restores) = counting_manager(&dir, false);
        assert_eq!(restores.load(Ordering::SeqCst), 1);
        assert!(!manager.record_exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unsuppressed_record_is_just_cleared() {
        let dir = scratch_dir("stale");
        let state = WallpaperState {
            wallpaper_path: "/home/user/wall.jpg".into(),
            desktop_env: None,
            suppressed: false,
        };
        fs::write(
            dir.join("wallpaper_state.json"),
            serde_json::to_string(&state).unwrap(),
        )
        .unwrap();

        let (manager, _, restores) = counting_manager(&dir, false);
        assert_eq!(restores.load(Ordering::SeqCst), 0);
        assert!(!manager.record_exists());

        fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn test_record_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = scratch_dir("perms");
        let (manager, _, _) = counting_manager(&dir, false);
        manager.suppress().unwrap();

        let mode = fs::metadata(dir.join("wallpaper_state.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        manager.restore().unwrap();
        fs::remove_dir_all(&dir).ok();
    }
}
