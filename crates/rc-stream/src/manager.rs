//! Keyed session registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::StreamError;
use crate::platform::PlatformFactory;
use crate::session::{SasHook, Session, SessionParams};
use crate::wallpaper::WallpaperManager;

/// Owns every live streaming session, keyed by session id.
pub struct SessionManager {
    factory: Arc<dyn PlatformFactory>,
    wallpaper: Option<Arc<WallpaperManager>>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    sas_hook: Mutex<Option<SasHook>>,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn PlatformFactory>, wallpaper: Option<Arc<WallpaperManager>>) -> Self {
        Self {
            factory,
            wallpaper,
            sessions: Mutex::new(HashMap::new()),
            sas_hook: Mutex::new(None),
        }
    }

    /// Register the service-IPC hook consulted for SAS requests before
    /// the direct platform API.
    pub fn set_sas_hook(&self, hook: SasHook) {
        *self.sas_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    /// Start a session, replacing (and stopping) any session with the
    /// same key. Returns the capture bounds of the new session.
    pub async fn start_session(&self, mut params: SessionParams) -> Result<(u32, u32), StreamError> {
        let key = params.id.clone();

        let previous = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        if let Some(previous) = previous {
            tracing::info!(session = %key, "replacing existing session");
            previous.stop().await;
        }

        if params.sas_hook.is_none() {
            params.sas_hook = self
                .sas_hook
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
        }

        let session = Session::new(params, Arc::clone(&self.factory), self.wallpaper.clone())?;
        let bounds = session.bounds();
        session.start()?;

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, session);
        Ok(bounds)
    }

    pub async fn stop_session(&self, key: &str) {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if let Some(session) = session {
            session.stop().await;
        }
    }

    pub async fn stop_all_sessions(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.stop().await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::session::SessionChannels;
    use crate::testutil::{MockChannel, MockFactory, MockPeer, MockTrack};
    use std::sync::atomic::Ordering;

    fn params(id: &str) -> SessionParams {
        SessionParams {
            id: id.to_string(),
            capture_config: CaptureConfig::default(),
            peer: MockPeer::new(),
            video_track: MockTrack::new(),
            audio_track: None,
            channels: SessionChannels {
                input: MockChannel::open(),
                control: MockChannel::open(),
                cursor: MockChannel::open(),
            },
            sas_hook: None,
        }
    }

    #[tokio::test]
    async fn test_start_returns_bounds_and_registers() {
        let factory = Arc::new(MockFactory::new());
        let manager = SessionManager::new(factory, None);

        let bounds = manager.start_session(params("s1")).await.unwrap();
        assert_eq!(bounds, (64, 48));
        assert_eq!(manager.active_count(), 1);
        assert!(manager.get("s1").is_some());

        manager.stop_all_sessions().await;
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_same_key_replaces_previous_session() {
        let factory = Arc::new(MockFactory::new());
        let manager = SessionManager::new(Arc::clone(&factory) as Arc<dyn PlatformFactory>, None);

        manager.start_session(params("viewer")).await.unwrap();
        let first = manager.get("viewer").unwrap();

        manager.start_session(params("viewer")).await.unwrap();
        assert_eq!(manager.active_count(), 1);
        assert!(!first.is_active());

        // The first session's capturer was closed by the replacement.
        let closes = factory.capturer_closes.lock().unwrap();
        assert_eq!(closes[0].load(Ordering::SeqCst), 1);

        manager.stop_all_sessions().await;
    }

    #[tokio::test]
    async fn test_stop_session_is_keyed() {
        let factory = Arc::new(MockFactory::new());
        let manager = SessionManager::new(factory, None);

        manager.start_session(params("a")).await.unwrap();
        manager.start_session(params("b")).await.unwrap();
        assert_eq!(manager.active_count(), 2);

        manager.stop_session("a").await;
        assert_eq!(manager.active_count(), 1);
        assert!(manager.get("a").is_none());
        assert!(manager.get("b").is_some());

        // Stopping an unknown key is a no-op.
        manager.stop_session("missing").await;
        assert_eq!(manager.active_count(), 1);

        manager.stop_all_sessions().await;
    }

    #[tokio::test]
    async fn test_bad_display_surfaces_error() {
        let factory = Arc::new(MockFactory::new());
        let manager = SessionManager::new(factory, None);

        let mut bad = params("bad");
        bad.capture_config.display_index = 7;
        assert!(matches!(
            manager.start_session(bad).await,
            Err(StreamError::DisplayNotFound(7))
        ));
        assert_eq!(manager.active_count(), 0);
    }
}
