//! Camera registry: every session, keyed by id, plus the active camera.
//!
//! The registry is an ordinary value built by whoever owns the process and handed out by
//! reference (or through [`CameraHandle`]). Map and active-id locks are only ever held for
//! lookups; starting and stopping a session happens outside them, so one slow camera never
//! holds up another.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backend::Backends;
use crate::config::{CameraConfig, CameraId, SessionTimings};
use crate::frame::Frame;
use crate::session::{CameraInfo, CameraSession, FrameCallback};
use crate::{OurError, OurResult};

/// How long live-view consumers wait before polling an empty camera again
pub const LIVE_VIEW_POLL: Duration = Duration::from_millis(100);

pub struct CameraRegistry {
    backends: Backends,
    timings: SessionTimings,
    sessions: RwLock<HashMap<CameraId, Arc<CameraSession>>>,
    active: RwLock<Option<CameraId>>,
}

impl CameraRegistry {
    pub fn new(backends: Backends, timings: SessionTimings) -> Self {
        info!("Camera registry using backends {:?}", backends.names());
        Self {
            backends,
            timings,
            sessions: RwLock::default(),
            active: RwLock::default(),
        }
    }

    fn sessions_read(&self) -> RwLockReadGuard<'_, HashMap<CameraId, Arc<CameraSession>>> {
        self.sessions.read().unwrap_or_else(|e| {
            error!("Camera registry sessions lock poisoned: {e}");
            e.into_inner()
        })
    }

    fn sessions_write(&self) -> RwLockWriteGuard<'_, HashMap<CameraId, Arc<CameraSession>>> {
        self.sessions.write().unwrap_or_else(|e| {
            error!("Camera registry sessions lock poisoned: {e}");
            e.into_inner()
        })
    }

    fn active_read(&self) -> RwLockReadGuard<'_, Option<CameraId>> {
        self.active.read().unwrap_or_else(|e| {
            error!("Camera registry active lock poisoned: {e}");
            e.into_inner()
        })
    }

    fn active_write(&self) -> RwLockWriteGuard<'_, Option<CameraId>> {
        self.active.write().unwrap_or_else(|e| {
            error!("Camera registry active lock poisoned: {e}");
            e.into_inner()
        })
    }

    fn session(&self, id: &CameraId) -> OurResult<Arc<CameraSession>> {
        self.sessions_read()
            .get(id)
            .cloned()
            .ok_or_else(|| OurError::CameraNotFound(id.clone()))
    }

    /// Register a camera. The first camera registered becomes the active one.
    ///
    /// An existing session under the same id is stopped and then replaced. A blank stream
    /// address can never name a device and is refused.
    pub fn add(&self, config: CameraConfig) -> OurResult<()> {
        if let CameraId::Address(address) = &config.id {
            if address.trim().is_empty() {
                return Err(OurError::Configuration(
                    "camera address must not be empty".to_string(),
                ));
            }
        }
        let id = config.id.clone();
        let camera_type = config.camera_type.clone();
        let session = Arc::new(CameraSession::new(
            config,
            self.backends.clone(),
            self.timings,
        ));

        let previous = {
            let mut sessions = self.sessions_write();
            let previous = sessions.insert(id.clone(), session);
            let mut active = self.active_write();
            if active.is_none() {
                *active = Some(id.clone());
            }
            previous
        };

        if let Some(previous) = previous {
            if previous.is_streaming() {
                warn!("Camera {id} replaced while streaming, stopping the old session");
            }
            previous.stop();
        }

        info!("Camera {id} added ({camera_type})");
        Ok(())
    }

    /// Start a camera and make it the active one
    pub fn start(&self, id: &CameraId) -> OurResult<()> {
        let session = self.session(id)?;
        session.start()?;

        let sessions = self.sessions_read();
        // a concurrent remove() may have taken it out meanwhile
        if sessions
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            *self.active_write() = Some(id.clone());
        }
        Ok(())
    }

    pub fn stop(&self, id: &CameraId) -> OurResult<()> {
        self.session(id)?.stop();
        Ok(())
    }

    /// Install or clear the per-frame callback of `id`. Replacing the camera with `add`
    /// drops it.
    pub fn set_frame_callback(
        &self,
        id: &CameraId,
        callback: Option<FrameCallback>,
    ) -> OurResult<()> {
        self.session(id)?.set_frame_callback(callback);
        Ok(())
    }

    pub fn stop_all(&self) {
        let sessions: Vec<Arc<CameraSession>> = self.sessions_read().values().cloned().collect();
        info!("Stopping {} cameras", sessions.len());
        for session in sessions {
            session.stop();
        }
    }

    /// Stop a camera and forget it
    pub fn remove(&self, id: &CameraId) -> OurResult<()> {
        let session = {
            let mut sessions = self.sessions_write();
            let session = sessions
                .remove(id)
                .ok_or_else(|| OurError::CameraNotFound(id.clone()))?;
            let mut active = self.active_write();
            if active.as_ref() == Some(id) {
                *active = None;
            }
            session
        };
        session.stop();
        info!("Camera {id} removed");
        Ok(())
    }

    pub fn active_id(&self) -> Option<CameraId> {
        self.active_read().clone()
    }

    /// Copy of the active camera's newest frame
    pub fn active_frame(&self) -> Option<Frame> {
        let id = self.active_id()?;
        self.session(&id).ok()?.snapshot()
    }

    /// Copy of the newest frame of `id`, or of the active camera when `id` is `None`
    pub fn snapshot(&self, id: Option<&CameraId>) -> Option<Frame> {
        let id = match id {
            Some(id) => id.clone(),
            None => self.active_id()?,
        };
        let frame = self.session(&id).ok()?.snapshot();
        if frame.is_none() {
            debug!("No frame available from camera {id}");
        }
        frame
    }

    /// Registered camera ids, sorted
    pub fn list(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = self.sessions_read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn info(&self, id: &CameraId) -> OurResult<CameraInfo> {
        Ok(self.session(id)?.info())
    }

    pub fn add_camera(
        &self,
        id: impl Into<CameraId>,
        camera_type: &str,
        width: u32,
        height: u32,
        fps: u32,
    ) -> bool {
        match self.add(CameraConfig::new(id, camera_type, width, height, fps)) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to add camera: {e}");
                false
            }
        }
    }

    pub fn start_camera(&self, id: &CameraId) -> bool {
        match self.start(id) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to start camera {id}: {e}");
                false
            }
        }
    }

    pub fn stop_camera(&self, id: &CameraId) {
        if let Err(e) = self.stop(id) {
            warn!("Failed to stop camera {id}: {e}");
        }
    }

    pub fn stop_all_cameras(&self) {
        self.stop_all();
    }

    pub fn camera_info(&self, id: &CameraId) -> Option<CameraInfo> {
        self.info(id).ok()
    }
}

/// Handle for driving a [`CameraRegistry`] from async code.
///
/// Starting and stopping block for as long as the open and stop timeouts allow, so those
/// calls run on tokio's blocking pool. Frame reads never block and stay synchronous.
#[derive(Clone)]
pub struct CameraHandle {
    registry: Arc<CameraRegistry>,
}

impl CameraHandle {
    pub fn new(registry: CameraRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &CameraRegistry {
        &self.registry
    }

    async fn blocking<T, F>(&self, operation: F) -> OurResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&CameraRegistry) -> OurResult<T> + Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || operation(&registry))
            .await
            .map_err(|e| OurError::App(format!("Camera registry task failed: {e}")))?
    }

    pub async fn add(&self, config: CameraConfig) -> OurResult<()> {
        self.blocking(move |registry| registry.add(config)).await
    }

    pub async fn start(&self, id: CameraId) -> OurResult<()> {
        self.blocking(move |registry| registry.start(&id)).await
    }

    pub async fn stop(&self, id: CameraId) -> OurResult<()> {
        self.blocking(move |registry| registry.stop(&id)).await
    }

    pub async fn stop_all(&self) -> OurResult<()> {
        self.blocking(|registry| {
            registry.stop_all();
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, id: CameraId) -> OurResult<()> {
        self.blocking(move |registry| registry.remove(&id)).await
    }

    pub fn active_frame(&self) -> Option<Frame> {
        self.registry.active_frame()
    }

    pub fn set_frame_callback(
        &self,
        id: &CameraId,
        callback: Option<FrameCallback>,
    ) -> OurResult<()> {
        self.registry.set_frame_callback(id, callback)
    }

    pub fn snapshot(&self, id: Option<&CameraId>) -> Option<Frame> {
        self.registry.snapshot(id)
    }

    pub fn info(&self, id: &CameraId) -> OurResult<CameraInfo> {
        self.registry.info(id)
    }

    pub fn list(&self) -> Vec<CameraId> {
        self.registry.list()
    }

    /// Poll for a frame the way the live view does, giving up after `timeout`
    pub async fn wait_for_frame(&self, id: Option<&CameraId>, timeout: Duration) -> Option<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.registry.snapshot(id) {
                return Some(frame);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(LIVE_VIEW_POLL.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SyntheticBackend, SyntheticOptions};
    use std::thread;
    use std::time::Instant;

    fn registry(options: SyntheticOptions) -> CameraRegistry {
        CameraRegistry::new(
            Backends::synthetic(SyntheticBackend::new(options)),
            SessionTimings {
                read_retry: Duration::from_millis(10),
                stop_timeout: Duration::from_millis(300),
                open_timeout: Duration::from_secs(2),
            },
        )
    }

    fn wait_for_active(registry: &CameraRegistry) -> Option<Frame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(frame) = registry.active_frame() {
                return Some(frame);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_empty_registry() {
        let registry = registry(SyntheticOptions::default());
        assert!(registry.active_id().is_none());
        assert!(registry.active_frame().is_none());
        assert!(registry.snapshot(None).is_none());
        assert!(registry.list().is_empty());
        let missing = CameraId::Index(4);
        assert!(matches!(
            registry.start(&missing),
            Err(OurError::CameraNotFound(_))
        ));
        assert!(!registry.start_camera(&missing));
        assert!(registry.camera_info(&missing).is_none());
    }

    #[test]
    fn test_blank_address_is_refused() {
        let registry = registry(SyntheticOptions::default());
        assert!(!registry.add_camera("", "ip", 640, 480, 30));
        assert!(matches!(
            registry.add(CameraConfig::new("  ", "ip", 640, 480, 30)),
            Err(OurError::Configuration(_))
        ));
        assert!(registry.list().is_empty());
        assert!(registry.active_id().is_none());
    }

    #[test]
    fn test_frame_callback_follows_the_camera() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let registry = registry(SyntheticOptions::default());
        let id = CameraId::Index(0);
        let missing = CameraId::Index(7);
        assert!(matches!(
            registry.set_frame_callback(&missing, None),
            Err(OurError::CameraNotFound(_))
        ));

        registry.add_camera(0u32, "usb", 32, 24, 60);
        let latest = Arc::new(AtomicU64::new(0));
        let sink = latest.clone();
        registry
            .set_frame_callback(
                &id,
                Some(Arc::new(move |frame: &Frame| {
                    sink.store(frame.sequence(), Ordering::SeqCst);
                })),
            )
            .expect("registered");
        assert!(registry.start_camera(&id));
        assert!(wait_for_active(&registry).is_some());
        thread::sleep(Duration::from_millis(50));
        assert!(latest.load(Ordering::SeqCst) > 0);
        registry.stop_all();
    }

    #[test]
    fn test_first_added_becomes_active() {
        let registry = registry(SyntheticOptions::default());
        assert!(registry.add_camera(1u32, "usb", 32, 24, 60));
        assert!(registry.add_camera(0u32, "usb", 32, 24, 60));
        assert_eq!(registry.active_id(), Some(CameraId::Index(1)));
        assert_eq!(registry.list(), vec![CameraId::Index(0), CameraId::Index(1)]);
        // registered but not started
        assert!(registry.active_frame().is_none());
    }

    #[test]
    fn test_failed_start_keeps_active() {
        let registry = registry(SyntheticOptions::default());
        registry.add_camera(0u32, "usb", 32, 24, 60);
        registry.add_camera(1u32, "firewire", 32, 24, 60);
        assert!(registry.start_camera(&CameraId::Index(0)));
        assert!(!registry.start_camera(&CameraId::Index(1)));
        assert_eq!(registry.active_id(), Some(CameraId::Index(0)));
        assert!(wait_for_active(&registry).is_some());
        registry.stop_all();
    }

    #[test]
    fn test_replacing_a_streaming_camera_stops_it() {
        let backend = SyntheticBackend::default();
        let registry = CameraRegistry::new(
            Backends::synthetic(backend.clone()),
            SessionTimings::default(),
        );
        registry.add_camera(0u32, "usb", 32, 24, 60);
        assert!(registry.start_camera(&CameraId::Index(0)));
        assert_eq!(backend.open_devices(), 1);

        registry.add_camera(0u32, "usb", 64, 48, 60);
        assert_eq!(backend.open_devices(), 0);
        let info = registry
            .camera_info(&CameraId::Index(0))
            .expect("replacement registered");
        assert!(!info.streaming);
        assert_eq!(info.resolution, "64x48");
    }

    #[test]
    fn test_remove_clears_active() {
        let registry = registry(SyntheticOptions::default());
        registry.add_camera(0u32, "usb", 32, 24, 60);
        registry.start_camera(&CameraId::Index(0));
        registry.remove(&CameraId::Index(0)).expect("registered");
        assert!(registry.active_id().is_none());
        assert!(registry.active_frame().is_none());
        assert!(matches!(
            registry.remove(&CameraId::Index(0)),
            Err(OurError::CameraNotFound(_))
        ));
    }

    #[test]
    fn test_stopped_sessions_stay_registered() {
        let registry = registry(SyntheticOptions::default());
        let id = CameraId::Index(0);
        registry.add_camera(0u32, "usb", 32, 24, 60);
        registry.start_camera(&id);
        registry.stop_camera(&id);
        assert_eq!(registry.list(), vec![id.clone()]);
        assert!(registry.active_frame().is_none());

        assert!(registry.start_camera(&id));
        assert!(wait_for_active(&registry).is_some());
        registry.stop_all_cameras();
    }
}
