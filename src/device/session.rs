//! Camera session lifecycle.
//!
//! States move `Disconnected -> Connecting -> Connected -> Disconnecting ->
//! Disconnected`. At most one connect is in flight per camera id: a newer
//! request cancels and supersedes the older one, which then returns
//! [`SessionError::Cancelled`] without touching the camera's state.

use super::{
    image_is_empty, CameraHandle, CameraId, CameraInfo, CancelToken, ConnectionState,
    DeviceBackend, DeviceGuard, FrameSample, StereoFrame,
};
use crate::camera::Resolution;
use crate::config::SessionConfig;
use crate::events::{EventBus, RigEvent};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("camera {0} was not found or never became ready")]
    DeviceNotFound(CameraId),
    #[error("camera {0} opened but delivered no frame")]
    DeviceNoData(CameraId),
    #[error("connecting camera {id} timed out after {after:?}")]
    Timeout { id: CameraId, after: Duration },
    #[error("connect was cancelled")]
    Cancelled,
    #[error("camera {0} is not connected")]
    NotConnected(CameraId),
    #[error("device backend failure: {0}")]
    Backend(String),
}

type SharedDevice = Arc<Mutex<DeviceGuard>>;

struct PendingConnect {
    generation: u64,
    token: CancelToken,
}

#[derive(Default)]
struct CameraSlot {
    state: ConnectionState,
    resolution: Resolution,
    capture_active: bool,
    device: Option<SharedDevice>,
    pending: Option<PendingConnect>,
    generation: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl CameraSlot {
    fn handle(&self, id: CameraId) -> CameraHandle {
        CameraHandle {
            id,
            state: self.state,
            resolution: self.resolution,
            capture_active: self.capture_active,
        }
    }
}

struct SessionInner {
    backend: Arc<dyn DeviceBackend>,
    config: SessionConfig,
    events: EventBus,
    slots: Mutex<HashMap<CameraId, CameraSlot>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let slots = match self.slots.get_mut() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in slots.values_mut() {
            if let Some(pending) = slot.pending.take() {
                pending.token.cancel();
            }
        }
        // Opened devices are released as their guards drop with the map.
    }
}

/// Owns the capture devices of the rig and their connection state.
///
/// Cloning gives another handle onto the same sessions.
#[derive(Clone)]
pub struct CameraSessionManager {
    inner: Arc<SessionInner>,
}

impl CameraSessionManager {
    pub fn new(backend: Arc<dyn DeviceBackend>, config: SessionConfig, events: EventBus) -> Self {
        CameraSessionManager {
            inner: Arc::new(SessionInner {
                backend,
                config,
                events,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Interval at which callers are expected to pull frames.
    pub fn capture_interval(&self) -> Duration {
        self.inner.config.capture_interval()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<CameraId, CameraSlot>> {
        match self.inner.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Connects camera `id`.
    ///
    /// Any in-flight connect for the same id is cancelled and any device
    /// already open for it is released first. The sequence waits the settle
    /// delay, opens the device, polls it until ready, verifies it with one
    /// frame and applies the default resolution, all within the connect
    /// deadline.
    ///
    /// # Errors
    ///
    /// * [`SessionError::DeviceNotFound`] if the device cannot be opened or never reports ready.
    /// * [`SessionError::DeviceNoData`] if the verification frame is missing or empty.
    /// * [`SessionError::Timeout`] if the deadline passes first.
    /// * [`SessionError::Cancelled`] if the connect was cancelled or superseded.
    pub async fn connect(&self, id: CameraId) -> Result<CameraHandle, SessionError> {
        let (generation, token, previous) = self.begin_connect(id);
        if previous.is_some() {
            debug!("Releasing previously opened device for camera {id}");
        }
        drop(previous);

        let deadline = self.inner.config.connect_timeout();
        let outcome = match tokio::time::timeout(deadline, self.acquire(id, &token)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                token.cancel();
                Err(SessionError::Timeout {
                    id,
                    after: deadline,
                })
            }
        };

        self.finish_connect(id, generation, outcome)
    }

    fn begin_connect(&self, id: CameraId) -> (u64, CancelToken, Option<SharedDevice>) {
        let mut slots = self.slots();
        let slot = slots.entry(id).or_default();

        if let Some(pending) = slot.pending.take() {
            debug!("Superseding in-flight connect for camera {id}");
            pending.token.cancel();
        }

        slot.generation += 1;
        let token = CancelToken::new();
        slot.pending = Some(PendingConnect {
            generation: slot.generation,
            token: token.clone(),
        });
        slot.state = ConnectionState::Connecting;
        slot.capture_active = false;

        (slot.generation, token, slot.device.take())
    }

    async fn acquire(
        &self,
        id: CameraId,
        token: &CancelToken,
    ) -> Result<DeviceGuard, SessionError> {
        let config = &self.inner.config;

        if !token.sleep(config.settle_delay()).await {
            return Err(SessionError::Cancelled);
        }

        // The guard is built on the blocking thread so the device is released
        // on every early return, including an open abandoned by a cancel.
        let backend = Arc::clone(&self.inner.backend);
        let opened = run_blocking(token, move || {
            backend
                .open(id)
                .map(|device| DeviceGuard::new(id, device))
        })
        .await?;
        let mut guard = opened.map_err(|e| {
            debug!("Opening camera {id} failed: {e}");
            SessionError::DeviceNotFound(id)
        })?;

        let attempts = config.ready_poll_attempts.max(1);
        let mut ready = false;
        for attempt in 1..=attempts {
            if token.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            if guard.device().is_open() {
                ready = true;
                break;
            }
            debug!("Camera {id} not ready (attempt {attempt}/{attempts})");
            if attempt < attempts && !token.sleep(config.ready_poll_interval()).await {
                return Err(SessionError::Cancelled);
            }
        }
        if !ready {
            return Err(SessionError::DeviceNotFound(id));
        }

        let (returned, frame) = run_blocking(token, move || {
            let frame = guard.device_mut().read();
            (guard, frame)
        })
        .await?;
        guard = returned;

        match frame {
            Ok(image) if !image_is_empty(&image) => {}
            Ok(_) => return Err(SessionError::DeviceNoData(id)),
            Err(e) => {
                debug!("Verification read on camera {id} failed: {e}");
                return Err(SessionError::DeviceNoData(id));
            }
        }

        if let Err(e) = guard.device_mut().set_resolution(config.default_resolution) {
            warn!(
                "Camera {id} rejected resolution {}: {e}",
                config.default_resolution
            );
        }

        Ok(guard)
    }

    fn finish_connect(
        &self,
        id: CameraId,
        generation: u64,
        outcome: Result<DeviceGuard, SessionError>,
    ) -> Result<CameraHandle, SessionError> {
        let mut slots = self.slots();
        let slot = slots.entry(id).or_default();

        let is_current = slot
            .pending
            .as_ref()
            .is_some_and(|pending| pending.generation == generation);
        if !is_current {
            // A newer connect or a disconnect owns this slot now.
            debug!("Connect for camera {id} was superseded");
            return Err(SessionError::Cancelled);
        }
        slot.pending = None;

        match outcome {
            Ok(guard) => {
                slot.state = ConnectionState::Connected;
                slot.resolution = guard.device().resolution();
                slot.device = Some(Arc::new(Mutex::new(guard)));
                let handle = slot.handle(id);
                drop(slots);

                info!("Camera {id} connected at {}", handle.resolution);
                self.inner.events.camera_status(id, true, None);
                Ok(handle)
            }
            Err(e) => {
                slot.state = ConnectionState::Disconnected;
                drop(slots);

                warn!("Camera {id} failed to connect: {e}");
                self.inner.events.camera_status(id, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Cancels an in-flight connect for `id`. Returns whether one was pending.
    pub fn cancel_connect(&self, id: CameraId) -> bool {
        let slots = self.slots();
        match slots.get(&id).and_then(|slot| slot.pending.as_ref()) {
            Some(pending) => {
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Disconnects camera `id`, cancelling any in-flight connect and releasing
    /// the device.
    ///
    /// Safe to call at any time. On an unknown or already disconnected camera
    /// it does nothing and returns `false`.
    pub fn disconnect(&self, id: CameraId) -> bool {
        let device = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&id) else {
                return false;
            };
            if slot.state == ConnectionState::Disconnected
                && slot.pending.is_none()
                && slot.device.is_none()
            {
                return false;
            }

            slot.state = ConnectionState::Disconnecting;
            if let Some(pending) = slot.pending.take() {
                pending.token.cancel();
            }
            slot.capture_active = false;
            slot.device.take()
        };

        // A read in progress holds its own reference; the device is released
        // when that read finishes.
        drop(device);

        {
            let mut slots = self.slots();
            if let Some(slot) = slots.get_mut(&id) {
                if slot.state == ConnectionState::Disconnecting {
                    slot.state = ConnectionState::Disconnected;
                }
            }
        }

        info!("Camera {id} disconnected");
        self.inner.events.camera_status(id, false, None);
        true
    }

    /// Disconnects every known camera.
    pub fn disconnect_all(&self) {
        let ids: Vec<CameraId> = self.slots().keys().copied().collect();
        for id in ids {
            self.disconnect(id);
        }
    }

    /// Makes frame pulls on `id` also publish [`RigEvent::FrameReceived`].
    pub fn start_capture(&self, id: CameraId) -> Result<(), SessionError> {
        let mut slots = self.slots();
        match slots.get_mut(&id) {
            Some(slot) if slot.state == ConnectionState::Connected => {
                slot.capture_active = true;
                Ok(())
            }
            _ => Err(SessionError::NotConnected(id)),
        }
    }

    pub fn stop_capture(&self, id: CameraId) {
        if let Some(slot) = self.slots().get_mut(&id) {
            slot.capture_active = false;
        }
    }

    /// Reads the current frame of a connected camera.
    ///
    /// Returns `None` when the camera is not connected, the read fails or the
    /// frame is empty. Timestamps of successive frames are strictly increasing.
    pub fn get_current_frame(&self, id: CameraId) -> Option<FrameSample> {
        let (device, capture_active) = {
            let slots = self.slots();
            let slot = slots.get(&id)?;
            if slot.state != ConnectionState::Connected {
                return None;
            }
            (Arc::clone(slot.device.as_ref()?), slot.capture_active)
        };

        let image = {
            let mut guard = match device.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match guard.device_mut().read() {
                Ok(image) if !image_is_empty(&image) => image,
                Ok(_) => {
                    debug!("Camera {id} returned an empty frame");
                    return None;
                }
                Err(e) => {
                    debug!("Reading camera {id} failed: {e}");
                    return None;
                }
            }
        };

        let sample = FrameSample {
            camera_id: id,
            image: Arc::new(image),
            timestamp: self.next_timestamp(id),
        };

        if capture_active {
            self.inner
                .events
                .publish(RigEvent::FrameReceived(sample.clone()));
        }
        Some(sample)
    }

    /// Pulls one frame from each camera of a stereo pair.
    pub fn capture_stereo(&self, left: CameraId, right: CameraId) -> Option<StereoFrame> {
        let left = self.get_current_frame(left)?;
        let right = self.get_current_frame(right)?;
        Some(StereoFrame::new(left, right))
    }

    fn next_timestamp(&self, id: CameraId) -> DateTime<Utc> {
        let mut slots = self.slots();
        let now = Utc::now();
        let Some(slot) = slots.get_mut(&id) else {
            return now;
        };
        let timestamp = match slot.last_timestamp {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };
        slot.last_timestamp = Some(timestamp);
        timestamp
    }

    /// Changes the capture resolution of a connected camera, returning the
    /// resolution the device settled on.
    pub fn set_resolution(
        &self,
        id: CameraId,
        resolution: Resolution,
    ) -> Result<Resolution, SessionError> {
        let device = {
            let slots = self.slots();
            slots
                .get(&id)
                .filter(|slot| slot.state == ConnectionState::Connected)
                .and_then(|slot| slot.device.clone())
                .ok_or(SessionError::NotConnected(id))?
        };

        let applied = {
            let mut guard = match device.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard
                .device_mut()
                .set_resolution(resolution)
                .map_err(|e| SessionError::Backend(e.to_string()))?;
            guard.device().resolution()
        };

        if let Some(slot) = self.slots().get_mut(&id) {
            slot.resolution = applied;
        }
        info!("Camera {id} resolution set to {applied}");
        Ok(applied)
    }

    pub fn handle(&self, id: CameraId) -> Option<CameraHandle> {
        self.slots().get(&id).map(|slot| slot.handle(id))
    }

    pub fn state(&self, id: CameraId) -> ConnectionState {
        self.slots()
            .get(&id)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    pub fn is_connected(&self, id: CameraId) -> bool {
        self.state(id) == ConnectionState::Connected
    }

    pub fn connected_cameras(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = self
            .slots()
            .iter()
            .filter(|(_, slot)| slot.state == ConnectionState::Connected)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Probes ids `0..max_devices` and reports the ones that open.
    ///
    /// Cameras already connected are reported from their session without
    /// being reopened. Probed devices are released straight away.
    pub async fn detect_available(&self, max_devices: u32) -> Vec<CameraInfo> {
        let mut found = Vec::new();

        for id in 0..max_devices {
            let name = self.inner.backend.device_name(id);
            if let Some(handle) = self.handle(id).filter(CameraHandle::is_connected) {
                found.push(CameraInfo {
                    id,
                    name,
                    available: true,
                    connected: true,
                    resolution: Some(handle.resolution),
                });
                continue;
            }

            let backend = Arc::clone(&self.inner.backend);
            let probe = tokio::task::spawn_blocking(move || {
                let device = backend.open(id).ok()?;
                let guard = DeviceGuard::new(id, device);
                guard
                    .device()
                    .is_open()
                    .then(|| guard.device().resolution())
            })
            .await;

            match probe {
                Ok(Some(resolution)) => found.push(CameraInfo {
                    id,
                    name,
                    available: true,
                    connected: false,
                    resolution: Some(resolution),
                }),
                Ok(None) => debug!("No device at id {id}"),
                Err(e) => warn!("Probing camera {id} failed: {e}"),
            }
        }

        info!("Found {} camera(s)", found.len());
        found
    }

    /// Probes up to the configured probe limit.
    pub async fn detect_cameras(&self) -> Vec<CameraInfo> {
        self.detect_available(self.inner.config.probe_limit).await
    }
}

/// Runs a blocking device call on the blocking pool, giving up early if the
/// token is cancelled. An abandoned call still runs to completion and then
/// drops its result.
async fn run_blocking<T, F>(token: &CancelToken, f: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    tokio::select! {
        joined = task => joined.map_err(|e| SessionError::Backend(e.to_string())),
        _ = token.cancelled() => Err(SessionError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{FakeBackend, FakeDeviceSpec};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            settle_delay_ms: 1,
            ready_poll_attempts: 5,
            ready_poll_interval_ms: 2,
            connect_timeout_ms: 2_000,
            ..SessionConfig::default()
        }
    }

    fn manager(backend: &FakeBackend, config: SessionConfig) -> CameraSessionManager {
        CameraSessionManager::new(Arc::new(backend.clone()), config, EventBus::default())
    }

    #[tokio::test]
    async fn test_connect_polls_until_ready() {
        let backend = FakeBackend::new();
        backend.add_device(3, FakeDeviceSpec::ready_after(2));
        let sessions = manager(&backend, fast_config());

        let handle = sessions.connect(3).await.unwrap();
        assert_eq!(handle.state, ConnectionState::Connected);
        assert_eq!(handle.resolution, Resolution::new(640, 480));
        assert_eq!(backend.opened(), 1);
        assert_eq!(backend.released(), 0);
    }

    #[tokio::test]
    async fn test_never_ready_is_not_found() {
        let backend = FakeBackend::new();
        backend.add_device(0, FakeDeviceSpec::ready_after(100));
        let sessions = manager(&backend, fast_config());

        let err = sessions.connect(0).await.unwrap_err();
        assert_eq!(err, SessionError::DeviceNotFound(0));
        assert_eq!(sessions.state(0), ConnectionState::Disconnected);
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_missing_device_is_not_found() {
        let backend = FakeBackend::new();
        let sessions = manager(&backend, fast_config());

        assert_eq!(
            sessions.connect(9).await.unwrap_err(),
            SessionError::DeviceNotFound(9)
        );
    }

    #[tokio::test]
    async fn test_empty_verification_frame_is_no_data() {
        let backend = FakeBackend::new();
        backend.add_device(1, FakeDeviceSpec::empty_frames());
        let sessions = manager(&backend, fast_config());

        assert_eq!(
            sessions.connect(1).await.unwrap_err(),
            SessionError::DeviceNoData(1)
        );
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_slow_open_times_out() {
        let backend = FakeBackend::new();
        backend.add_device(
            0,
            FakeDeviceSpec::ready_after(0).with_open_delay(Duration::from_millis(300)),
        );
        let config = SessionConfig {
            connect_timeout_ms: 50,
            ..fast_config()
        };
        let sessions = manager(&backend, config);

        let err = sessions.connect(0).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { id: 0, .. }));
        assert_eq!(sessions.state(0), ConnectionState::Disconnected);

        // The abandoned open finishes in the background and is released.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(backend.opened(), 1);
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_newer_connect_supersedes_older() {
        let backend = FakeBackend::new();
        backend.add_device(2, FakeDeviceSpec::ready_after(0));
        let config = SessionConfig {
            settle_delay_ms: 100,
            ..fast_config()
        };
        let sessions = manager(&backend, config);

        let first = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.connect(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = sessions.connect(2).await;

        assert_eq!(first.await.unwrap().unwrap_err(), SessionError::Cancelled);
        assert!(second.unwrap().is_connected());
        assert!(sessions.is_connected(2));
        assert_eq!(backend.opened(), 1);
    }

    #[tokio::test]
    async fn test_cancel_connect() {
        let backend = FakeBackend::new();
        backend.add_device(4, FakeDeviceSpec::ready_after(0));
        let config = SessionConfig {
            settle_delay_ms: 500,
            ..fast_config()
        };
        let sessions = manager(&backend, config);

        let pending = {
            let sessions = sessions.clone();
            tokio::spawn(async move { sessions.connect(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sessions.state(4), ConnectionState::Connecting);
        assert!(sessions.cancel_connect(4));

        assert_eq!(pending.await.unwrap().unwrap_err(), SessionError::Cancelled);
        assert_eq!(sessions.state(4), ConnectionState::Disconnected);
        assert!(!sessions.cancel_connect(4));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let backend = FakeBackend::new();
        backend.add_device(0, FakeDeviceSpec::ready_after(0));
        let sessions = manager(&backend, fast_config());
        let mut events = sessions.events().subscribe();

        assert!(!sessions.disconnect(0));
        assert!(events.try_recv().is_err());

        sessions.connect(0).await.unwrap();
        sessions.start_capture(0).unwrap();
        assert!(sessions.disconnect(0));
        assert!(!sessions.disconnect(0));

        assert_eq!(backend.released(), 1);
        assert_eq!(sessions.state(0), ConnectionState::Disconnected);
        assert!(!sessions.handle(0).unwrap().capture_active);
        assert!(sessions.get_current_frame(0).is_none());
    }

    #[tokio::test]
    async fn test_frames_have_increasing_timestamps() {
        let backend = FakeBackend::new();
        backend.add_device(0, FakeDeviceSpec::ready_after(0));
        let sessions = manager(&backend, fast_config());
        sessions.connect(0).await.unwrap();

        let mut events = sessions.events().subscribe();
        let first = sessions.get_current_frame(0).unwrap();
        assert!(events.try_recv().is_err());

        sessions.start_capture(0).unwrap();
        let second = sessions.get_current_frame(0).unwrap();
        assert!(second.timestamp > first.timestamp);
        assert!(matches!(
            events.try_recv().unwrap(),
            RigEvent::FrameReceived(frame) if frame.timestamp == second.timestamp
        ));

        sessions.stop_capture(0);
        sessions.get_current_frame(0).unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_capture_requires_connection() {
        let backend = FakeBackend::new();
        let sessions = manager(&backend, fast_config());
        assert_eq!(
            sessions.start_capture(5).unwrap_err(),
            SessionError::NotConnected(5)
        );
        assert!(sessions.set_resolution(5, Resolution::new(320, 240)).is_err());
    }

    #[test]
    fn test_capture_interval_with_zero_rate() {
        let backend = FakeBackend::new();
        let config = SessionConfig {
            capture_rate_hz: 0.0,
            ..fast_config()
        };
        let sessions = manager(&backend, config);
        assert_eq!(sessions.capture_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_set_resolution_updates_handle() {
        let backend = FakeBackend::new();
        backend.add_device(0, FakeDeviceSpec::ready_after(0));
        let sessions = manager(&backend, fast_config());
        sessions.connect(0).await.unwrap();

        let applied = sessions.set_resolution(0, Resolution::new(1280, 720)).unwrap();
        assert_eq!(applied, Resolution::new(1280, 720));
        assert_eq!(sessions.handle(0).unwrap().resolution, applied);
        assert_eq!(
            sessions.get_current_frame(0).unwrap().resolution(),
            Resolution::new(1280, 720)
        );
    }

    #[tokio::test]
    async fn test_detect_available() {
        let backend = FakeBackend::new();
        backend.add_device(0, FakeDeviceSpec::ready_after(0));
        backend.add_device(2, FakeDeviceSpec::ready_after(0));
        let sessions = manager(&backend, fast_config());
        sessions.connect(2).await.unwrap();

        let cameras = sessions.detect_available(4).await;
        let ids: Vec<_> = cameras.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert!(!cameras[0].connected);
        assert!(cameras[1].connected);

        // Probing opened device 0 once and released it; device 2 was not reopened.
        assert_eq!(backend.opened(), 2);
        assert_eq!(backend.released(), 1);
    }

    #[tokio::test]
    async fn test_dropping_manager_releases_devices() {
        let backend = FakeBackend::new();
        backend.add_device(0, FakeDeviceSpec::ready_after(0));
        backend.add_device(1, FakeDeviceSpec::ready_after(0));
        let sessions = manager(&backend, fast_config());
        sessions.connect(0).await.unwrap();
        sessions.connect(1).await.unwrap();
        assert_eq!(sessions.connected_cameras(), vec![0, 1]);

        drop(sessions);
        assert_eq!(backend.released(), 2);
    }
}
