//! Notifications published by the rig.
//!
//! Subscribers get their own [`broadcast::Receiver`]; publishing never blocks
//! and succeeds whether or not anyone is listening. A receiver that falls more
//! than the channel capacity behind skips the oldest events.

use crate::calibration::CalibrationResult;
use crate::device::{CameraId, FrameSample};
use crate::localization::MarkerLocalization;
use log::trace;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct CameraStatus {
    pub camera_id: CameraId,
    pub connected: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RigEvent {
    FrameReceived(FrameSample),
    CameraStatus(CameraStatus),
    CalibrationCompleted(Arc<CalibrationResult>),
    MarkerLocalized(MarkerLocalization),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RigEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RigEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RigEvent) {
        if self.sender.send(event).is_err() {
            trace!("No subscribers for rig event");
        }
    }

    pub(crate) fn camera_status(&self, camera_id: CameraId, connected: bool, error: Option<String>) {
        self.publish(RigEvent::CameraStatus(CameraStatus {
            camera_id,
            connected,
            error,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.camera_status(0, true, None);
    }

    #[test]
    fn test_subscribers_receive_events() {
        let bus = EventBus::new(4);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.camera_status(2, false, Some("camera 2 was not found".to_string()));

        for receiver in [&mut first, &mut second] {
            match receiver.try_recv().unwrap() {
                RigEvent::CameraStatus(status) => {
                    assert_eq!(status.camera_id, 2);
                    assert!(!status.connected);
                    assert!(status.error.is_some());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(first.try_recv().is_err());
    }
}
