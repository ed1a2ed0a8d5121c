//! Events processed by the capture thread.
//!
//! Every hardware callback and every control request is turned into a
//! [`CameraEvent`] and pushed onto a single-consumer queue drained by the
//! capture thread in arrival order.

use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::reader::AcquiredImage;
use crate::traits::{CameraDevice, CaptureSession, SurfaceEvent};

/// A message for the capture thread.
pub enum CameraEvent {
    /// Open the requested camera, or defer until the surface is available.
    Open,
    /// Display surface signal.
    Surface(SurfaceEvent),
    /// The device finished opening.
    DeviceOpened(Box<dyn CameraDevice>),
    /// The device went away.
    DeviceDisconnected,
    /// The device reported an error.
    DeviceError {
        /// Backend error code.
        code: i32,
    },
    /// The capture session is ready for requests.
    SessionConfigured(Box<dyn CaptureSession>),
    /// The capture session could not be configured.
    SessionConfigureFailed,
    /// The frame reader has an image.
    ImageAvailable(AcquiredImage),
    /// Take the open/close permit, tear down the session and device, then
    /// acknowledge on `done`.
    Close {
        /// Acknowledgement channel.
        done: Sender<()>,
    },
    /// Leave the capture loop.
    Shutdown,
}

impl std::fmt::Debug for CameraEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("Open"),
            Self::Surface(event) => f.debug_tuple("Surface").field(event).finish(),
            Self::DeviceOpened(device) => f.debug_tuple("DeviceOpened").field(device.id()).finish(),
            Self::DeviceDisconnected => f.write_str("DeviceDisconnected"),
            Self::DeviceError { code } => f.debug_struct("DeviceError").field("code", code).finish(),
            Self::SessionConfigured(_) => f.write_str("SessionConfigured"),
            Self::SessionConfigureFailed => f.write_str("SessionConfigureFailed"),
            Self::ImageAvailable(_) => f.write_str("ImageAvailable"),
            Self::Close { .. } => f.write_str("Close"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Sending half of the capture thread's queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<CameraEvent>,
}

impl EventSender {
    /// Queue `event`. Returns `false` when the capture thread is gone; the
    /// event (and any device, session or image it carries) is dropped.
    pub fn send(&self, event: CameraEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(err) => {
                debug!(event = ?err.0, "capture thread gone, dropping event");
                false
            }
        }
    }
}

/// Receiving half of the capture thread's queue.
pub type EventReceiver = Receiver<CameraEvent>;

/// Create a new unbounded event queue.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSender { tx }, rx)
}
