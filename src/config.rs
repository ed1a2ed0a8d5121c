//! Construction-time configuration for [`CameraHelper`](crate::CameraHelper).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geometry::{DisplayRotation, Rotation};
use crate::traits::{CameraError, CameraId, Result, Size};

/// Settings fixed for the lifetime of a camera helper.
///
/// Every field has a default, so a config file only needs the values it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera to try first.
    pub camera_id: CameraId,
    /// Preview size to approximate; usually the preview view's size.
    pub target_size: Size,
    /// Current display rotation.
    pub display_rotation: DisplayRotation,
    /// Rotation applied to every frame handed to the listener.
    pub rotation: Rotation,
    /// How long an open waits for the open/close permit.
    pub open_lock_timeout_ms: u64,
    /// How long a close waits for the permit and for the capture thread to
    /// finish tearing down.
    pub close_timeout_ms: u64,
    /// How long `stop` waits for the capture thread to exit.
    pub thread_join_timeout_ms: u64,
    /// Images the frame reader can have outstanding.
    pub reader_max_images: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_id: CameraId::back(),
            target_size: Size::new(1280, 720),
            display_rotation: DisplayRotation::Rotation0,
            rotation: Rotation::Deg0,
            open_lock_timeout_ms: 2500,
            close_timeout_ms: 2500,
            thread_join_timeout_ms: 1000,
            reader_max_images: 2,
        }
    }
}

impl CameraConfig {
    /// Parse and validate a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check values serde cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if self.target_size.width == 0 || self.target_size.height == 0 {
            return Err(CameraError::Config(format!(
                "target size must be non-zero, got {}",
                self.target_size
            )));
        }
        if self.reader_max_images == 0 {
            return Err(CameraError::Config(
                "reader_max_images must be at least 1".to_owned(),
            ));
        }
        if self.camera_id.as_str().is_empty() {
            return Err(CameraError::Config("camera_id must not be empty".to_owned()));
        }
        Ok(())
    }

    /// Open permit timeout.
    #[must_use]
    pub const fn open_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.open_lock_timeout_ms)
    }

    /// Close permit and teardown timeout.
    #[must_use]
    pub const fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Capture thread join timeout.
    #[must_use]
    pub const fn thread_join_timeout(&self) -> Duration {
        Duration::from_millis(self.thread_join_timeout_ms)
    }
}
