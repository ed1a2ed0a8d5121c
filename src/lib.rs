//! Camflow: camera lifecycle management and planar 4:2:0 frame conversion.
//!
//! This library opens a camera through a trait-based hardware seam, runs a
//! repeating preview request, and converts every delivered 4:2:0 image into a
//! single contiguous planar buffer for a streaming sink. A V4L2 backend is
//! provided for real hardware; tests use mock devices.

pub mod config;
pub mod convert;
pub mod device;
pub mod events;
pub mod gate;
pub mod geometry;
pub mod lifecycle;
pub mod reader;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::CameraConfig;
pub use convert::{FrameConverter, PlanarFrame};
pub use device::{NodeAccessContext, V4l2Provider};
pub use geometry::{DisplayRotation, Rotation};
pub use lifecycle::{CameraHelper, LifecycleState};
pub use traits::{
    CameraError, CameraId, CameraListener, CameraProvider, FourCC, HostContext, PreviewSurface,
    Size, SurfaceEvent,
};
