//! Core traits and types for the camera abstraction.
//!
//! The hardware seam is split the way capture hardware exposes it: a
//! [`CameraProvider`] enumerates and opens cameras, an opened [`CameraDevice`]
//! creates a [`CaptureSession`], and the session delivers [`HardwareImage`]s
//! into the frame reader. Completion of every asynchronous step is reported
//! back as a [`crate::events::CameraEvent`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::convert::PlanarFrame;
use crate::events::EventSender;
use crate::geometry::Affine;
use crate::reader::ReaderSurface;

/// Pixel format representation (e.g., YU12, NV12, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// Planar 4:2:0 with separate U and V planes (I420).
    pub const YU12: Self = Self::new(b"YU12");
    /// Semi-planar 4:2:0 with interleaved UV samples.
    pub const NV12: Self = Self::new(b"NV12");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{}", char::from(byte))?;
        }
        Ok(())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Layout family of a delivered image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Any 4:2:0 layout described by one luma and two chroma planes.
    Yuv420,
    /// Anything else. Frames in these formats are not converted.
    Other(FourCC),
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel count.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Size with width and height exchanged.
    #[must_use]
    pub const fn transposed(self) -> Self {
        Self::new(self.height, self.width)
    }

    /// Byte length of a planar 4:2:0 frame of this size.
    #[must_use]
    pub const fn planar_len(self) -> usize {
        (self.width as usize * self.height as usize) * 3 / 2
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Identifier of a physical camera as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(String);

impl CameraId {
    /// Conventional id of the back-facing camera.
    pub const BACK: &'static str = "0";
    /// Conventional id of the front-facing camera.
    pub const FRONT: &'static str = "1";

    /// Create an id from any string-like value.
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// The back-facing camera id.
    #[must_use]
    pub fn back() -> Self {
        Self::new(Self::BACK)
    }

    /// The front-facing camera id.
    #[must_use]
    pub fn front() -> Self {
        Self::new(Self::FRONT)
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The opposite conventional camera, or `None` for any other id.
    #[must_use]
    pub fn toggled(&self) -> Option<Self> {
        match self.as_str() {
            Self::BACK => Some(Self::front()),
            Self::FRONT => Some(Self::back()),
            _ => None,
        }
    }
}

impl Default for CameraId {
    fn default() -> Self {
        Self::back()
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Direction a camera's lens faces relative to the device screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    /// Same side as the screen.
    Front,
    /// Opposite side from the screen.
    Back,
    /// Externally attached, no fixed relation to the screen.
    External,
}

/// Static properties of a camera queried before opening it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraCharacteristics {
    /// Lens facing.
    pub facing: Facing,
    /// Clockwise degrees the sensor image must be rotated to appear upright.
    pub sensor_orientation: u32,
    /// Output sizes advertised for 4:2:0 streams, in hardware order.
    /// `None` when the camera has no usable stream configuration.
    pub output_sizes: Option<Vec<Size>>,
}

/// One plane of a hardware image.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    /// Plane bytes, starting at the first sample.
    pub data: &'a [u8],
    /// Byte distance between the starts of consecutive rows.
    pub row_stride: usize,
    /// Byte distance between consecutive samples within a row.
    pub pixel_stride: usize,
}

/// An image delivered by the capture hardware into the frame reader.
///
/// Implementations hold a hardware buffer; [`HardwareImage::close`] hands it
/// back and is called exactly once by the reader machinery.
pub trait HardwareImage: Send {
    /// Layout family of this image.
    fn format(&self) -> ImageFormat;

    /// Image width in pixels.
    fn width(&self) -> u32;

    /// Image height in pixels.
    fn height(&self) -> u32;

    /// Plane at `index`. 4:2:0 images expose luma at 0 and chroma at 1 and 2.
    fn plane(&self, index: usize) -> Option<Plane<'_>>;

    /// Hardware sequence number, when the backend has one.
    fn sequence(&self) -> u32 {
        0
    }

    /// Release the underlying hardware buffer.
    fn close(&mut self);
}

/// Autofocus mode requested for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfMode {
    /// Autofocus disabled.
    Off,
    /// Continuous focus tuned for still pictures.
    ContinuousPicture,
    /// Continuous focus tuned for video.
    ContinuousVideo,
}

/// Template a capture request is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    /// Preview-quality repeating capture.
    Preview,
    /// Recording-quality repeating capture.
    Record,
}

/// Output surfaces a capture request renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTarget {
    /// The on-screen preview surface.
    Preview,
    /// The internal frame reader.
    Reader,
}

/// A capture request submitted to a configured session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Request template.
    pub template: RequestTemplate,
    /// Autofocus mode.
    pub af_mode: AfMode,
    /// Surfaces receiving the captured frames.
    pub targets: Vec<OutputTarget>,
}

impl CaptureRequest {
    /// The repeating preview request: continuous-picture autofocus into both
    /// the preview surface and the frame reader.
    #[must_use]
    pub fn preview() -> Self {
        Self {
            template: RequestTemplate::Preview,
            af_mode: AfMode::ContinuousPicture,
            targets: vec![OutputTarget::Preview, OutputTarget::Reader],
        }
    }
}

/// Surfaces a capture session is bound to.
pub struct SessionOutputs {
    /// On-screen preview surface.
    pub preview: Arc<dyn PreviewSurface>,
    /// Internal frame-reader surface.
    pub reader: ReaderSurface,
}

/// Signals from the display surface the preview renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    /// The surface became available with the given size.
    Available(Size),
    /// The surface was resized.
    SizeChanged(Size),
    /// The surface was destroyed.
    Destroyed,
    /// The surface content was updated.
    Updated,
}

/// The display surface the preview is rendered into.
pub trait PreviewSurface: Send + Sync {
    /// Whether the surface currently exists and can be rendered into.
    fn is_available(&self) -> bool;

    /// Current surface size in pixels.
    fn size(&self) -> Size;

    /// Size of the buffers the camera renders into this surface.
    fn set_default_buffer_size(&self, size: Size);

    /// Transform applied when compositing camera buffers onto the surface.
    fn set_transform(&self, transform: &Affine);
}

/// Enumerates cameras and opens them.
pub trait CameraProvider: Send + Sync {
    /// Ids of every camera currently available.
    fn camera_ids(&self) -> Result<Vec<CameraId>>;

    /// Static properties of the camera `id`.
    fn characteristics(&self, id: &CameraId) -> Result<CameraCharacteristics>;

    /// Begin opening camera `id`.
    ///
    /// Completion is reported through `events` as
    /// [`CameraEvent::DeviceOpened`](crate::events::CameraEvent::DeviceOpened),
    /// `DeviceDisconnected` or `DeviceError`. An `Err` return means the request
    /// itself was refused and no event will follow.
    fn open(&self, id: &CameraId, events: EventSender) -> Result<()>;
}

/// An opened camera device.
pub trait CameraDevice: Send {
    /// Id of this device.
    fn id(&self) -> &CameraId;

    /// Begin configuring a session bound to `outputs`.
    ///
    /// Completion is reported as `SessionConfigured` or
    /// `SessionConfigureFailed`.
    fn create_capture_session(&mut self, outputs: SessionOutputs, events: EventSender)
        -> Result<()>;

    /// Close the device. Idempotent.
    fn close(&mut self);
}

/// A configured capture session.
pub trait CaptureSession: Send {
    /// Submit `request` to be repeated until the session closes.
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<()>;

    /// Stop capturing and release the session. Idempotent.
    fn close(&mut self);
}

/// Capabilities the host must grant before a camera may be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Access to camera devices.
    Camera,
    /// Access to audio input.
    RecordAudio,
}

impl Capability {
    /// Stable name reported in denial maps.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::RecordAudio => "record_audio",
        }
    }
}

/// The application context the camera helper runs inside.
pub trait HostContext: Send + Sync {
    /// Check the given capabilities.
    ///
    /// Returns an empty map when all are granted; otherwise the denied
    /// capability names.
    fn check_permissions(&self, capabilities: &[Capability]) -> BTreeMap<String, bool>;
}

/// Receiver of camera lifecycle events and converted frames.
///
/// All methods are called on the capture thread.
pub trait CameraListener: Send + Sync {
    /// The camera opened with the negotiated preview size and the display
    /// orientation in degrees.
    fn on_camera_opened(&self, size: Size, display_orientation: u32);

    /// The camera closed.
    fn on_camera_closed(&self);

    /// The camera failed.
    fn on_camera_error(&self, error: &CameraError);

    /// A converted frame. The buffer is only valid for the duration of the
    /// call; copy it to keep it.
    fn on_preview_frame(&self, frame: &PlanarFrame<'_>);
}

/// Error type for camera operations.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// The host denied a required capability.
    #[error("permission denied: {0:?}")]
    PermissionDenied(Vec<String>),
    /// The host context was dropped before it could be used.
    #[error("host context is gone")]
    ContextGone,
    /// The camera could not be reached (busy, disconnected, revoked).
    #[error("camera access failed: {0}")]
    DeviceAccess(String),
    /// The opened device reported an error.
    #[error("camera device error, code is {code}")]
    Device {
        /// Backend error code.
        code: i32,
    },
    /// No camera offered a usable stream configuration.
    #[error("no camera with a usable stream configuration")]
    NoUsableCamera,
    /// The capture session could not be configured.
    #[error("capture session configuration failed")]
    ConfigureFailed,
    /// The open/close permit was not acquired in time.
    #[error("timed out waiting to lock camera {0}")]
    LockTimeout(&'static str),
    /// A rotation other than 0, 90 or 180 degrees was requested.
    #[error("unsupported rotation: {0} degrees")]
    UnsupportedRotation(u32),
    /// A delivered image did not match its declared layout.
    #[error("invalid image: {0}")]
    InvalidImage(String),
    /// The capture thread could not be started.
    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawn(std::io::Error),
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;
