//! Mock camera stack for testing without hardware.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::convert::PlanarFrame;
use crate::events::{CameraEvent, EventSender};
use crate::geometry::Affine;
use crate::reader::{QueueOutcome, ReaderSurface};
use crate::traits::{
    CameraCharacteristics, CameraDevice, CameraError, CameraId, CameraListener, CameraProvider,
    Capability, CaptureRequest, CaptureSession, Facing, FourCC, HardwareImage, HostContext,
    ImageFormat, Plane, PreviewSurface, Result, SessionOutputs, Size,
};

/// Test pattern sample for luma at `(x, y)`.
#[allow(clippy::cast_possible_truncation)]
fn luma_at(seed: u8, x: usize, y: usize, width: usize) -> u8 {
    seed.wrapping_add((x + y * width) as u8)
}

/// Test pattern sample for the first chroma plane.
#[allow(clippy::cast_possible_truncation)]
fn u_at(seed: u8, x: usize, y: usize) -> u8 {
    64u8.wrapping_add(seed).wrapping_add((x * 3 + y * 7) as u8)
}

/// Test pattern sample for the second chroma plane.
#[allow(clippy::cast_possible_truncation)]
fn v_at(seed: u8, x: usize, y: usize) -> u8 {
    160u8.wrapping_add(seed).wrapping_add((x * 5 + y * 11) as u8)
}

#[derive(Debug, Clone, Copy)]
struct PlaneLayout {
    buffer: usize,
    offset: usize,
    row_stride: usize,
    pixel_stride: usize,
}

/// Synthetic hardware image with configurable plane layout.
#[derive(Debug)]
pub struct MockImage {
    format: ImageFormat,
    width: u32,
    height: u32,
    seed: u8,
    sequence: u32,
    buffers: Vec<Vec<u8>>,
    planes: Vec<PlaneLayout>,
    released: Arc<AtomicUsize>,
}

impl MockImage {
    fn build(
        format: ImageFormat,
        width: u32,
        height: u32,
        seed: u8,
        buffers: Vec<Vec<u8>>,
        planes: Vec<PlaneLayout>,
    ) -> Self {
        Self {
            format,
            width,
            height,
            seed,
            sequence: 0,
            buffers,
            planes,
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn luma_plane(width: usize, height: usize, row_stride: usize, seed: u8) -> Vec<u8> {
        let mut data = vec![0u8; row_stride * height];
        for (y, row) in data.chunks_exact_mut(row_stride).enumerate() {
            for (x, sample) in row.iter_mut().take(width).enumerate() {
                *sample = luma_at(seed, x, y, width);
            }
        }
        data
    }

    fn chroma_plane<F>(width: usize, height: usize, row_stride: usize, sample: F) -> Vec<u8>
    where
        F: Fn(usize, usize) -> u8,
    {
        let mut data = vec![0u8; row_stride * height];
        for (y, row) in data.chunks_exact_mut(row_stride).enumerate() {
            for (x, value) in row.iter_mut().take(width).enumerate() {
                *value = sample(x, y);
            }
        }
        data
    }

    /// Fully planar image with tightly packed rows.
    pub fn i420(width: u32, height: u32, seed: u8) -> Self {
        Self::i420_padded(width, height, seed, width as usize)
    }

    /// Fully planar image whose luma rows are `row_stride` bytes apart and
    /// whose chroma rows are `row_stride / 2` bytes apart.
    pub fn i420_padded(width: u32, height: u32, seed: u8, row_stride: usize) -> Self {
        let (w, h) = (width as usize, height as usize);
        let chroma_stride = row_stride / 2;
        let buffers = vec![
            Self::luma_plane(w, h, row_stride, seed),
            Self::chroma_plane(w / 2, h / 2, chroma_stride, |x, y| u_at(seed, x, y)),
            Self::chroma_plane(w / 2, h / 2, chroma_stride, |x, y| v_at(seed, x, y)),
        ];
        let planes = vec![
            PlaneLayout { buffer: 0, offset: 0, row_stride, pixel_stride: 1 },
            PlaneLayout { buffer: 1, offset: 0, row_stride: chroma_stride, pixel_stride: 1 },
            PlaneLayout { buffer: 2, offset: 0, row_stride: chroma_stride, pixel_stride: 1 },
        ];
        Self::build(ImageFormat::Yuv420, width, height, seed, buffers, planes)
    }

    /// Semi-planar image with interleaved `UV` samples and `padding` extra
    /// bytes at the end of every row.
    pub fn nv12_padded(width: u32, height: u32, seed: u8, padding: usize) -> Self {
        let (w, h) = (width as usize, height as usize);
        let row_stride = w + padding;
        let mut uv = vec![0u8; row_stride * (h / 2)];
        for (y, row) in uv.chunks_exact_mut(row_stride).enumerate() {
            for x in 0..w / 2 {
                if let Some(pair) = row.get_mut(2 * x..2 * x + 2) {
                    pair.copy_from_slice(&[u_at(seed, x, y), v_at(seed, x, y)]);
                }
            }
        }
        let buffers = vec![Self::luma_plane(w, h, row_stride, seed), uv];
        let planes = vec![
            PlaneLayout { buffer: 0, offset: 0, row_stride, pixel_stride: 1 },
            PlaneLayout { buffer: 1, offset: 0, row_stride, pixel_stride: 2 },
            PlaneLayout { buffer: 1, offset: 1, row_stride, pixel_stride: 2 },
        ];
        Self::build(ImageFormat::Yuv420, width, height, seed, buffers, planes)
    }

    /// Packed 4:2:2 image the converter does not handle.
    pub fn unsupported(width: u32, height: u32) -> Self {
        let buffers = vec![vec![0u8; width as usize * height as usize * 2]];
        let planes = vec![PlaneLayout {
            buffer: 0,
            offset: 0,
            row_stride: width as usize * 2,
            pixel_stride: 2,
        }];
        Self::build(ImageFormat::Other(FourCC::YUYV), width, height, 0, buffers, planes)
    }

    /// Planar image whose first chroma plane is cut short.
    pub fn truncated(width: u32, height: u32) -> Self {
        let mut image = Self::i420(width, height, 0);
        if let Some(chroma) = image.buffers.get_mut(1) {
            chroma.truncate(chroma.len() / 2);
        }
        image
    }

    /// Set the hardware sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Counter incremented every time the image is closed.
    pub fn release_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.released)
    }

    /// The planar frame a correct conversion of this image produces.
    pub fn planar_reference(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut out = Vec::with_capacity(w * h * 3 / 2);
        for y in 0..h {
            for x in 0..w {
                out.push(luma_at(self.seed, x, y, w));
            }
        }
        for y in 0..h / 2 {
            for x in 0..w / 2 {
                out.push(u_at(self.seed, x, y));
            }
        }
        for y in 0..h / 2 {
            for x in 0..w / 2 {
                out.push(v_at(self.seed, x, y));
            }
        }
        out
    }
}

impl HardwareImage for MockImage {
    fn format(&self) -> ImageFormat {
        self.format
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn plane(&self, index: usize) -> Option<Plane<'_>> {
        let layout = self.planes.get(index)?;
        let buffer = self.buffers.get(layout.buffer)?;
        Some(Plane {
            data: buffer.get(layout.offset..)?,
            row_stride: layout.row_stride,
            pixel_stride: layout.pixel_stride,
        })
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn close(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a mock camera answers an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Post `DeviceOpened`.
    Open,
    /// Refuse the request synchronously.
    Refuse,
    /// Post `DeviceError` with the given code.
    Error(i32),
    /// Post `DeviceDisconnected`.
    Disconnect,
}

/// How a mock device answers a session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBehavior {
    /// Post `SessionConfigured`.
    Configure,
    /// Post `SessionConfigureFailed`.
    Fail,
}

/// Description of one mock camera.
#[derive(Debug, Clone)]
pub struct MockCamera {
    /// Characteristics returned by the provider.
    pub characteristics: CameraCharacteristics,
    /// Open behavior.
    pub open: OpenBehavior,
    /// Session behavior.
    pub session: SessionBehavior,
}

impl MockCamera {
    /// A camera advertising `sizes` with the given facing and orientation.
    pub fn new(facing: Facing, sensor_orientation: u32, sizes: &[Size]) -> Self {
        Self {
            characteristics: CameraCharacteristics {
                facing,
                sensor_orientation,
                output_sizes: Some(sizes.to_vec()),
            },
            open: OpenBehavior::Open,
            session: SessionBehavior::Configure,
        }
    }

    /// A camera without a usable stream configuration.
    pub fn without_stream_map(facing: Facing) -> Self {
        let mut camera = Self::new(facing, 0, &[]);
        camera.characteristics.output_sizes = None;
        camera
    }

    /// Change the open behavior.
    #[must_use]
    pub const fn with_open(mut self, open: OpenBehavior) -> Self {
        self.open = open;
        self
    }

    /// Change the session behavior.
    #[must_use]
    pub const fn with_session(mut self, session: SessionBehavior) -> Self {
        self.session = session;
        self
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    cameras: Vec<(CameraId, MockCamera)>,
    opened: Vec<CameraId>,
    reader: Option<ReaderSurface>,
    requests: Vec<CaptureRequest>,
    closed_devices: usize,
    closed_sessions: usize,
}

/// Mock provider for testing without hardware. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl MockProvider {
    /// Create a provider with no cameras.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a camera.
    #[must_use]
    pub fn with_camera(self, id: &str, camera: MockCamera) -> Self {
        self.state.lock().cameras.push((CameraId::new(id), camera));
        self
    }

    /// Ids passed to `open`, in order.
    pub fn opened(&self) -> Vec<CameraId> {
        self.state.lock().opened.clone()
    }

    /// Requests submitted to sessions, in order.
    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of device closes.
    pub fn closed_devices(&self) -> usize {
        self.state.lock().closed_devices
    }

    /// Number of session closes.
    pub fn closed_sessions(&self) -> usize {
        self.state.lock().closed_sessions
    }

    /// Reader surface of the most recent session.
    pub fn reader(&self) -> Option<ReaderSurface> {
        self.state.lock().reader.clone()
    }

    /// Deliver `image` into the current session's reader, as the hardware
    /// would from its own thread.
    pub fn deliver(&self, image: MockImage) -> QueueOutcome {
        match self.reader() {
            Some(reader) => reader.queue_image(Box::new(image), Duration::from_secs(1)),
            None => QueueOutcome::Closed,
        }
    }

    fn camera(&self, id: &CameraId) -> Result<MockCamera> {
        self.state
            .lock()
            .cameras
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, camera)| camera.clone())
            .ok_or_else(|| CameraError::DeviceAccess(format!("no camera with id {id}")))
    }
}

impl CameraProvider for MockProvider {
    fn camera_ids(&self) -> Result<Vec<CameraId>> {
        Ok(self.state.lock().cameras.iter().map(|(id, _)| id.clone()).collect())
    }

    fn characteristics(&self, id: &CameraId) -> Result<CameraCharacteristics> {
        Ok(self.camera(id)?.characteristics)
    }

    fn open(&self, id: &CameraId, events: EventSender) -> Result<()> {
        let camera = self.camera(id)?;
        self.state.lock().opened.push(id.clone());
        match camera.open {
            OpenBehavior::Open => {
                events.send(CameraEvent::DeviceOpened(Box::new(MockDevice {
                    id: id.clone(),
                    session: camera.session,
                    state: Arc::clone(&self.state),
                    closed: false,
                })));
            }
            OpenBehavior::Refuse => {
                return Err(CameraError::DeviceAccess(format!("camera {id} is busy")));
            }
            OpenBehavior::Error(code) => {
                events.send(CameraEvent::DeviceError { code });
            }
            OpenBehavior::Disconnect => {
                events.send(CameraEvent::DeviceDisconnected);
            }
        }
        Ok(())
    }
}

/// Mock opened device.
#[derive(Debug)]
pub struct MockDevice {
    id: CameraId,
    session: SessionBehavior,
    state: Arc<Mutex<ProviderState>>,
    closed: bool,
}

impl CameraDevice for MockDevice {
    fn id(&self) -> &CameraId {
        &self.id
    }

    fn create_capture_session(&mut self, outputs: SessionOutputs, events: EventSender) -> Result<()> {
        match self.session {
            SessionBehavior::Configure => {
                self.state.lock().reader = Some(outputs.reader);
                events.send(CameraEvent::SessionConfigured(Box::new(MockSession {
                    state: Arc::clone(&self.state),
                    closed: false,
                })));
            }
            SessionBehavior::Fail => {
                events.send(CameraEvent::SessionConfigureFailed);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().closed_devices += 1;
        }
    }
}

/// Mock capture session.
#[derive(Debug)]
pub struct MockSession {
    state: Arc<Mutex<ProviderState>>,
    closed: bool,
}

impl CaptureSession for MockSession {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<()> {
        self.state.lock().requests.push(request.clone());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().closed_sessions += 1;
        }
    }
}

/// Mock preview surface recording what the camera helper configures.
#[derive(Debug)]
pub struct MockSurface {
    available: AtomicBool,
    size: Size,
    buffer_size: Mutex<Option<Size>>,
    transforms: Mutex<Vec<Affine>>,
}

impl MockSurface {
    /// A surface of `size`, available or not.
    pub fn new(size: Size, available: bool) -> Self {
        Self {
            available: AtomicBool::new(available),
            size,
            buffer_size: Mutex::new(None),
            transforms: Mutex::new(Vec::new()),
        }
    }

    /// Mark the surface available.
    pub fn make_available(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    /// Last default buffer size set.
    pub fn buffer_size(&self) -> Option<Size> {
        *self.buffer_size.lock()
    }

    /// Transforms set so far.
    pub fn transforms(&self) -> Vec<Affine> {
        self.transforms.lock().clone()
    }
}

impl PreviewSurface for MockSurface {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn size(&self) -> Size {
        self.size
    }

    fn set_default_buffer_size(&self, size: Size) {
        *self.buffer_size.lock() = Some(size);
    }

    fn set_transform(&self, transform: &Affine) {
        self.transforms.lock().push(*transform);
    }
}

/// Mock host context with a configurable denial map.
#[derive(Debug, Default)]
pub struct MockContext {
    denied: Mutex<BTreeMap<String, bool>>,
}

impl MockContext {
    /// A context granting everything.
    pub fn granting() -> Self {
        Self::default()
    }

    /// A context denying the camera.
    pub fn denying_camera() -> Self {
        let context = Self::default();
        context
            .denied
            .lock()
            .insert(Capability::Camera.name().to_owned(), false);
        context
    }
}

impl HostContext for MockContext {
    fn check_permissions(&self, capabilities: &[Capability]) -> BTreeMap<String, bool> {
        let denied = self.denied.lock();
        capabilities
            .iter()
            .filter_map(|capability| denied.get_key_value(capability.name()))
            .map(|(name, granted)| (name.clone(), *granted))
            .collect()
    }
}

/// What a [`RecordingListener`] observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// `on_camera_opened`.
    Opened {
        /// Negotiated size.
        size: Size,
        /// Display orientation.
        orientation: u32,
    },
    /// `on_camera_closed`.
    Closed,
    /// `on_camera_error`, with the error's message.
    Error(String),
    /// `on_preview_frame`, with a copy of the frame.
    Frame {
        /// Frame bytes.
        data: Vec<u8>,
        /// Frame size as laid out.
        size: Size,
        /// Source sequence number.
        sequence: u32,
    },
}

/// Listener forwarding every callback into a channel.
#[derive(Debug)]
pub struct RecordingListener {
    tx: Sender<ListenerEvent>,
    rx: Receiver<ListenerEvent>,
}

impl Default for RecordingListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingListener {
    /// Create an empty listener.
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    /// Everything observed so far.
    pub fn drain(&self) -> Vec<ListenerEvent> {
        self.rx.try_iter().collect()
    }

    /// Wait for the first event matching `predicate`, discarding others.
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> Option<ListenerEvent>
    where
        F: Fn(&ListenerEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let event = self.rx.recv_timeout(remaining).ok()?;
            if predicate(&event) {
                return Some(event);
            }
        }
    }
}

impl CameraListener for RecordingListener {
    fn on_camera_opened(&self, size: Size, display_orientation: u32) {
        let _ = self.tx.send(ListenerEvent::Opened {
            size,
            orientation: display_orientation,
        });
    }

    fn on_camera_closed(&self) {
        let _ = self.tx.send(ListenerEvent::Closed);
    }

    fn on_camera_error(&self, error: &CameraError) {
        let _ = self.tx.send(ListenerEvent::Error(error.to_string()));
    }

    fn on_preview_frame(&self, frame: &PlanarFrame<'_>) {
        let _ = self.tx.send(ListenerEvent::Frame {
            data: frame.data.to_vec(),
            size: frame.size(),
            sequence: frame.sequence,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_image_planes() {
        let image = MockImage::nv12_padded(8, 4, 0, 2);
        let luma = image.plane(0).expect("luma");
        let u = image.plane(1).expect("u");
        let v = image.plane(2).expect("v");

        assert_eq!(luma.row_stride, 10);
        assert_eq!(u.pixel_stride, 2);
        assert_eq!(u.data.first(), Some(&u_at(0, 0, 0)));
        assert_eq!(v.data.first(), Some(&v_at(0, 0, 0)));
        assert!(image.plane(3).is_none());
    }

    #[test]
    fn test_reference_frame_size() {
        let image = MockImage::i420(8, 4, 0);
        assert_eq!(image.planar_reference().len(), 8 * 4 * 3 / 2);
    }

    #[test]
    fn test_mock_context() {
        assert!(MockContext::granting()
            .check_permissions(&[Capability::Camera])
            .is_empty());
        let denied = MockContext::denying_camera().check_permissions(&[Capability::Camera]);
        assert_eq!(denied.get("camera"), Some(&false));
    }

    #[test]
    fn test_mock_provider_lists_cameras() {
        let provider = MockProvider::new()
            .with_camera("0", MockCamera::new(Facing::Back, 90, &[Size::new(640, 480)]))
            .with_camera("1", MockCamera::without_stream_map(Facing::Front));

        assert_eq!(
            provider.camera_ids().expect("ids"),
            vec![CameraId::back(), CameraId::front()]
        );
        let front = provider.characteristics(&CameraId::front()).expect("front");
        assert!(front.output_sizes.is_none());
        assert!(provider.characteristics(&CameraId::new("9")).is_err());
    }
}
