//! V4L2 camera backend using the v4l crate.
//!
//! Each `/dev/videoN` capture node is exposed as a camera with id `N`. Frames
//! are captured as YU12, or NV12 when the driver does not offer YU12, and
//! handed to the frame reader as three-plane images.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};
use v4l::buffer::Type;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::events::{CameraEvent, EventSender};
use crate::reader::{QueueOutcome, ReaderSurface};
use crate::traits::{
    CameraCharacteristics, CameraDevice, CameraError, CameraId, CameraProvider, Capability,
    CaptureRequest, CaptureSession, Facing, FourCC, HardwareImage, HostContext, ImageFormat,
    OutputTarget, Plane, Result, SessionOutputs, Size,
};

/// Pixel formats the backend captures in, in order of preference.
const CAPTURE_FORMATS: [FourCC; 2] = [FourCC::YU12, FourCC::NV12];

/// Sizes probed on drivers reporting a stepwise or continuous range.
const STEPWISE_PROBES: [(u32, u32); 4] = [(640, 480), (1280, 720), (1920, 1080), (320, 240)];

const BUFFER_COUNT: u32 = 4;
const STREAM_TIMEOUT: Duration = Duration::from_millis(200);
const QUEUE_TIMEOUT: Duration = Duration::from_millis(50);

fn device_index(id: &CameraId) -> Result<usize> {
    id.as_str()
        .parse()
        .map_err(|_| CameraError::DeviceAccess(format!("not a V4L2 camera id: {id}")))
}

fn open_device(id: &CameraId) -> Result<Device> {
    let index = device_index(id)?;
    Device::new(index).map_err(|err| CameraError::DeviceAccess(format!("video{index}: {err}")))
}

fn error_code(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(-1)
}

/// Camera provider backed by the V4L2 capture nodes of this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4l2Provider;

impl V4l2Provider {
    /// Create a provider.
    pub const fn new() -> Self {
        Self
    }

    fn output_sizes(device: &Device) -> Vec<Size> {
        let mut sizes = Vec::new();
        for fourcc in CAPTURE_FORMATS {
            let Ok(frame_sizes) = device.enum_framesizes(fourcc.into()) else {
                continue;
            };
            for frame_size in frame_sizes {
                match frame_size.size {
                    FrameSizeEnum::Discrete(discrete) => {
                        sizes.push(Size::new(discrete.width, discrete.height));
                    }
                    FrameSizeEnum::Stepwise(step) => {
                        for (width, height) in STEPWISE_PROBES {
                            if (step.min_width..=step.max_width).contains(&width)
                                && (step.min_height..=step.max_height).contains(&height)
                            {
                                sizes.push(Size::new(width, height));
                            }
                        }
                    }
                }
            }
            if !sizes.is_empty() {
                break;
            }
        }
        sizes.dedup();
        sizes
    }
}

impl CameraProvider for V4l2Provider {
    fn camera_ids(&self) -> Result<Vec<CameraId>> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);
        Ok(nodes
            .iter()
            .map(|node| CameraId::new(node.index().to_string()))
            .collect())
    }

    fn characteristics(&self, id: &CameraId) -> Result<CameraCharacteristics> {
        let device = open_device(id)?;
        let caps = device
            .query_caps()
            .map_err(|err| CameraError::DeviceAccess(err.to_string()))?;
        let can_stream = caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE)
            && caps.capabilities.contains(v4l::capability::Flags::STREAMING);

        let sizes = if can_stream {
            Self::output_sizes(&device)
        } else {
            Vec::new()
        };
        debug!(camera_id = %id, card = %caps.card, sizes = sizes.len(), "queried camera");

        Ok(CameraCharacteristics {
            facing: Facing::External,
            sensor_orientation: 0,
            output_sizes: (!sizes.is_empty()).then_some(sizes),
        })
    }

    fn open(&self, id: &CameraId, events: EventSender) -> Result<()> {
        let index = device_index(id)?;
        let id = id.clone();
        thread::Builder::new()
            .name("camera-open".to_owned())
            .spawn(move || match Device::new(index) {
                Ok(device) => {
                    info!(camera_id = %id, "V4L2 device opened");
                    events.send(CameraEvent::DeviceOpened(Box::new(V4l2Camera {
                        id,
                        device: Arc::new(device),
                    })));
                }
                Err(err) => {
                    warn!(camera_id = %id, %err, "failed to open V4L2 device");
                    events.send(CameraEvent::DeviceError {
                        code: error_code(&err),
                    });
                }
            })
            .map_err(CameraError::ThreadSpawn)?;
        Ok(())
    }
}

/// An opened V4L2 capture node.
pub struct V4l2Camera {
    id: CameraId,
    device: Arc<Device>,
}

impl V4l2Camera {
    fn negotiate(&self, size: Size) -> Option<FrameLayout> {
        for fourcc in CAPTURE_FORMATS {
            let requested = v4l::Format::new(size.width, size.height, fourcc.into());
            match self.device.set_format(&requested) {
                Ok(actual) => {
                    let layout = FrameLayout {
                        fourcc: actual.fourcc.into(),
                        width: actual.width,
                        height: actual.height,
                        stride: actual.stride as usize,
                    };
                    if layout.fourcc == fourcc && layout.size() == size {
                        return Some(layout);
                    }
                    debug!(requested = %fourcc, actual = %layout.fourcc, size = %layout.size(), "format not accepted");
                }
                Err(err) => debug!(format = %fourcc, %err, "failed to set format"),
            }
        }
        None
    }
}

impl CameraDevice for V4l2Camera {
    fn id(&self) -> &CameraId {
        &self.id
    }

    fn create_capture_session(
        &mut self,
        outputs: SessionOutputs,
        events: EventSender,
    ) -> Result<()> {
        let size = outputs.reader.size();
        match self.negotiate(size) {
            Some(layout) => {
                info!(camera_id = %self.id, format = %layout.fourcc, %size, stride = layout.stride, "capture session configured");
                events.send(CameraEvent::SessionConfigured(Box::new(V4l2Session {
                    device: Arc::clone(&self.device),
                    layout,
                    reader: outputs.reader,
                    events: events.clone(),
                    pump: None,
                })));
            }
            None => {
                warn!(camera_id = %self.id, %size, "no planar 4:2:0 format at the requested size");
                events.send(CameraEvent::SessionConfigureFailed);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        debug!(camera_id = %self.id, "closing V4L2 device");
    }
}

struct Pump {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Streaming session on a V4L2 capture node.
pub struct V4l2Session {
    device: Arc<Device>,
    layout: FrameLayout,
    reader: ReaderSurface,
    events: EventSender,
    pump: Option<Pump>,
}

impl CaptureSession for V4l2Session {
    fn set_repeating_request(&mut self, request: &CaptureRequest) -> Result<()> {
        if !request.targets.contains(&OutputTarget::Reader) {
            debug!("request does not target the frame reader, nothing to stream");
            return Ok(());
        }
        if self.pump.is_some() {
            return Ok(());
        }
        debug!(af_mode = ?request.af_mode, template = ?request.template, "starting V4L2 stream");

        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let pump = StreamPump {
            device: Arc::clone(&self.device),
            layout: self.layout,
            reader: self.reader.clone(),
            events: self.events.clone(),
            running: Arc::clone(&running),
        };
        let handle = thread::Builder::new()
            .name("camera-stream".to_owned())
            .spawn(move || pump.run(&ready_tx))
            .map_err(CameraError::ThreadSpawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.pump = Some(Pump { running, handle });
                Ok(())
            }
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(CameraError::DeviceAccess(format!("failed to start stream: {err}")))
            }
            Err(_) => {
                let _ = handle.join();
                Err(CameraError::DeviceAccess("stream thread exited".to_owned()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.running.store(false, Ordering::SeqCst);
            if pump.handle.join().is_err() {
                warn!("V4L2 stream thread panicked");
            }
            debug!("V4L2 stream stopped");
        }
    }
}

impl Drop for V4l2Session {
    fn drop(&mut self) {
        self.close();
    }
}

struct StreamPump {
    device: Arc<Device>,
    layout: FrameLayout,
    reader: ReaderSurface,
    events: EventSender,
    running: Arc<AtomicBool>,
}

impl StreamPump {
    fn run(self, ready: &crossbeam_channel::Sender<io::Result<()>>) {
        let mut stream = match Stream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT) {
            Ok(stream) => stream,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        stream.set_timeout(STREAM_TIMEOUT);
        let _ = ready.send(Ok(()));

        let mut dropped: u64 = 0;
        while self.running.load(Ordering::SeqCst) {
            match stream.next() {
                Ok((buf, meta)) => {
                    let image = V4l2Image::new(self.layout, buf.to_vec(), meta.sequence);
                    match self.reader.queue_image(Box::new(image), QUEUE_TIMEOUT) {
                        QueueOutcome::Queued => {}
                        QueueOutcome::Full => {
                            dropped += 1;
                            trace!(sequence = meta.sequence, dropped, "frame reader full, dropping frame");
                        }
                        QueueOutcome::Closed => break,
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => {
                    warn!(%err, "V4L2 capture failed");
                    self.events.send(CameraEvent::DeviceError {
                        code: error_code(&err),
                    });
                    break;
                }
            }
        }
        debug!(dropped, "V4L2 stream pump exiting");
    }
}

/// Negotiated capture format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameLayout {
    fourcc: FourCC,
    width: u32,
    height: u32,
    /// Bytes per luma row.
    stride: usize,
}

impl FrameLayout {
    const fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// `(offset, row_stride, pixel_stride)` of each plane.
    fn planes(&self) -> [(usize, usize, usize); 3] {
        let luma_len = self.stride * self.height as usize;
        if self.fourcc == FourCC::NV12 {
            [
                (0, self.stride, 1),
                (luma_len, self.stride, 2),
                (luma_len + 1, self.stride, 2),
            ]
        } else {
            let chroma_stride = self.stride / 2;
            let chroma_len = chroma_stride * (self.height as usize / 2);
            [
                (0, self.stride, 1),
                (luma_len, chroma_stride, 1),
                (luma_len + chroma_len, chroma_stride, 1),
            ]
        }
    }
}

/// One captured V4L2 frame, copied out of the driver's buffer.
#[derive(Debug)]
pub struct V4l2Image {
    layout: FrameLayout,
    data: Vec<u8>,
    sequence: u32,
}

impl V4l2Image {
    fn new(layout: FrameLayout, data: Vec<u8>, sequence: u32) -> Self {
        Self {
            layout,
            data,
            sequence,
        }
    }
}

impl HardwareImage for V4l2Image {
    fn format(&self) -> ImageFormat {
        if CAPTURE_FORMATS.contains(&self.layout.fourcc) {
            ImageFormat::Yuv420
        } else {
            ImageFormat::Other(self.layout.fourcc)
        }
    }

    fn width(&self) -> u32 {
        self.layout.width
    }

    fn height(&self) -> u32 {
        self.layout.height
    }

    fn plane(&self, index: usize) -> Option<Plane<'_>> {
        let (offset, row_stride, pixel_stride) = *self.layout.planes().get(index)?;
        Some(Plane {
            data: self.data.get(offset..)?,
            row_stride,
            pixel_stride,
        })
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn close(&mut self) {
        self.data = Vec::new();
    }
}

/// Host context that grants the camera when a V4L2 capture node can be
/// opened for reading and writing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NodeAccessContext;

impl NodeAccessContext {
    fn camera_accessible() -> bool {
        let nodes = v4l::context::enum_devices();
        if nodes.is_empty() {
            return true;
        }
        nodes.iter().any(|node| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(node.path())
                .is_ok()
        })
    }
}

impl HostContext for NodeAccessContext {
    fn check_permissions(&self, capabilities: &[Capability]) -> BTreeMap<String, bool> {
        capabilities
            .iter()
            .filter(|capability| match capability {
                Capability::Camera => !Self::camera_accessible(),
                Capability::RecordAudio => false,
            })
            .map(|capability| (capability.name().to_owned(), false))
            .collect()
    }
}
