//! Camera device lifecycle management.
//!
//! [`CameraHelper`] is driven from a single control thread through
//! [`start`](CameraHelper::start), [`stop`](CameraHelper::stop) and
//! [`switch_camera`](CameraHelper::switch_camera). Everything else happens on
//! a dedicated capture thread, which owns the open device, the capture
//! session, the frame reader and the frame converter, and processes
//! [`CameraEvent`]s strictly in arrival order:
//!
//! ```text
//! Idle -> Opening -> PreviewReady -> Closing -> Idle
//!            |             |
//!            +--> Error <--+
//! ```

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::CameraConfig;
use crate::convert::FrameConverter;
use crate::events::{self, CameraEvent, EventReceiver, EventSender};
use crate::gate::{OpenCloseLock, Permit};
use crate::geometry::{choose_best_size, display_orientation, preview_transform};
use crate::reader::{AcquiredImage, ImageReader};
use crate::traits::{
    CameraDevice, CameraError, CameraId, CameraListener, CameraProvider, Capability,
    CaptureRequest, CaptureSession, Facing, HostContext, PreviewSurface, Result, SessionOutputs,
    Size, SurfaceEvent,
};

const CAPTURE_THREAD_NAME: &str = "camera-capture";
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Lifecycle state of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No camera open.
    Idle,
    /// Waiting for the device to open.
    Opening,
    /// The repeating preview request is running.
    PreviewReady,
    /// Tearing down.
    Closing,
    /// The last open or configuration attempt failed.
    Error,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<LifecycleState>,
    camera_id: Mutex<Option<CameraId>>,
}

impl Shared {
    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock();
        let previous = *state;
        if previous != next {
            debug!(from = ?previous, to = ?next, "camera state changed");
            *state = next;
        }
    }
}

struct Worker {
    events: EventSender,
    handle: JoinHandle<()>,
}

/// Opens, configures and tears down a camera, and streams converted frames
/// to a [`CameraListener`].
pub struct CameraHelper {
    provider: Arc<dyn CameraProvider>,
    surface: Arc<dyn PreviewSurface>,
    listener: Arc<dyn CameraListener>,
    context: Weak<dyn HostContext>,
    config: CameraConfig,
    requested_id: CameraId,
    lock: Arc<OpenCloseLock>,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl CameraHelper {
    /// Create a helper. Nothing is opened until [`CameraHelper::start`].
    ///
    /// `context` is not kept alive by the helper; if it is gone when a camera
    /// is opened, the attempt fails with [`CameraError::ContextGone`].
    pub fn new(
        provider: Arc<dyn CameraProvider>,
        surface: Arc<dyn PreviewSurface>,
        listener: Arc<dyn CameraListener>,
        context: Weak<dyn HostContext>,
        config: CameraConfig,
    ) -> Self {
        let requested_id = config.camera_id.clone();
        Self {
            provider,
            surface,
            listener,
            context,
            config,
            requested_id,
            lock: OpenCloseLock::new(),
            shared: Arc::new(Shared {
                state: Mutex::new(LifecycleState::Idle),
                camera_id: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// Start the capture thread and open the requested camera, or wait for
    /// the preview surface if it is not available yet.
    ///
    /// When the thread is already running, the camera is reopened only if a
    /// device error or disconnect left it `Idle` or in `Error`.
    pub fn start(&mut self) {
        if let Some(worker) = &self.worker {
            let state = self.state();
            if matches!(state, LifecycleState::Idle | LifecycleState::Error) {
                info!(camera_id = %self.requested_id, ?state, "reopening camera");
                worker.events.send(CameraEvent::Open);
            } else {
                debug!("camera already started");
            }
            return;
        }

        let (events, receiver) = events::channel();
        let capture = CaptureLoop {
            provider: Arc::clone(&self.provider),
            surface: Arc::clone(&self.surface),
            listener: Arc::clone(&self.listener),
            context: self.context.clone(),
            config: self.config.clone(),
            requested_id: self.requested_id.clone(),
            lock: Arc::clone(&self.lock),
            shared: Arc::clone(&self.shared),
            events: events.clone(),
            converter: FrameConverter::new(self.config.rotation),
            open_pending: false,
            opening_permit: None,
            session: None,
        };

        let spawned = thread::Builder::new()
            .name(CAPTURE_THREAD_NAME.to_owned())
            .spawn(move || capture.run(&receiver));

        match spawned {
            Ok(handle) => {
                info!(camera_id = %self.requested_id, "camera capture thread started");
                events.send(CameraEvent::Open);
                self.worker = Some(Worker { events, handle });
            }
            Err(err) => {
                error!(%err, "failed to start camera capture thread");
                self.shared.set_state(LifecycleState::Error);
                self.listener.on_camera_error(&CameraError::ThreadSpawn(err));
            }
        }
    }

    /// Close the session, device and frame reader, then stop the capture
    /// thread. No-op when not started.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        info!("stopping camera");

        // The capture thread may wait up to the close timeout for the permit
        // before it starts tearing down.
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let ack_timeout = self.config.close_timeout().saturating_mul(2);
        if worker.events.send(CameraEvent::Close { done: done_tx })
            && done_rx.recv_timeout(ack_timeout).is_err()
        {
            warn!("capture thread did not finish closing in time");
        }

        worker.events.send(CameraEvent::Shutdown);
        join_with_timeout(worker.handle, self.config.thread_join_timeout());
    }

    /// Switch between the front and back cameras by stopping and restarting.
    ///
    /// Ids other than the two conventional ones are left unchanged, so the
    /// same camera is reopened.
    pub fn switch_camera(&mut self) {
        let current = self
            .current_camera()
            .unwrap_or_else(|| self.requested_id.clone());
        if let Some(next) = current.toggled() {
            info!(from = %current, to = %next, "switching camera");
            self.requested_id = next;
        } else {
            debug!(camera_id = %current, "no opposite camera, reopening");
        }
        self.stop();
        self.start();
    }

    /// Forward a preview surface signal to the capture thread.
    pub fn surface_event(&self, event: SurfaceEvent) {
        match &self.worker {
            Some(worker) => {
                worker.events.send(CameraEvent::Surface(event));
            }
            None => trace!(?event, "camera not started, ignoring surface event"),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock()
    }

    /// Whether the capture thread is running.
    pub const fn is_started(&self) -> bool {
        self.worker.is_some()
    }

    /// Camera the next start will try first.
    pub const fn requested_camera(&self) -> &CameraId {
        &self.requested_id
    }

    /// Camera most recently configured for output.
    pub fn current_camera(&self) -> Option<CameraId> {
        self.shared.camera_id.lock().clone()
    }

    /// Open/close permits currently available.
    pub fn available_permits(&self) -> usize {
        self.lock.available_permits()
    }

    /// Configuration the helper was built with.
    pub const fn config(&self) -> &CameraConfig {
        &self.config
    }
}

impl Drop for CameraHelper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(?timeout, "capture thread did not exit in time, detaching it");
            return;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    if handle.join().is_err() {
        error!("camera capture thread panicked");
    }
}

/// The open camera, owned by the capture thread.
struct CameraSession {
    id: CameraId,
    facing: Facing,
    sensor_orientation: u32,
    preview_size: Size,
    reader: ImageReader,
    device: Option<Box<dyn CameraDevice>>,
    capture: Option<Box<dyn CaptureSession>>,
}

impl CameraSession {
    /// Close everything in reverse order of creation. Returns whether a
    /// device had been open.
    fn close(mut self) -> bool {
        if let Some(mut capture) = self.capture.take() {
            capture.close();
        }
        let had_device = match self.device.take() {
            Some(mut device) => {
                device.close();
                true
            }
            None => false,
        };
        self.reader.close();
        debug!(camera_id = %self.id, "camera session closed");
        had_device
    }
}

struct CaptureLoop {
    provider: Arc<dyn CameraProvider>,
    surface: Arc<dyn PreviewSurface>,
    listener: Arc<dyn CameraListener>,
    context: Weak<dyn HostContext>,
    config: CameraConfig,
    requested_id: CameraId,
    lock: Arc<OpenCloseLock>,
    shared: Arc<Shared>,
    events: EventSender,
    converter: FrameConverter,
    open_pending: bool,
    opening_permit: Option<Permit>,
    session: Option<CameraSession>,
}

impl CaptureLoop {
    fn run(mut self, receiver: &EventReceiver) {
        debug!("capture loop running");
        for event in receiver {
            if matches!(event, CameraEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        self.release_session();
        debug!("capture loop exiting");
    }

    fn handle(&mut self, event: CameraEvent) {
        trace!(?event, "camera event");
        match event {
            CameraEvent::Open => self.request_open(),
            CameraEvent::Surface(event) => self.on_surface(event),
            CameraEvent::DeviceOpened(device) => self.on_device_opened(device),
            CameraEvent::DeviceDisconnected => self.on_device_disconnected(),
            CameraEvent::DeviceError { code } => self.on_device_error(code),
            CameraEvent::SessionConfigured(capture) => self.on_session_configured(capture),
            CameraEvent::SessionConfigureFailed => {
                warn!("capture session configuration failed");
                self.fail(CameraError::ConfigureFailed);
            }
            CameraEvent::ImageAvailable(image) => self.on_image(image),
            CameraEvent::Close { done } => {
                self.close_camera();
                let _ = done.send(());
            }
            CameraEvent::Shutdown => {}
        }
    }

    fn set_state(&self, state: LifecycleState) {
        self.shared.set_state(state);
    }

    fn fail(&self, err: CameraError) {
        error!(%err, "camera error");
        self.set_state(LifecycleState::Error);
        self.listener.on_camera_error(&err);
    }

    fn request_open(&mut self) {
        if self.surface.is_available() {
            self.open_camera();
        } else {
            debug!("preview surface not available, deferring open");
            self.open_pending = true;
        }
    }

    fn on_surface(&mut self, event: SurfaceEvent) {
        match event {
            SurfaceEvent::Available(size) => {
                debug!(%size, "preview surface available");
                if std::mem::take(&mut self.open_pending) {
                    self.open_camera();
                }
            }
            SurfaceEvent::SizeChanged(size) => {
                debug!(%size, "preview surface resized");
                if let Some(session) = &self.session {
                    self.configure_transform(size, session.preview_size);
                }
            }
            SurfaceEvent::Destroyed => debug!("preview surface destroyed"),
            SurfaceEvent::Updated => trace!("preview surface updated"),
        }
    }

    fn open_camera(&mut self) {
        if self.session.is_some() {
            debug!("camera already open");
            return;
        }

        let Some(context) = self.context.upgrade() else {
            self.fail(CameraError::ContextGone);
            return;
        };
        let denied = context.check_permissions(&[Capability::Camera]);
        drop(context);
        if !denied.is_empty() {
            let names: Vec<&String> = denied.keys().collect();
            info!(denied = ?names, "camera permission not granted, skipping open");
            self.set_state(LifecycleState::Idle);
            return;
        }

        let session = match self.setup_camera_output() {
            Ok(session) => session,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        self.configure_transform(self.surface.size(), session.preview_size);

        let Some(permit) = self.lock.try_acquire_for(self.config.open_lock_timeout()) else {
            self.fail(CameraError::LockTimeout("opening"));
            return;
        };

        let id = session.id.clone();
        info!(camera_id = %id, size = %session.preview_size, "opening camera");
        self.session = Some(session);
        self.set_state(LifecycleState::Opening);

        match self.provider.open(&id, self.events.clone()) {
            Ok(()) => self.opening_permit = Some(permit),
            Err(err) => {
                drop(permit);
                self.release_session();
                self.fail(err);
            }
        }
    }

    /// Configure the requested camera, falling back to the first other
    /// camera with a usable stream configuration.
    fn setup_camera_output(&self) -> Result<CameraSession> {
        match self.configure_camera(&self.requested_id) {
            Ok(Some(session)) => return Ok(session),
            Ok(None) => {
                debug!(camera_id = %self.requested_id, "no stream configuration, trying other cameras");
            }
            Err(err) => {
                warn!(camera_id = %self.requested_id, %err, "requested camera unavailable, trying other cameras");
            }
        }

        for id in self.provider.camera_ids()? {
            if id == self.requested_id {
                continue;
            }
            match self.configure_camera(&id) {
                Ok(Some(session)) => return Ok(session),
                Ok(None) => debug!(camera_id = %id, "no stream configuration"),
                Err(err) => debug!(camera_id = %id, %err, "camera unavailable"),
            }
        }
        Err(CameraError::NoUsableCamera)
    }

    fn configure_camera(&self, id: &CameraId) -> Result<Option<CameraSession>> {
        let characteristics = self.provider.characteristics(id)?;
        let Some(sizes) = characteristics.output_sizes else {
            return Ok(None);
        };
        let Some(preview_size) = choose_best_size(&sizes, self.config.target_size) else {
            return Ok(None);
        };

        debug!(
            camera_id = %id,
            size = %preview_size,
            sensor_orientation = characteristics.sensor_orientation,
            "camera output configured"
        );
        *self.shared.camera_id.lock() = Some(id.clone());
        Ok(Some(CameraSession {
            id: id.clone(),
            facing: characteristics.facing,
            sensor_orientation: characteristics.sensor_orientation,
            preview_size,
            reader: ImageReader::new(
                preview_size,
                self.config.reader_max_images as usize,
                self.events.clone(),
            ),
            device: None,
            capture: None,
        }))
    }

    #[allow(clippy::cast_precision_loss)]
    fn configure_transform(&self, view: Size, preview_size: Size) {
        let transform = preview_transform(
            view.width as f32,
            view.height as f32,
            preview_size,
            self.config.display_rotation,
        );
        self.surface.set_transform(&transform);
    }

    fn on_device_opened(&mut self, mut device: Box<dyn CameraDevice>) {
        drop(self.opening_permit.take());

        let Some(session) = self.session.as_mut() else {
            debug!(camera_id = %device.id(), "device opened after close, closing it");
            device.close();
            return;
        };
        if session.device.is_some() {
            warn!(camera_id = %device.id(), "second device opened, closing it");
            device.close();
            return;
        }

        info!(camera_id = %device.id(), "camera opened");
        self.surface.set_default_buffer_size(session.preview_size);
        let outputs = SessionOutputs {
            preview: Arc::clone(&self.surface),
            reader: session.reader.surface(),
        };
        let created = device.create_capture_session(outputs, self.events.clone());
        session.device = Some(device);

        let size = session.preview_size;
        let orientation = display_orientation(
            session.sensor_orientation,
            self.config.display_rotation.degrees(),
            session.facing,
        );

        match created {
            Ok(()) => {
                debug!(orientation, "reporting camera opened");
                self.listener.on_camera_opened(size, orientation);
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_device_disconnected(&mut self) {
        drop(self.opening_permit.take());
        info!("camera disconnected");
        if self.release_session() {
            self.listener.on_camera_closed();
        }
        self.set_state(LifecycleState::Idle);
    }

    fn on_device_error(&mut self, code: i32) {
        drop(self.opening_permit.take());
        self.release_session();
        self.fail(CameraError::Device { code });
    }

    fn on_session_configured(&mut self, mut capture: Box<dyn CaptureSession>) {
        let Some(session) = self.session.as_mut().filter(|session| session.device.is_some()) else {
            debug!("session configured without an open device, closing it");
            capture.close();
            return;
        };

        let request = CaptureRequest::preview();
        let submitted = capture.set_repeating_request(&request);
        session.capture = Some(capture);
        match submitted {
            Ok(()) => {
                info!(camera_id = %session.id, "preview running");
                self.set_state(LifecycleState::PreviewReady);
            }
            Err(err) => self.fail(err),
        }
    }

    fn on_image(&self, image: AcquiredImage) {
        match &self.session {
            Some(session) if !session.reader.is_closed() => {
                self.converter.process(image, self.listener.as_ref());
            }
            _ => trace!("image arrived after close, releasing it"),
        }
    }

    fn close_camera(&mut self) {
        self.set_state(LifecycleState::Closing);
        // A pending open is abandoned; a device that opens later is closed
        // on arrival.
        drop(self.opening_permit.take());
        let permit = self.lock.try_acquire_for(self.config.close_timeout());
        if permit.is_none() {
            warn!("open/close permit not acquired, closing anyway");
            self.listener
                .on_camera_error(&CameraError::LockTimeout("closing"));
        }
        if self.release_session() {
            self.listener.on_camera_closed();
        }
        drop(permit);
        self.set_state(LifecycleState::Idle);
    }

    /// Close and forget the current session. Returns whether a device had
    /// been open.
    fn release_session(&mut self) -> bool {
        self.session.take().is_some_and(CameraSession::close)
    }
}
