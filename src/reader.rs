//! The internal frame reader a capture session renders into.
//!
//! The reader owns a fixed ring of image slots. A backend takes a slot before
//! queuing an image and the slot returns when the capture thread drops the
//! [`AcquiredImage`], which also releases the hardware buffer. Once every
//! slot is out, the backend waits, just like a hardware reader with a fixed
//! number of buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use crate::events::{CameraEvent, EventSender};
use crate::traits::{HardwareImage, ImageFormat, Size};

#[derive(Debug)]
struct ReaderShared {
    size: Size,
    max_images: usize,
    slots_tx: Sender<()>,
    slots_rx: Receiver<()>,
    closed: AtomicBool,
    events: EventSender,
}

/// Owner side of the frame reader, held by the lifecycle manager.
#[derive(Debug)]
pub struct ImageReader {
    shared: Arc<ReaderShared>,
}

impl ImageReader {
    /// Create a reader for `size` frames with `max_images` slots that
    /// delivers into `events`.
    #[must_use]
    pub fn new(size: Size, max_images: usize, events: EventSender) -> Self {
        let max_images = max_images.max(1);
        let (slots_tx, slots_rx) = crossbeam_channel::bounded(max_images);
        for _ in 0..max_images {
            // The channel holds exactly `max_images` tokens.
            let _ = slots_tx.try_send(());
        }
        Self {
            shared: Arc::new(ReaderShared {
                size,
                max_images,
                slots_tx,
                slots_rx,
                closed: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Producer handle given to the capture session.
    #[must_use]
    pub fn surface(&self) -> ReaderSurface {
        ReaderSurface {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Frame size.
    #[must_use]
    pub fn size(&self) -> Size {
        self.shared.size
    }

    /// Slots not currently held by an image.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.shared.slots_rx.len()
    }

    /// Whether [`ImageReader::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop accepting images. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            debug!(size = %self.shared.size, "frame reader closed");
        }
    }
}

impl Drop for ImageReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Outcome of [`ReaderSurface::queue_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The image is on its way to the capture thread.
    Queued,
    /// No slot freed up in time; the image was released.
    Full,
    /// The reader is closed or its consumer is gone; the image was released.
    Closed,
}

/// Producer side of the frame reader, handed to capture sessions.
#[derive(Debug, Clone)]
pub struct ReaderSurface {
    shared: Arc<ReaderShared>,
}

impl ReaderSurface {
    /// Frame size the session should produce.
    #[must_use]
    pub fn size(&self) -> Size {
        self.shared.size
    }

    /// Layout the reader accepts.
    #[must_use]
    pub const fn format(&self) -> ImageFormat {
        ImageFormat::Yuv420
    }

    /// Number of images that can be outstanding at once.
    #[must_use]
    pub fn max_images(&self) -> usize {
        self.shared.max_images
    }

    /// Whether the owning reader has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Wait up to `timeout` for a free slot and queue `image`.
    ///
    /// Images that cannot be queued are released before returning.
    pub fn queue_image(&self, mut image: Box<dyn HardwareImage>, timeout: Duration) -> QueueOutcome {
        if self.is_closed() {
            image.close();
            return QueueOutcome::Closed;
        }

        match self.shared.slots_rx.recv_timeout(timeout) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                trace!("frame reader full, dropping image");
                image.close();
                return QueueOutcome::Full;
            }
            Err(RecvTimeoutError::Disconnected) => {
                image.close();
                return QueueOutcome::Closed;
            }
        }

        let acquired = AcquiredImage {
            image: Some(image),
            slot: self.shared.slots_tx.clone(),
        };
        if self.shared.events.send(CameraEvent::ImageAvailable(acquired)) {
            QueueOutcome::Queued
        } else {
            QueueOutcome::Closed
        }
    }
}

/// An image taken from the reader.
///
/// Dropping it closes the hardware image and returns its slot, exactly once.
pub struct AcquiredImage {
    image: Option<Box<dyn HardwareImage>>,
    slot: Sender<()>,
}

impl AcquiredImage {
    /// The underlying image, or `None` once released.
    #[must_use]
    pub fn image(&self) -> Option<&dyn HardwareImage> {
        self.image.as_deref()
    }

    /// Release the image now.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mut image) = self.image.take() {
            image.close();
            let _ = self.slot.try_send(());
        }
    }
}

impl Drop for AcquiredImage {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for AcquiredImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredImage")
            .field("released", &self.image.is_none())
            .finish_non_exhaustive()
    }
}
