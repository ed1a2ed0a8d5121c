//! Conversion of hardware 4:2:0 images into one contiguous planar buffer.
//!
//! Hardware images describe each plane with its own row stride and pixel
//! stride. Chroma may be fully planar (pixel stride 1) or interleaved with the
//! other chroma channel (pixel stride 2). The converter walks every plane
//! honoring both strides and writes `Y`, then `U`, then `V` into a scratch
//! buffer of `width * height * 3 / 2` bytes, optionally rotates it, and lends
//! the result to the listener.

use parking_lot::{Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::geometry::Rotation;
use crate::reader::AcquiredImage;
use crate::traits::{CameraError, CameraListener, HardwareImage, ImageFormat, Plane, Result, Size};

/// A converted frame lent to the listener.
#[derive(Debug, Clone, Copy)]
pub struct PlanarFrame<'a> {
    /// `Y` plane followed by the two quarter-size chroma planes.
    pub data: &'a [u8],
    /// Width of the frame as laid out in `data`.
    pub width: u32,
    /// Height of the frame as laid out in `data`.
    pub height: u32,
    /// Hardware sequence number of the source image.
    pub sequence: u32,
}

impl PlanarFrame<'_> {
    /// Frame size as laid out in `data`.
    #[must_use]
    pub const fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// The luma plane.
    #[must_use]
    pub fn luma(&self) -> &[u8] {
        let len = self.width as usize * self.height as usize;
        self.data.get(..len).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Scratch {
    planar: Vec<u8>,
    rotated: Vec<u8>,
}

/// Scratch buffers reused across frames.
///
/// One buffer receives the assembled planar frame; a second, allocated only
/// when a rotation is configured, receives the rotated copy. Both are resized
/// when the frame size changes and otherwise never reallocated.
#[derive(Debug, Default)]
pub struct BufferPool {
    scratch: Mutex<Scratch>,
}

impl BufferPool {
    /// Create an empty pool. Buffers are sized on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the scratch buffers for one frame of `frame_len` bytes.
    ///
    /// Blocks while another conversion holds them.
    pub fn acquire(&self, frame_len: usize) -> PooledBuffers<'_> {
        let mut scratch = self.scratch.lock();
        if scratch.planar.len() != frame_len {
            trace!(frame_len, "resizing planar scratch buffer");
            scratch.planar.resize(frame_len, 0);
        }
        PooledBuffers { scratch, frame_len }
    }

    /// Hand buffers back to the pool.
    pub fn release(&self, buffers: PooledBuffers<'_>) {
        drop(buffers);
    }

    /// Current byte capacity of the planar and rotated buffers.
    pub fn capacity(&self) -> (usize, usize) {
        let scratch = self.scratch.lock();
        (scratch.planar.capacity(), scratch.rotated.capacity())
    }
}

/// Exclusive access to the pool's scratch buffers.
#[derive(Debug)]
pub struct PooledBuffers<'a> {
    scratch: MutexGuard<'a, Scratch>,
    frame_len: usize,
}

impl PooledBuffers<'_> {
    /// The planar buffer.
    pub fn planar(&self) -> &[u8] {
        &self.scratch.planar
    }

    /// The planar buffer, mutably.
    pub fn planar_mut(&mut self) -> &mut [u8] {
        &mut self.scratch.planar
    }

    /// The planar buffer as the source and the rotated buffer as the
    /// destination of a rotation.
    pub fn rotation_pair(&mut self) -> (&[u8], &mut [u8]) {
        let frame_len = self.frame_len;
        let scratch = &mut *self.scratch;
        if scratch.rotated.len() != frame_len {
            trace!(frame_len, "resizing rotation scratch buffer");
            scratch.rotated.resize(frame_len, 0);
        }
        (&scratch.planar, &mut scratch.rotated)
    }

    /// The rotated buffer.
    pub fn rotated(&self) -> &[u8] {
        &self.scratch.rotated
    }
}

/// What happened to an image handed to [`FrameConverter::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertOutcome {
    /// A frame reached the listener.
    Delivered,
    /// The image was not 4:2:0 and was ignored.
    Unsupported,
    /// The image did not match its declared layout and was dropped.
    Malformed,
}

/// Converts reader images into planar frames for the listener.
#[derive(Debug)]
pub struct FrameConverter {
    rotation: Rotation,
    pool: BufferPool,
}

impl FrameConverter {
    /// Create a converter applying `rotation` to every frame.
    #[must_use]
    pub fn new(rotation: Rotation) -> Self {
        Self {
            rotation,
            pool: BufferPool::new(),
        }
    }

    /// Configured rotation.
    #[must_use]
    pub const fn rotation(&self) -> Rotation {
        self.rotation
    }

    /// Scratch buffer pool.
    #[must_use]
    pub const fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Convert `image` and hand the result to `listener`.
    ///
    /// The image is released before this returns, whatever the outcome.
    pub fn process(&self, image: AcquiredImage, listener: &dyn CameraListener) -> ConvertOutcome {
        let outcome = match image.image() {
            Some(hw) if hw.format() == ImageFormat::Yuv420 => self.deliver(hw, listener),
            Some(hw) => {
                trace!(format = ?hw.format(), "ignoring image in unsupported format");
                ConvertOutcome::Unsupported
            }
            None => ConvertOutcome::Unsupported,
        };
        image.release();
        outcome
    }

    fn deliver(&self, image: &dyn HardwareImage, listener: &dyn CameraListener) -> ConvertOutcome {
        let size = Size::new(image.width(), image.height());
        if let Err(err) = check_dimensions(size) {
            warn!(%err, "dropping frame");
            return ConvertOutcome::Malformed;
        }

        // Held across copy, rotation and callback so the listener never sees
        // a half-written buffer.
        let mut buffers = self.pool.acquire(size.planar_len());
        if let Err(err) = fill_planar(image, buffers.planar_mut()) {
            warn!(%err, "dropping frame");
            return ConvertOutcome::Malformed;
        }

        let out_size = self.rotation.rotated_size(size);
        let sequence = image.sequence();
        match self.rotation {
            Rotation::Deg0 => {
                listener.on_preview_frame(&PlanarFrame {
                    data: buffers.planar(),
                    width: out_size.width,
                    height: out_size.height,
                    sequence,
                });
            }
            Rotation::Deg90 | Rotation::Deg180 => {
                let (src, dst) = buffers.rotation_pair();
                let rotated = if self.rotation == Rotation::Deg90 {
                    rotate_i420_90(dst, src, size.width, size.height)
                } else {
                    rotate_i420_180(dst, src, size.width, size.height)
                };
                if let Err(err) = rotated {
                    warn!(%err, "dropping frame");
                    return ConvertOutcome::Malformed;
                }
                listener.on_preview_frame(&PlanarFrame {
                    data: buffers.rotated(),
                    width: out_size.width,
                    height: out_size.height,
                    sequence,
                });
            }
        }
        self.pool.release(buffers);
        ConvertOutcome::Delivered
    }
}

fn check_dimensions(size: Size) -> Result<()> {
    if size.width == 0 || size.height == 0 || size.width % 2 != 0 || size.height % 2 != 0 {
        return Err(CameraError::InvalidImage(format!(
            "4:2:0 frames need even, non-zero dimensions, got {size}"
        )));
    }
    Ok(())
}

fn missing_plane(index: usize) -> CameraError {
    CameraError::InvalidImage(format!("plane {index} is missing"))
}

/// Assemble the planes of `image` into `dst` as `Y`, `U`, `V`.
///
/// `dst` must be exactly `width * height * 3 / 2` bytes.
pub fn fill_planar(image: &dyn HardwareImage, dst: &mut [u8]) -> Result<()> {
    let size = Size::new(image.width(), image.height());
    check_dimensions(size)?;
    if dst.len() != size.planar_len() {
        return Err(CameraError::InvalidImage(format!(
            "destination holds {} bytes, frame {size} needs {}",
            dst.len(),
            size.planar_len()
        )));
    }

    let width = size.width as usize;
    let height = size.height as usize;
    let luma_len = width * height;
    let chroma_len = luma_len / 4;

    let (luma, chroma) = dst
        .split_at_mut_checked(luma_len)
        .ok_or_else(|| missing_plane(0))?;
    let (first, second) = chroma
        .split_at_mut_checked(chroma_len)
        .ok_or_else(|| missing_plane(1))?;

    copy_plane(image.plane(0).ok_or_else(|| missing_plane(0))?, width, height, luma, 0)?;
    copy_plane(image.plane(1).ok_or_else(|| missing_plane(1))?, width / 2, height / 2, first, 1)?;
    copy_plane(image.plane(2).ok_or_else(|| missing_plane(2))?, width / 2, height / 2, second, 2)?;
    Ok(())
}

/// Copy a `width` x `height` sample grid out of `plane` into `dst`.
///
/// Row `r` starts `r * row_stride` bytes into the plane; samples within a row
/// are `pixel_stride` bytes apart. For a chroma plane with pixel stride 2 this
/// skips the interleaved samples of the other channel.
fn copy_plane(plane: Plane<'_>, width: usize, height: usize, dst: &mut [u8], index: usize) -> Result<()> {
    let Plane {
        data,
        row_stride,
        pixel_stride,
    } = plane;

    if !(1..=2).contains(&pixel_stride) {
        return Err(CameraError::InvalidImage(format!(
            "plane {index} has unsupported pixel stride {pixel_stride}"
        )));
    }
    let row_span = (width - 1) * pixel_stride + 1;
    if row_stride < row_span {
        return Err(CameraError::InvalidImage(format!(
            "plane {index} row stride {row_stride} is shorter than a row ({row_span} bytes)"
        )));
    }

    for (row, dst_row) in dst.chunks_exact_mut(width).take(height).enumerate() {
        let start = row * row_stride;
        let src_row = data.get(start..start + row_span).ok_or_else(|| {
            CameraError::InvalidImage(format!(
                "plane {index} ends before row {row} ({} bytes)",
                data.len()
            ))
        })?;
        if pixel_stride == 1 {
            dst_row.copy_from_slice(src_row);
        } else {
            for (sample, src) in dst_row.iter_mut().zip(src_row.iter().step_by(pixel_stride)) {
                *sample = *src;
            }
        }
    }
    Ok(())
}

/// Split a planar 4:2:0 buffer of `width` x `height` into its three planes.
fn split_planes(buf: &[u8], width: usize, height: usize) -> Result<(&[u8], &[u8], &[u8])> {
    let luma_len = width * height;
    let chroma_len = luma_len / 4;
    let (luma, chroma) = buf.split_at_checked(luma_len).ok_or_else(|| missing_plane(0))?;
    let (first, second) = chroma.split_at_checked(chroma_len).ok_or_else(|| missing_plane(1))?;
    Ok((luma, first, second))
}

fn split_planes_mut(buf: &mut [u8], width: usize, height: usize) -> Result<(&mut [u8], &mut [u8], &mut [u8])> {
    let luma_len = width * height;
    let chroma_len = luma_len / 4;
    let (luma, chroma) = buf
        .split_at_mut_checked(luma_len)
        .ok_or_else(|| missing_plane(0))?;
    let (first, second) = chroma
        .split_at_mut_checked(chroma_len)
        .ok_or_else(|| missing_plane(1))?;
    Ok((luma, first, second))
}

fn check_buffers(dst: &[u8], src: &[u8], size: Size) -> Result<()> {
    check_dimensions(size)?;
    let expected = size.planar_len();
    if src.len() != expected || dst.len() != expected {
        return Err(CameraError::InvalidImage(format!(
            "rotation of a {size} frame needs {expected}-byte buffers, got {} and {}",
            src.len(),
            dst.len()
        )));
    }
    Ok(())
}

/// Rotate one `width` x `height` plane a quarter turn clockwise.
///
/// The source pixel at `(x, y)` lands at column `height - 1 - y`, row `x` of a
/// `height`-wide destination.
fn rotate_plane_90(dst: &mut [u8], src: &[u8], width: usize, height: usize) {
    for (y, src_row) in src.chunks_exact(width).take(height).enumerate() {
        let column = height - 1 - y;
        for (dst_sample, &sample) in dst.iter_mut().skip(column).step_by(height).zip(src_row) {
            *dst_sample = sample;
        }
    }
}

/// Rotate a planar 4:2:0 frame a quarter turn clockwise.
///
/// The result is `height` pixels wide and `width` pixels tall.
pub fn rotate_i420_90(dst: &mut [u8], src: &[u8], width: u32, height: u32) -> Result<()> {
    check_buffers(dst, src, Size::new(width, height))?;
    let (w, h) = (width as usize, height as usize);
    let (src_y, src_u, src_v) = split_planes(src, w, h)?;
    let (dst_y, dst_u, dst_v) = split_planes_mut(dst, w, h)?;
    rotate_plane_90(dst_y, src_y, w, h);
    rotate_plane_90(dst_u, src_u, w / 2, h / 2);
    rotate_plane_90(dst_v, src_v, w / 2, h / 2);
    Ok(())
}

/// Rotate a planar 4:2:0 frame a half turn. Applying it twice is the identity.
pub fn rotate_i420_180(dst: &mut [u8], src: &[u8], width: u32, height: u32) -> Result<()> {
    check_buffers(dst, src, Size::new(width, height))?;
    let (w, h) = (width as usize, height as usize);
    let (src_y, src_u, src_v) = split_planes(src, w, h)?;
    let (dst_y, dst_u, dst_v) = split_planes_mut(dst, w, h)?;
    for (dst_plane, src_plane) in [(dst_y, src_y), (dst_u, src_u), (dst_v, src_v)] {
        for (d, s) in dst_plane.iter_mut().zip(src_plane.iter().rev()) {
            *d = *s;
        }
    }
    Ok(())
}
