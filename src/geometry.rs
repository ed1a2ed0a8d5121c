//! Orientation and geometry math.
//!
//! Everything here is pure: output-size negotiation, the display orientation
//! reported to the sink, and the affine transform that keeps the on-screen
//! preview upright when the device is rotated.

use serde::{Deserialize, Serialize};

use crate::traits::{CameraError, Facing, Size};

/// Rotation applied to every converted frame before it reaches the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    /// Frames pass through unrotated.
    #[default]
    Deg0,
    /// Frames are rotated a quarter turn clockwise; width and height swap.
    Deg90,
    /// Frames are rotated a half turn.
    Deg180,
}

impl Rotation {
    /// Rotation in degrees.
    #[must_use]
    pub const fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
        }
    }

    /// Frame size after applying this rotation to a `size` frame.
    #[must_use]
    pub const fn rotated_size(self, size: Size) -> Size {
        match self {
            Self::Deg90 => size.transposed(),
            Self::Deg0 | Self::Deg180 => size,
        }
    }
}

impl TryFrom<u32> for Rotation {
    type Error = CameraError;

    fn try_from(degrees: u32) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            other => Err(CameraError::UnsupportedRotation(other)),
        }
    }
}

impl From<Rotation> for u32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// Rotation of the display relative to its natural orientation, in quarter
/// turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DisplayRotation {
    /// Natural orientation.
    #[default]
    Rotation0,
    /// Rotated 90 degrees.
    Rotation90,
    /// Upside down.
    Rotation180,
    /// Rotated 270 degrees.
    Rotation270,
}

impl DisplayRotation {
    /// Number of quarter turns (0..=3).
    #[must_use]
    pub const fn quarter_turns(self) -> u8 {
        match self {
            Self::Rotation0 => 0,
            Self::Rotation90 => 1,
            Self::Rotation180 => 2,
            Self::Rotation270 => 3,
        }
    }

    /// Rotation in degrees.
    #[must_use]
    pub const fn degrees(self) -> u32 {
        self.quarter_turns() as u32 * 90
    }
}

impl TryFrom<u8> for DisplayRotation {
    type Error = CameraError;

    fn try_from(quarter_turns: u8) -> Result<Self, Self::Error> {
        match quarter_turns {
            0 => Ok(Self::Rotation0),
            1 => Ok(Self::Rotation90),
            2 => Ok(Self::Rotation180),
            3 => Ok(Self::Rotation270),
            other => Err(CameraError::Config(format!(
                "display rotation must be 0..=3 quarter turns, got {other}"
            ))),
        }
    }
}

impl From<DisplayRotation> for u8 {
    fn from(rotation: DisplayRotation) -> Self {
        rotation.quarter_turns()
    }
}

/// Degrees a captured frame must be rotated to appear upright on a display
/// rotated by `rotation_degrees`.
///
/// Front cameras are mirrored, so their sensor and display rotations add up
/// and the result is inverted.
#[must_use]
pub const fn display_orientation(sensor_orientation: u32, rotation_degrees: u32, facing: Facing) -> u32 {
    let sensor = sensor_orientation % 360;
    let rotation = rotation_degrees % 360;
    match facing {
        Facing::Front => (360 - (sensor + rotation) % 360) % 360,
        Facing::Back | Facing::External => (sensor + 360 - rotation) % 360,
    }
}

/// Pick the size whose pixel count is closest to `target`'s.
///
/// Ties go to the earliest candidate. Returns `None` for an empty list.
#[must_use]
pub fn choose_best_size(sizes: &[Size], target: Size) -> Option<Size> {
    let target_area = target.area();
    let mut best: Option<(Size, u64)> = None;
    for &size in sizes {
        let delta = size.area().abs_diff(target_area);
        match best {
            Some((_, best_delta)) if delta >= best_delta => {}
            _ => best = Some((size, delta)),
        }
    }
    best.map(|(size, _)| size)
}

/// Axis-aligned rectangle in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectF {
    /// Left edge.
    pub left: f32,
    /// Top edge.
    pub top: f32,
    /// Right edge.
    pub right: f32,
    /// Bottom edge.
    pub bottom: f32,
}

impl RectF {
    /// Rectangle with its top-left corner at the origin.
    #[must_use]
    pub const fn from_size(width: f32, height: f32) -> Self {
        Self {
            left: 0.0,
            top: 0.0,
            right: width,
            bottom: height,
        }
    }

    /// Width.
    #[must_use]
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    /// Height.
    #[must_use]
    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Center point.
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    /// Move the rectangle by `(dx, dy)`.
    pub fn offset(&mut self, dx: f32, dy: f32) {
        self.left += dx;
        self.right += dx;
        self.top += dy;
        self.bottom += dy;
    }
}

/// 2D affine transform.
///
/// Maps `(x, y)` to `(sx*x + kx*y + tx, ky*x + sy*y + ty)`. The `post_*`
/// operations apply a further transform after this one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    /// X scale.
    pub sx: f32,
    /// X skew.
    pub kx: f32,
    /// X translation.
    pub tx: f32,
    /// Y skew.
    pub ky: f32,
    /// Y scale.
    pub sy: f32,
    /// Y translation.
    pub ty: f32,
}

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine {
    /// The identity transform.
    pub const IDENTITY: Self = Self {
        sx: 1.0,
        kx: 0.0,
        tx: 0.0,
        ky: 0.0,
        sy: 1.0,
        ty: 0.0,
    };

    /// Transform mapping `src` onto `dst`, stretching each axis independently.
    #[must_use]
    pub fn rect_to_rect_fill(src: &RectF, dst: &RectF) -> Self {
        if src.width() == 0.0 || src.height() == 0.0 {
            return Self::IDENTITY;
        }
        let sx = dst.width() / src.width();
        let sy = dst.height() / src.height();
        Self {
            sx,
            kx: 0.0,
            tx: sx.mul_add(-src.left, dst.left),
            ky: 0.0,
            sy,
            ty: sy.mul_add(-src.top, dst.top),
        }
    }

    /// `other` applied after `self`.
    #[must_use]
    pub fn then(&self, other: &Self) -> Self {
        Self {
            sx: other.sx.mul_add(self.sx, other.kx * self.ky),
            kx: other.sx.mul_add(self.kx, other.kx * self.sy),
            tx: other.sx.mul_add(self.tx, other.kx.mul_add(self.ty, other.tx)),
            ky: other.ky.mul_add(self.sx, other.sy * self.ky),
            sy: other.ky.mul_add(self.kx, other.sy * self.sy),
            ty: other.ky.mul_add(self.tx, other.sy.mul_add(self.ty, other.ty)),
        }
    }

    /// Scale about the pivot `(px, py)` after this transform.
    #[must_use]
    pub fn post_scale(&self, scale_x: f32, scale_y: f32, px: f32, py: f32) -> Self {
        self.then(&Self {
            sx: scale_x,
            kx: 0.0,
            tx: scale_x.mul_add(-px, px),
            ky: 0.0,
            sy: scale_y,
            ty: scale_y.mul_add(-py, py),
        })
    }

    /// Rotate clockwise (in surface coordinates, y down) by `degrees` about
    /// the pivot `(px, py)` after this transform.
    #[must_use]
    pub fn post_rotate(&self, degrees: f32, px: f32, py: f32) -> Self {
        let (sin, cos) = snap_sin_cos(degrees);
        self.then(&Self {
            sx: cos,
            kx: -sin,
            tx: sin.mul_add(py, cos.mul_add(-px, px)),
            ky: sin,
            sy: cos,
            ty: sin.mul_add(-px, cos.mul_add(-py, py)),
        })
    }

    /// Apply the transform to a point.
    #[must_use]
    pub fn map_point(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.sx.mul_add(x, self.kx.mul_add(y, self.tx)),
            self.ky.mul_add(x, self.sy.mul_add(y, self.ty)),
        )
    }
}

/// Sine and cosine with exact values at multiples of 90 degrees.
fn snap_sin_cos(degrees: f32) -> (f32, f32) {
    let normalized = degrees.rem_euclid(360.0);
    if normalized == 0.0 {
        (0.0, 1.0)
    } else if (normalized - 90.0).abs() < f32::EPSILON {
        (1.0, 0.0)
    } else if (normalized - 180.0).abs() < f32::EPSILON {
        (0.0, -1.0)
    } else if (normalized - 270.0).abs() < f32::EPSILON {
        (-1.0, 0.0)
    } else {
        normalized.to_radians().sin_cos()
    }
}

/// Transform for the preview surface so the camera image stays upright and
/// fills a `view_width` x `view_height` view at the given display rotation.
///
/// Only the preview surface uses this; frames delivered to the sink are
/// never transformed by it.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn preview_transform(
    view_width: f32,
    view_height: f32,
    buffer: Size,
    rotation: DisplayRotation,
) -> Affine {
    let view_rect = RectF::from_size(view_width, view_height);
    let (center_x, center_y) = view_rect.center();
    let buffer_width = buffer.width as f32;
    let buffer_height = buffer.height as f32;

    match rotation {
        DisplayRotation::Rotation90 | DisplayRotation::Rotation270 => {
            if buffer.width == 0 || buffer.height == 0 {
                return Affine::IDENTITY;
            }
            let mut buffer_rect = RectF::from_size(buffer_height, buffer_width);
            let (buffer_center_x, buffer_center_y) = buffer_rect.center();
            buffer_rect.offset(center_x - buffer_center_x, center_y - buffer_center_y);
            let scale = (view_height / buffer_height).max(view_width / buffer_width);
            let turns = f32::from(rotation.quarter_turns()) - 2.0;
            Affine::rect_to_rect_fill(&view_rect, &buffer_rect)
                .post_scale(scale, scale, center_x, center_y)
                .post_rotate((90.0 * turns) % 360.0, center_x, center_y)
        }
        DisplayRotation::Rotation180 => {
            Affine::IDENTITY.post_rotate(180.0, center_x, center_y)
        }
        DisplayRotation::Rotation0 => Affine::IDENTITY,
    }
}
