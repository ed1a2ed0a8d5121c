//! Frame validation utilities for test pattern verification.
//!
//! These check converted planar frames against patterns a virtual camera
//! produces. Useful for integration testing with vivid.

use crate::convert::PlanarFrame;
use crate::traits::{CameraError, Result};

/// Chroma value of an achromatic (gray) pixel.
const NEUTRAL_CHROMA: u8 = 128;

/// Tolerance for chroma matching (accounts for limited-range encoding).
const CHROMA_TOLERANCE: u8 = 6;

/// Minimum luma rise across a frame for it to count as a gradient.
const MIN_GRADIENT_RISE: u8 = 50;

/// Validates that a frame's buffer holds exactly one planar 4:2:0 image of
/// its declared size.
///
/// # Errors
///
/// Returns `InvalidImage` if the frame is empty, has odd dimensions, or the
/// buffer length differs from `width * height * 3 / 2`.
pub fn validate_planar_layout(frame: &PlanarFrame<'_>) -> Result<()> {
    let size = frame.size();
    if size.width == 0 || size.height == 0 || size.width % 2 != 0 || size.height % 2 != 0 {
        return Err(CameraError::InvalidImage(format!(
            "frame size {size} is not a valid 4:2:0 size"
        )));
    }
    if frame.data.len() != size.planar_len() {
        return Err(CameraError::InvalidImage(format!(
            "frame {size} holds {} bytes, expected {}",
            frame.data.len(),
            size.planar_len()
        )));
    }
    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center luma row every 10 pixels and checks that it rises
/// monotonically from left to right, allowing one step of rounding noise,
/// with a significant rise overall (not a solid color).
///
/// # Errors
///
/// Returns `InvalidImage` if the layout is wrong, the luma decreases, or the
/// total rise is too small.
pub fn validate_gradient(frame: &PlanarFrame<'_>) -> Result<()> {
    validate_planar_layout(frame)?;

    let width = frame.width as usize;
    let center_y = frame.height as usize / 2;
    let row = frame
        .luma()
        .get(center_y * width..(center_y + 1) * width)
        .ok_or_else(|| CameraError::InvalidImage(format!("missing luma row {center_y}")))?;

    let mut samples = row.iter().copied().step_by(10);
    let Some(first) = samples.next() else {
        return Err(CameraError::InvalidImage("empty luma row".to_owned()));
    };

    let mut previous = first;
    let mut last = first;
    for (step, luma) in samples.enumerate() {
        if luma.saturating_add(1) < previous {
            return Err(CameraError::InvalidImage(format!(
                "gradient not monotonically increasing at x={}: luma {luma} < previous {previous}",
                (step + 1) * 10
            )));
        }
        previous = luma;
        last = luma;
    }

    let rise = last.saturating_sub(first);
    if rise < MIN_GRADIENT_RISE {
        return Err(CameraError::InvalidImage(format!(
            "insufficient luma change for gradient: {rise} (expected at least {MIN_GRADIENT_RISE})"
        )));
    }
    Ok(())
}

/// Validates that both chroma planes are neutral gray.
///
/// # Errors
///
/// Returns `InvalidImage` if the layout is wrong or any chroma sample is more
/// than the tolerance away from 128.
pub fn validate_neutral_chroma(frame: &PlanarFrame<'_>) -> Result<()> {
    validate_planar_layout(frame)?;

    let luma_len = frame.width as usize * frame.height as usize;
    let chroma = frame.data.get(luma_len..).unwrap_or_default();
    if let Some((index, sample)) = chroma
        .iter()
        .enumerate()
        .find(|(_, sample)| !samples_match(**sample, NEUTRAL_CHROMA, CHROMA_TOLERANCE))
    {
        return Err(CameraError::InvalidImage(format!(
            "chroma sample {index} is {sample}, expected {NEUTRAL_CHROMA}"
        )));
    }
    Ok(())
}

/// Validates that sequence numbers increment by 1 with no gaps.
///
/// # Errors
///
/// Returns `InvalidImage` if the slice is empty or a sequence number does not
/// follow its predecessor.
pub fn validate_frame_sequence(sequences: &[u32]) -> Result<()> {
    if sequences.is_empty() {
        return Err(CameraError::InvalidImage(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (index, pair) in sequences.windows(2).enumerate() {
        let &[previous, current] = pair else {
            continue;
        };
        let expected = previous.wrapping_add(1);
        if current != expected {
            return Err(CameraError::InvalidImage(format!(
                "frame sequence gap at index {}: expected {expected}, got {current}",
                index + 1
            )));
        }
    }

    Ok(())
}

/// Whether two samples are within `tolerance` of each other.
fn samples_match(actual: u8, expected: u8, tolerance: u8) -> bool {
    actual.abs_diff(expected) <= tolerance
}
