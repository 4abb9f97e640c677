//! Depth/user frame processor.
//!
//! Masks each raw frame against the depth threshold, maps surviving depth
//! samples to 8-bit intensities, copies their user labels, and writes both
//! results left-right mirrored into two persistent output images.

use crate::config::{validate_threshold, ConfigError, IntensityMapping};
use crate::error::ControllerError;
use depthwall_hw::{FrameError, RawFrame};
use image::GrayImage;
use std::collections::TryReserveError;
use thiserror::Error;

/// Intensity range the depth threshold is spread over.
const COLOR_RANGE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("buffer allocation failed: {0}")]
    Resource(#[from] TryReserveError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<ProcessError> for ControllerError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Frame(e) => e.into(),
            ProcessError::Resource(e) => Self::Resource(e),
            ProcessError::Config(e) => Self::Config(e),
        }
    }
}

/// Scale factor mapping depths in `0..threshold` onto `0..255`.
pub fn color_scale(threshold: i32) -> f32 {
    COLOR_RANGE / threshold as f32
}

/// Turns raw frames into mirrored depth and user matrices.
///
/// Output dimensions are fixed at construction; storage is reused.
pub struct FrameProcessor {
    width: u32,
    height: u32,
    threshold: i32,
    scale: f32,
    mapping: IntensityMapping,
    depth: GrayImage,
    users: GrayImage,
}

impl FrameProcessor {
    pub fn new(
        width: u32,
        height: u32,
        threshold: i32,
        mapping: IntensityMapping,
    ) -> Result<Self, ProcessError> {
        validate_threshold(threshold)?;
        Ok(Self {
            width,
            height,
            threshold,
            scale: color_scale(threshold),
            mapping,
            depth: zeroed_image(width, height)?,
            users: zeroed_image(width, height)?,
        })
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn mapping(&self) -> IntensityMapping {
        self.mapping
    }

    /// Replace the threshold and recompute the scale. Non-positive values
    /// are rejected and leave the processor unchanged.
    pub fn set_threshold(&mut self, threshold: i32) -> Result<(), ConfigError> {
        validate_threshold(threshold)?;
        self.threshold = threshold;
        self.scale = color_scale(threshold);
        Ok(())
    }

    /// Most recent mirrored depth intensities.
    pub fn depth(&self) -> &GrayImage {
        &self.depth
    }

    /// Most recent mirrored user labels.
    pub fn users(&self) -> &GrayImage {
        &self.users
    }

    /// Process one frame into the output images.
    ///
    /// `out[y][x]` receives the result for raw pixel `(W-1-x, y)`.
    pub fn process(&mut self, frame: &RawFrame) -> Result<(), ProcessError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(FrameError::SizeMismatch {
                width: self.width,
                height: self.height,
                actual_width: frame.width,
                actual_height: frame.height,
            }
            .into());
        }
        let expected = self.width as usize * self.height as usize;
        for actual in [frame.depth.len(), frame.labels.len()] {
            if actual != expected {
                return Err(FrameError::InvalidLength { expected, actual }.into());
            }
        }

        let w = self.width as usize;
        if w == 0 {
            return Ok(());
        }
        let threshold = self.threshold;
        let scale = self.scale;
        let mapping = self.mapping;
        let depth_out: &mut [u8] = &mut self.depth;
        let users_out: &mut [u8] = &mut self.users;

        let rows = frame.depth.chunks_exact(w).zip(frame.labels.chunks_exact(w));
        for (y, (depth_row, label_row)) in rows.enumerate() {
            let row = y * w;
            for x in 0..w {
                let mirrored = row + (w - 1 - x);
                let d = depth_row[x];
                if (d as i32) < threshold {
                    depth_out[mirrored] = mapping.apply(d, scale);
                    users_out[mirrored] = label_row[x] as u8;
                } else {
                    depth_out[mirrored] = 0;
                    users_out[mirrored] = 0;
                }
            }
        }
        Ok(())
    }
}

fn zeroed_image(width: u32, height: u32) -> Result<GrayImage, ProcessError> {
    let len = width as usize * height as usize;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)?;
    buf.resize(len, 0u8);
    GrayImage::from_raw(width, height, buf).ok_or_else(|| {
        FrameError::SizeMismatch {
            width,
            height,
            actual_width: width,
            actual_height: height,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from(width: u32, height: u32, depth: &[u16], labels: &[u16]) -> RawFrame {
        let mut frame = RawFrame::allocate(width, height, 6).unwrap();
        frame.depth.copy_from_slice(depth);
        frame.labels.copy_from_slice(labels);
        frame
    }

    /// Unmirrored reference output for one pixel.
    fn reference(d: u16, label: u16, threshold: i32, mapping: IntensityMapping) -> (u8, u8) {
        if (d as i32) < threshold {
            (mapping.apply(d, color_scale(threshold)), label as u8)
        } else {
            (0, 0)
        }
    }

    #[test]
    fn test_threshold_example() {
        let mut p = FrameProcessor::new(2, 1, 6000, IntensityMapping::Wrapping).unwrap();
        let frame = frame_from(2, 1, &[3000, 6000], &[1, 1]);
        p.process(&frame).unwrap();
        // raw x=0 lands at x=1 after mirroring
        assert_eq!(p.depth().get_pixel(1, 0).0[0], 129);
        assert_eq!(p.users().get_pixel(1, 0).0[0], 1);
        // depth equal to the threshold is excluded
        assert_eq!(p.depth().get_pixel(0, 0).0[0], 0);
        assert_eq!(p.users().get_pixel(0, 0).0[0], 0);
    }

    #[test]
    fn test_inverted_example() {
        let mut p = FrameProcessor::new(1, 1, 6000, IntensityMapping::Inverted).unwrap();
        p.process(&frame_from(1, 1, &[3000], &[0])).unwrap();
        assert_eq!(p.depth().get_pixel(0, 0).0[0], 128);
    }

    #[test]
    fn test_output_is_horizontal_mirror() {
        let (w, h) = (7u32, 5u32);
        let n = (w * h) as usize;
        let depth: Vec<u16> = (0..n).map(|i| (i as u16 * 397) % 9000 + 1).collect();
        let labels: Vec<u16> = (0..n).map(|i| (i % 4) as u16).collect();
        let threshold = 6000;
        let mapping = IntensityMapping::Wrapping;

        let mut p = FrameProcessor::new(w, h, threshold, mapping).unwrap();
        p.process(&frame_from(w, h, &depth, &labels)).unwrap();

        for y in 0..h {
            for x in 0..w {
                let src = (y * w + (w - 1 - x)) as usize;
                let (d, l) = reference(depth[src], labels[src], threshold, mapping);
                assert_eq!(p.depth().get_pixel(x, y).0[0], d, "depth at ({x},{y})");
                assert_eq!(p.users().get_pixel(x, y).0[0], l, "users at ({x},{y})");
            }
        }
    }

    #[test]
    fn test_masked_pixels_zero_in_both_outputs() {
        let (w, h) = (4u32, 3u32);
        let depth = [
            100, 7000, 6000, 200, //
            65535, 5999, 1, 9000, //
            3000, 3000, 6001, 0,
        ];
        let labels = [3u16; 12];
        let mut p = FrameProcessor::new(w, h, 6000, IntensityMapping::Inverted).unwrap();
        p.process(&frame_from(w, h, &depth, &labels)).unwrap();

        for y in 0..h {
            for x in 0..w {
                let raw = depth[(y * w + (w - 1 - x)) as usize];
                let d = p.depth().get_pixel(x, y).0[0];
                let u = p.users().get_pixel(x, y).0[0];
                if raw < 6000 {
                    assert_ne!(d, 0, "inverted depth is never zero below threshold");
                    assert_eq!(u, 3);
                } else {
                    assert_eq!((d, u), (0, 0));
                }
            }
        }
    }

    #[test]
    fn test_labels_narrow_to_8_bits() {
        let mut p = FrameProcessor::new(1, 1, 6000, IntensityMapping::Wrapping).unwrap();
        p.process(&frame_from(1, 1, &[10], &[0x0102])).unwrap();
        assert_eq!(p.users().get_pixel(0, 0).0[0], 0x02);
    }

    #[test]
    fn test_buffers_overwritten_each_cycle() {
        let mut p = FrameProcessor::new(2, 1, 6000, IntensityMapping::Wrapping).unwrap();
        p.process(&frame_from(2, 1, &[3000, 3000], &[1, 2])).unwrap();
        p.process(&frame_from(2, 1, &[9000, 9000], &[1, 2])).unwrap();
        assert!(p.depth().iter().all(|&v| v == 0));
        assert!(p.users().iter().all(|&v| v == 0));
        assert_eq!(p.depth().dimensions(), (2, 1));
    }

    #[test]
    fn test_set_threshold_recomputes_scale() {
        let mut p = FrameProcessor::new(1, 1, 6000, IntensityMapping::Wrapping).unwrap();
        p.set_threshold(3000).unwrap();
        assert_eq!(p.threshold(), 3000);
        assert!((p.scale() - 0.085).abs() < 1e-6);

        // 1500 * 0.085 = 127.5 -> 129 under the new scale
        p.process(&frame_from(1, 1, &[1500], &[0])).unwrap();
        assert_eq!(p.depth().get_pixel(0, 0).0[0], 129);
    }

    #[test]
    fn test_set_threshold_rejects_non_positive() {
        let mut p = FrameProcessor::new(1, 1, 6000, IntensityMapping::Wrapping).unwrap();
        assert!(p.set_threshold(0).is_err());
        assert_eq!(p.threshold(), 6000);
        assert!((p.scale() - 255.0 / 6000.0).abs() < 1e-9);
    }

    #[test]
    fn test_new_rejects_zero_threshold() {
        let result = FrameProcessor::new(2, 2, 0, IntensityMapping::Wrapping);
        assert!(matches!(
            result,
            Err(ProcessError::Config(ConfigError::NonPositiveThreshold(0)))
        ));
    }

    #[test]
    fn test_rejects_frame_with_extra_samples() {
        let mut p = FrameProcessor::new(2, 1, 6000, IntensityMapping::Wrapping).unwrap();
        let mut frame = frame_from(2, 1, &[3000, 3000], &[1, 1]);
        frame.depth.extend_from_slice(&[3000, 3000]);
        frame.labels.extend_from_slice(&[1, 1]);
        assert!(matches!(
            p.process(&frame),
            Err(ProcessError::Frame(FrameError::InvalidLength {
                expected: 2,
                actual: 4
            }))
        ));
    }

    #[test]
    fn test_rejects_truncated_frame() {
        let mut p = FrameProcessor::new(2, 2, 6000, IntensityMapping::Wrapping).unwrap();
        p.process(&frame_from(2, 2, &[3000; 4], &[1; 4])).unwrap();

        let mut frame = frame_from(2, 2, &[9000; 4], &[0; 4]);
        frame.depth.truncate(2);
        frame.labels.truncate(2);
        assert!(matches!(
            p.process(&frame),
            Err(ProcessError::Frame(FrameError::InvalidLength {
                expected: 4,
                actual: 2
            }))
        ));

        // labels alone out of step with depth
        let mut frame = frame_from(2, 2, &[9000; 4], &[0; 4]);
        frame.labels.pop();
        assert!(matches!(
            p.process(&frame),
            Err(ProcessError::Frame(FrameError::InvalidLength {
                expected: 4,
                actual: 3
            }))
        ));
    }

    #[test]
    fn test_size_mismatch() {
        let mut p = FrameProcessor::new(2, 2, 6000, IntensityMapping::Wrapping).unwrap();
        let frame = RawFrame::allocate(3, 2, 6).unwrap();
        assert!(matches!(
            p.process(&frame),
            Err(ProcessError::Frame(FrameError::SizeMismatch { .. }))
        ));
    }
}
