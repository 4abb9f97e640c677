//! Raw depth frame storage and pixel-format decoding (Y16, Y10B).

use std::collections::TryReserveError;
use std::time::Instant;

/// One acquisition cycle's worth of sensor output.
///
/// Storage is allocated once per session and refilled in place by the
/// sensor on every `wait_for_frame` call.
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Depth samples in sensor units, row-major (width * height).
    pub depth: Vec<u16>,
    /// Per-pixel user labels, 0 = no user. Same layout as `depth`.
    pub labels: Vec<u16>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: Option<Instant>,
    /// IDs of users tracked in this frame, never longer than `max_users`.
    users: Vec<u16>,
    max_users: usize,
}

impl RawFrame {
    /// Allocate zeroed storage for a `width` x `height` frame tracking at
    /// most `max_users` users.
    pub fn allocate(width: u32, height: u32, max_users: usize) -> Result<Self, FrameError> {
        let pixels = width as usize * height as usize;

        let mut depth = Vec::new();
        depth.try_reserve_exact(pixels)?;
        depth.resize(pixels, 0);

        let mut labels = Vec::new();
        labels.try_reserve_exact(pixels)?;
        labels.resize(pixels, 0);

        let mut users = Vec::new();
        users.try_reserve_exact(max_users)?;

        Ok(Self {
            depth,
            labels,
            width,
            height,
            sequence: 0,
            timestamp: None,
            users,
            max_users,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.depth.len()
    }

    /// Users tracked in this frame.
    pub fn users(&self) -> &[u16] {
        &self.users
    }

    pub fn max_users(&self) -> usize {
        self.max_users
    }

    /// Replace the tracked user list, keeping at most `max_users` entries.
    ///
    /// Returns how many IDs were dropped because the list was full.
    pub fn set_users<I: IntoIterator<Item = u16>>(&mut self, ids: I) -> usize {
        self.users.clear();
        let mut dropped = 0;
        for id in ids {
            if self.users.len() < self.max_users {
                self.users.push(id);
            } else {
                dropped += 1;
            }
        }
        dropped
    }

    /// Zero all samples and forget tracked users.
    pub fn clear(&mut self) {
        self.depth.fill(0);
        self.labels.fill(0);
        self.users.clear();
    }

    /// Fraction of pixels with a depth reading (non-zero sample).
    pub fn valid_fraction(&self) -> f32 {
        if self.depth.is_empty() {
            return 0.0;
        }
        let valid = self.depth.iter().filter(|&&d| d != 0).count();
        valid as f32 / self.depth.len() as f32
    }
}

/// Number of bytes a packed 10-bit frame occupies.
pub fn y10b_packed_size(pixels: usize) -> usize {
    (pixels * 10).div_ceil(8)
}

/// Decode 16-bit little-endian samples into `out`, shifting each left by `shift`.
pub fn decode_y16_into(buf: &[u8], out: &mut [u16], shift: u8) -> Result<(), FrameError> {
    let expected = out.len() * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    for (px, bytes) in out.iter_mut().zip(buf.chunks_exact(2)) {
        *px = u16::from_le_bytes([bytes[0], bytes[1]]) << shift;
    }
    Ok(())
}

/// Unpack Y10B (big-endian bit-packed 10-bit, 4 pixels per 5 bytes) into `out`.
pub fn unpack_y10b_into(buf: &[u8], out: &mut [u16], shift: u8) -> Result<(), FrameError> {
    let expected = y10b_packed_size(out.len());
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }

    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut bytes = buf.iter();
    for px in out.iter_mut() {
        while bits < 10 {
            // length checked above
            let byte = bytes.next().copied().unwrap_or(0);
            acc = (acc << 8) | byte as u32;
            bits += 8;
        }
        bits -= 10;
        *px = (((acc >> bits) & 0x3FF) as u16) << shift;
        acc &= (1 << bits) - 1;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame is {actual_width}x{actual_height}, sensor mode is {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("frame allocation failed: {0}")]
    Allocation(#[from] TryReserveError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_zeroed() {
        let frame = RawFrame::allocate(4, 3, 6).unwrap();
        assert_eq!(frame.pixel_count(), 12);
        assert_eq!(frame.labels.len(), 12);
        assert!(frame.depth.iter().all(|&d| d == 0));
        assert!(frame.users().is_empty());
        assert_eq!(frame.max_users(), 6);
    }

    #[test]
    fn test_set_users_is_bounded() {
        let mut frame = RawFrame::allocate(2, 2, 2).unwrap();
        let dropped = frame.set_users([1, 2, 3, 4]);
        assert_eq!(frame.users(), &[1, 2]);
        assert_eq!(dropped, 2);

        let dropped = frame.set_users([7]);
        assert_eq!(frame.users(), &[7]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_valid_fraction() {
        let mut frame = RawFrame::allocate(2, 2, 1).unwrap();
        assert_eq!(frame.valid_fraction(), 0.0);
        frame.depth[0] = 100;
        frame.depth[3] = 200;
        assert!((frame.valid_fraction() - 0.5).abs() < 1e-6);
        frame.clear();
        assert_eq!(frame.valid_fraction(), 0.0);
    }

    #[test]
    fn test_decode_y16() {
        let buf = vec![0x70, 0x17, 0xFF, 0x00];
        let mut out = vec![0u16; 2];
        decode_y16_into(&buf, &mut out, 0).unwrap();
        assert_eq!(out, vec![6000, 255]);
    }

    #[test]
    fn test_decode_y16_too_short() {
        let mut out = vec![0u16; 2];
        let err = decode_y16_into(&[1, 2, 3], &mut out, 0).unwrap_err();
        assert!(matches!(
            err,
            FrameError::InvalidLength {
                expected: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_y10b_unpacking() {
        // P0 = 1023, P1 = 512, P2 = 256, P3 = 0
        let raw = vec![255u8, 224, 4, 0, 0];
        let mut out = vec![0u16; 4];
        unpack_y10b_into(&raw, &mut out, 0).unwrap();
        assert_eq!(out, vec![1023, 512, 256, 0]);
    }

    #[test]
    fn test_y10b_unpacking_with_shift() {
        let raw = vec![255u8, 224, 4, 0, 0];
        let mut out = vec![0u16; 4];
        unpack_y10b_into(&raw, &mut out, 3).unwrap();
        assert_eq!(out, vec![1023 << 3, 512 << 3, 256 << 3, 0]);
    }

    #[test]
    fn test_y10b_packed_size() {
        assert_eq!(y10b_packed_size(4), 5);
        assert_eq!(y10b_packed_size(640 * 480), 384_000);
        assert_eq!(y10b_packed_size(3), 4);
    }

    #[test]
    fn test_y10b_too_short() {
        let mut out = vec![0u16; 4];
        assert!(unpack_y10b_into(&[1, 2, 3, 4], &mut out, 0).is_err());
    }
}
