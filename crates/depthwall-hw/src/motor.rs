//! Tilt motor control via V4L2 `TILT_ABSOLUTE` controls.
//!
//! Kernel depth-camera drivers expose the tilt motor as a camera-class
//! control on the video node. Angles are given in actuator units
//! ([`TILT_MIN`]..=[`TILT_MAX`]) and mapped linearly onto whatever range
//! the driver reports.

use crate::sensor::TiltMotor;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

/// Lowest tilt position (fully down).
pub const TILT_MIN: i32 = -15000;
/// Highest tilt position (fully up).
pub const TILT_MAX: i32 = 15000;

/// Clamp an angle into [`TILT_MIN`]..=[`TILT_MAX`].
pub fn clamp_tilt(angle: i32) -> i32 {
    angle.clamp(TILT_MIN, TILT_MAX)
}

/// `VIDIOC_S_CTRL` = `_IOWR('V', 28, struct v4l2_control)`, 8-byte payload.
const VIDIOC_S_CTRL: libc::c_ulong = 0xC008_561C;
/// `VIDIOC_QUERYCTRL` = `_IOWR('V', 36, struct v4l2_queryctrl)`, 68-byte payload.
const VIDIOC_QUERYCTRL: libc::c_ulong = 0xC044_5624;

const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009A_0900;
const V4L2_CID_TILT_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 9;
const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;

/// Mirror of `struct v4l2_control` from `<linux/videodev2.h>`.
#[repr(C)]
struct V4l2Control {
    id: u32,
    value: i32,
}

/// Mirror of `struct v4l2_queryctrl` from `<linux/videodev2.h>`.
#[repr(C)]
struct V4l2Queryctrl {
    id: u32,
    ctrl_type: u32,
    name: [u8; 32],
    minimum: i32,
    maximum: i32,
    step: i32,
    default_value: i32,
    flags: u32,
    reserved: [u32; 2],
}

const _SIZE_ASSERT: () = {
    assert!(std::mem::size_of::<V4l2Control>() == 8);
    assert!(std::mem::size_of::<V4l2Queryctrl>() == 68);
};

#[derive(Debug, Error)]
pub enum MotorError {
    #[error("no tilt motor at index {0}")]
    NotFound(usize),
    #[error("device {0} has no usable tilt control")]
    NoTiltControl(String),
    #[error("failed to open device: {0}")]
    Open(std::io::Error),
    #[error("V4L2 ioctl failed: {0}")]
    Ioctl(std::io::Error),
    #[error("motor disconnected: {0}")]
    Disconnected(String),
    #[error("motor is closed")]
    Closed,
}

/// Tilt motor exposed as a V4L2 control.
pub struct V4l2TiltMotor {
    file: Option<File>,
    device_path: String,
    /// Driver-side control range (min, max).
    range: (i32, i32),
}

impl V4l2TiltMotor {
    /// Open `device_path` and query its tilt control.
    ///
    /// `fallback_range` is used when the driver does not answer
    /// `VIDIOC_QUERYCTRL` (typically taken from a device profile).
    pub fn open(device_path: &str, fallback_range: Option<(i32, i32)>) -> Result<Self, MotorError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(MotorError::Open)?;

        let range = match query_tilt_range(&file) {
            Some(range) => range,
            None => fallback_range
                .ok_or_else(|| MotorError::NoTiltControl(device_path.to_string()))?,
        };
        if range.0 >= range.1 {
            return Err(MotorError::NoTiltControl(device_path.to_string()));
        }

        tracing::info!(
            device = device_path,
            min = range.0,
            max = range.1,
            "opened tilt motor"
        );

        Ok(Self {
            file: Some(file),
            device_path: device_path.to_string(),
            range,
        })
    }

    /// Device path this motor controls.
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    fn send_control(&self, value: i32) -> Result<(), MotorError> {
        let file = self.file.as_ref().ok_or(MotorError::Closed)?;
        let mut ctrl = V4l2Control {
            id: V4L2_CID_TILT_ABSOLUTE,
            value,
        };

        // SAFETY:
        // - fd is valid for the lifetime of `file`
        // - `ctrl` is repr(C) and matches the kernel's v4l2_control layout
        let ret = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                VIDIOC_S_CTRL,
                &mut ctrl as *mut V4l2Control,
            )
        };

        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODEV) {
                Err(MotorError::Disconnected(self.device_path.clone()))
            } else {
                Err(MotorError::Ioctl(err))
            }
        } else {
            Ok(())
        }
    }
}

impl TiltMotor for V4l2TiltMotor {
    fn set_position(&mut self, angle: i32) -> Result<(), MotorError> {
        let value = to_control_value(clamp_tilt(angle), self.range);
        tracing::debug!(device = %self.device_path, angle, value, "setting tilt");
        self.send_control(value)
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            tracing::debug!(device = %self.device_path, "closed tilt motor");
        }
    }
}

fn query_tilt_range(file: &File) -> Option<(i32, i32)> {
    let mut qctrl = V4l2Queryctrl {
        id: V4L2_CID_TILT_ABSOLUTE,
        ctrl_type: 0,
        name: [0; 32],
        minimum: 0,
        maximum: 0,
        step: 0,
        default_value: 0,
        flags: 0,
        reserved: [0; 2],
    };

    // SAFETY: fd is valid for the lifetime of `file`; `qctrl` is repr(C)
    // and sized to match the kernel ABI (checked above).
    let ret = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            VIDIOC_QUERYCTRL,
            &mut qctrl as *mut V4l2Queryctrl,
        )
    };

    if ret < 0 || qctrl.flags & V4L2_CTRL_FLAG_DISABLED != 0 {
        return None;
    }
    Some((qctrl.minimum, qctrl.maximum))
}

/// Map an actuator angle linearly onto a driver control range.
fn to_control_value(angle: i32, (min, max): (i32, i32)) -> i32 {
    let span = (TILT_MAX - TILT_MIN) as i64;
    let offset = (angle - TILT_MIN) as i64;
    let value = min as i64 + offset * (max as i64 - min as i64) / span;
    value as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_tilt() {
        assert_eq!(clamp_tilt(20000), 15000);
        assert_eq!(clamp_tilt(-20000), -15000);
        assert_eq!(clamp_tilt(1234), 1234);
        assert_eq!(clamp_tilt(i32::MAX), TILT_MAX);
    }

    #[test]
    fn test_control_mapping_endpoints() {
        assert_eq!(to_control_value(TILT_MIN, (-30, 30)), -30);
        assert_eq!(to_control_value(TILT_MAX, (-30, 30)), 30);
        assert_eq!(to_control_value(0, (-30, 30)), 0);
    }

    #[test]
    fn test_control_mapping_asymmetric_range() {
        assert_eq!(to_control_value(TILT_MIN, (0, 100)), 0);
        assert_eq!(to_control_value(0, (0, 100)), 50);
        assert_eq!(to_control_value(7500, (0, 100)), 75);
    }

    #[test]
    fn test_open_missing_device() {
        let result = V4l2TiltMotor::open("/dev/depthwall-does-not-exist", Some((-30, 30)));
        assert!(matches!(result, Err(MotorError::Open(_))));
    }
}
