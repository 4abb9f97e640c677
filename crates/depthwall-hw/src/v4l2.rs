//! V4L2 depth capture via the `v4l` crate.
//!
//! Kernel depth-camera drivers expose the depth map as a 16-bit or packed
//! 10-bit grayscale stream. They do no user segmentation, so frames from
//! this backend always carry an all-zero label map and no tracked users.

use crate::frame::{self, FrameError, RawFrame};
use crate::motor::{MotorError, V4l2TiltMotor};
use crate::profiles;
use crate::sensor::{DepthSensor, DeviceBackend, SensorError, SensorMode};
use std::path::Path;
use std::time::{Duration, Instant};
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

/// Depth pixel formats the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthFormat {
    /// 16-bit little-endian, one sample per pixel.
    Y16,
    /// 10-bit big-endian bit-packed, 4 samples per 5 bytes.
    Y10b,
}

impl DepthFormat {
    /// Parse a profile FourCC string.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim_end_matches(|c| c == ' ' || c == '\0') {
            "Y16" => Some(Self::Y16),
            "Y10B" => Some(Self::Y10b),
            _ => None,
        }
    }

    fn fourcc(self) -> FourCC {
        match self {
            Self::Y16 => FourCC::new(b"Y16 "),
            Self::Y10b => FourCC::new(b"Y10B"),
        }
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else if fourcc == FourCC::new(b"Y10B") {
            Some(Self::Y10b)
        } else {
            None
        }
    }

    fn decode(self, buf: &[u8], out: &mut [u16], shift: u8) -> Result<(), FrameError> {
        match self {
            Self::Y16 => frame::decode_y16_into(buf, out, shift),
            Self::Y10b => frame::unpack_y10b_into(buf, out, shift),
        }
    }
}

/// Info about a discovered V4L2 capture node.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
    /// Name of the matching device profile, if any.
    pub profile: Option<String>,
}

/// V4L2 depth sensor handle.
pub struct V4l2DepthSensor {
    // Declared before `device` so the stream is dropped first.
    stream: Option<MmapStream<'static>>,
    device: Option<Device>,
    pub device_path: String,
    mode: SensorMode,
    format: DepthFormat,
    shift: u8,
}

impl V4l2DepthSensor {
    /// Open a V4L2 depth node and negotiate `mode`.
    ///
    /// The pixel format comes from the device profile when one matches,
    /// otherwise `Y16` is requested.
    pub fn open(device_path: &str, mode: SensorMode) -> Result<Self, SensorError> {
        if !Path::new(device_path).exists() {
            return Err(SensorError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.raw_os_error() == Some(libc::EBUSY) {
                SensorError::DeviceBusy
            } else {
                SensorError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            SensorError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened depth sensor"
        );

        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Err(SensorError::StreamingNotSupported);
        }

        let profile = profiles::profile_for_device(device_path);
        let requested = profile
            .and_then(|p| DepthFormat::from_name(&p.depth.fourcc))
            .unwrap_or(DepthFormat::Y16);
        let shift = profile.map(|p| p.depth.shift).unwrap_or(0);

        let mut fmt = device.format().map_err(|e| {
            SensorError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = requested.fourcc();
        fmt.width = mode.width;
        fmt.height = mode.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            SensorError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let format = DepthFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            SensorError::FormatNegotiationFailed(format!(
                "unsupported depth format: {:?} (need Y16 or Y10B)",
                negotiated.fourcc
            ))
        })?;

        if negotiated.width != mode.width || negotiated.height != mode.height {
            return Err(SensorError::FormatNegotiationFailed(format!(
                "driver offered {}x{}, requested {}x{}",
                negotiated.width, negotiated.height, mode.width, mode.height
            )));
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(mode.fps)) {
            tracing::warn!(fps = mode.fps, error = %e, "frame rate not accepted; using driver default");
        }

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            shift,
            "negotiated depth format"
        );

        Ok(Self {
            stream: None,
            device: Some(device),
            device_path: device_path.to_string(),
            mode,
            format,
            shift,
        })
    }

    /// Negotiated depth pixel format.
    pub fn format(&self) -> DepthFormat {
        self.format
    }
}

impl DepthSensor for V4l2DepthSensor {
    fn mode(&self) -> SensorMode {
        self.mode
    }

    fn start_streaming(&mut self) -> Result<(), SensorError> {
        let device = self.device.as_ref().ok_or(SensorError::NotStreaming)?;
        // Streaming is switched on by the first dequeue.
        let stream = MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                SensorError::StreamStartFailed(format!("failed to create mmap stream: {e}"))
            })?;
        self.stream = Some(stream);
        tracing::debug!(device = %self.device_path, "depth stream ready");
        Ok(())
    }

    fn wait_for_frame(
        &mut self,
        frame: &mut RawFrame,
        timeout: Duration,
    ) -> Result<(), SensorError> {
        if frame.width != self.mode.width || frame.height != self.mode.height {
            return Err(FrameError::SizeMismatch {
                width: self.mode.width,
                height: self.mode.height,
                actual_width: frame.width,
                actual_height: frame.height,
            }
            .into());
        }

        let stream = self.stream.as_mut().ok_or(SensorError::NotStreaming)?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                SensorError::Timeout(timeout)
            } else if matches!(e.raw_os_error(), Some(libc::ENODEV) | Some(libc::ENXIO)) {
                SensorError::Disconnected(self.device_path.clone())
            } else {
                SensorError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            }
        })?;

        self.format.decode(buf, &mut frame.depth, self.shift)?;
        frame.labels.fill(0);
        frame.set_users(std::iter::empty());
        frame.sequence = meta.sequence;
        frame.timestamp = Some(Instant::now());
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
        if self.device.take().is_some() {
            tracing::info!(device = %self.device_path, "closed depth sensor");
        }
    }
}

/// Backend opening V4L2 depth and tilt nodes by path.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    depth_device: String,
    motor_devices: Vec<String>,
}

impl V4l2Backend {
    /// Use `depth_device` for depth and, unless overridden, as motor 0.
    pub fn new(depth_device: impl Into<String>) -> Self {
        let depth_device = depth_device.into();
        Self {
            motor_devices: vec![depth_device.clone()],
            depth_device,
        }
    }

    /// Replace the list of nodes searched by motor index.
    pub fn with_motor_devices(mut self, devices: Vec<String>) -> Self {
        self.motor_devices = devices;
        self
    }
}

impl DeviceBackend for V4l2Backend {
    type Sensor = V4l2DepthSensor;
    type Motor = V4l2TiltMotor;

    fn name(&self) -> &str {
        "v4l2"
    }

    fn open_sensor(&mut self, mode: SensorMode) -> Result<Self::Sensor, SensorError> {
        V4l2DepthSensor::open(&self.depth_device, mode)
    }

    fn open_motor(&mut self, index: usize) -> Result<Self::Motor, MotorError> {
        let path = self
            .motor_devices
            .get(index)
            .ok_or(MotorError::NotFound(index))?;
        let fallback = profiles::profile_for_device(path)
            .and_then(|p| p.tilt)
            .map(|t| (t.min, t.max));
        V4l2TiltMotor::open(path, fallback)
    }
}

/// List available V4L2 video capture devices.
pub fn list_devices() -> Vec<DeviceInfo> {
    let mut devices = Vec::new();

    for i in 0..16 {
        let path = format!("/dev/video{i}");
        if !Path::new(&path).exists() {
            continue;
        }
        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            continue;
        }
        let profile = profiles::profile_for_device(&path).map(|p| p.device.name.clone());
        devices.push(DeviceInfo {
            path,
            name: caps.card.clone(),
            driver: caps.driver.clone(),
            bus: caps.bus.clone(),
            profile,
        });
    }

    devices
}
