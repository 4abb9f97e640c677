//! Simulated depth sensor and tilt motor.
//!
//! Renders a flat back wall with one rectangular "user" sliding across the
//! frame. A shared [`SimHandle`] records device activity and injects faults,
//! which lets session logic run without hardware.

use crate::frame::{FrameError, RawFrame};
use crate::motor::MotorError;
use crate::sensor::{DepthSensor, DeviceBackend, SensorError, SensorMode, TiltMotor};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// What the simulated sensor sees.
#[derive(Debug, Clone)]
pub struct SimScene {
    /// Depth of the back wall.
    pub wall_depth: u16,
    /// Depth of the user.
    pub user_depth: u16,
    /// Label written under the user.
    pub user_id: u16,
    /// User box size as a fraction of frame width/height.
    pub user_size: (f32, f32),
    /// Pixels the user moves per frame.
    pub step: u32,
    /// User alternates between present and absent every this many frames.
    pub presence_period: Option<u32>,
    /// Sleep between frames to emulate the sensor frame rate.
    pub paced: bool,
}

impl Default for SimScene {
    fn default() -> Self {
        Self {
            wall_depth: 8000,
            user_depth: 2500,
            user_id: 1,
            user_size: (0.25, 0.6),
            step: 8,
            presence_period: None,
            paced: false,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    sensor_opens: usize,
    sensor_closes: usize,
    motor_opens: usize,
    motor_closes: usize,
    streaming: bool,
    frames_served: u32,
    positions: Vec<i32>,
    fail_sensor_opens: usize,
    fail_stream_starts: usize,
    fail_frames: usize,
    fail_motor_commands: usize,
    motor_missing: bool,
}

/// Shared view of simulated device activity.
#[derive(Debug, Clone, Default)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sensor_opens(&self) -> usize {
        self.lock().sensor_opens
    }

    pub fn sensor_closes(&self) -> usize {
        self.lock().sensor_closes
    }

    pub fn motor_opens(&self) -> usize {
        self.lock().motor_opens
    }

    pub fn motor_closes(&self) -> usize {
        self.lock().motor_closes
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    pub fn frames_served(&self) -> u32 {
        self.lock().frames_served
    }

    /// Every position sent to the motor, oldest first.
    pub fn positions(&self) -> Vec<i32> {
        self.lock().positions.clone()
    }

    pub fn last_position(&self) -> Option<i32> {
        self.lock().positions.last().copied()
    }

    /// Make the next `n` sensor opens fail.
    pub fn fail_next_sensor_opens(&self, n: usize) {
        self.lock().fail_sensor_opens = n;
    }

    /// Make the next `n` stream starts fail.
    pub fn fail_next_stream_starts(&self, n: usize) {
        self.lock().fail_stream_starts = n;
    }

    /// Make the next `n` frame waits time out.
    pub fn fail_next_frames(&self, n: usize) {
        self.lock().fail_frames = n;
    }

    /// Make the next `n` motor commands fail.
    pub fn fail_next_motor_commands(&self, n: usize) {
        self.lock().fail_motor_commands = n;
    }

    /// Pretend the backend has no motor at all.
    pub fn set_motor_missing(&self, missing: bool) {
        self.lock().motor_missing = missing;
    }
}

/// Backend handing out simulated devices.
#[derive(Debug, Clone, Default)]
pub struct SimBackend {
    handle: SimHandle,
    scene: SimScene,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scene(scene: SimScene) -> Self {
        Self {
            handle: SimHandle::default(),
            scene,
        }
    }

    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }
}

impl DeviceBackend for SimBackend {
    type Sensor = SimSensor;
    type Motor = SimMotor;

    fn name(&self) -> &str {
        "sim"
    }

    fn open_sensor(&mut self, mode: SensorMode) -> Result<Self::Sensor, SensorError> {
        let mut state = self.handle.lock();
        if state.fail_sensor_opens > 0 {
            state.fail_sensor_opens -= 1;
            return Err(SensorError::DeviceNotFound("simulated sensor unplugged".into()));
        }
        state.sensor_opens += 1;
        drop(state);

        tracing::debug!(width = mode.width, height = mode.height, "opened simulated sensor");
        Ok(SimSensor {
            handle: self.handle.clone(),
            scene: self.scene.clone(),
            mode,
            open: true,
            streaming: false,
            sequence: 0,
            last_frame: None,
        })
    }

    fn open_motor(&mut self, index: usize) -> Result<Self::Motor, MotorError> {
        let mut state = self.handle.lock();
        if state.motor_missing || index > 0 {
            return Err(MotorError::NotFound(index));
        }
        state.motor_opens += 1;
        Ok(SimMotor {
            handle: self.handle.clone(),
            open: true,
        })
    }
}

/// Simulated depth sensor.
pub struct SimSensor {
    handle: SimHandle,
    scene: SimScene,
    mode: SensorMode,
    open: bool,
    streaming: bool,
    sequence: u32,
    last_frame: Option<Instant>,
}

impl SimSensor {
    fn user_visible(&self) -> bool {
        match self.scene.presence_period {
            Some(period) if period > 0 => (self.sequence / period) % 2 == 0,
            _ => true,
        }
    }

    fn render(&self, frame: &mut RawFrame) {
        let w = frame.width as usize;
        let h = frame.height as usize;
        frame.depth.fill(self.scene.wall_depth);
        frame.labels.fill(0);

        if !self.user_visible() || w == 0 || h == 0 {
            frame.set_users(std::iter::empty());
            return;
        }

        let box_w = ((w as f32 * self.scene.user_size.0) as usize).clamp(1, w);
        let box_h = ((h as f32 * self.scene.user_size.1) as usize).clamp(1, h);
        let travel = w - box_w + 1;
        let x0 = (self.sequence as usize * self.scene.step as usize) % travel;
        let y0 = h - box_h;

        for y in y0..y0 + box_h {
            let row = y * w;
            frame.depth[row + x0..row + x0 + box_w].fill(self.scene.user_depth);
            frame.labels[row + x0..row + x0 + box_w].fill(self.scene.user_id);
        }
        frame.set_users([self.scene.user_id]);
    }
}

impl DepthSensor for SimSensor {
    fn mode(&self) -> SensorMode {
        self.mode
    }

    fn start_streaming(&mut self) -> Result<(), SensorError> {
        if !self.open {
            return Err(SensorError::StreamStartFailed("sensor closed".into()));
        }
        let mut state = self.handle.lock();
        if state.fail_stream_starts > 0 {
            state.fail_stream_starts -= 1;
            return Err(SensorError::StreamStartFailed("simulated generator fault".into()));
        }
        state.streaming = true;
        self.streaming = true;
        Ok(())
    }

    fn wait_for_frame(
        &mut self,
        frame: &mut RawFrame,
        timeout: Duration,
    ) -> Result<(), SensorError> {
        if !self.streaming {
            return Err(SensorError::NotStreaming);
        }
        if frame.width != self.mode.width || frame.height != self.mode.height {
            return Err(FrameError::SizeMismatch {
                width: self.mode.width,
                height: self.mode.height,
                actual_width: frame.width,
                actual_height: frame.height,
            }
            .into());
        }

        {
            let mut state = self.handle.lock();
            if state.fail_frames > 0 {
                state.fail_frames -= 1;
                return Err(SensorError::Timeout(timeout));
            }
            state.frames_served += 1;
        }

        if self.scene.paced {
            let interval = self.mode.frame_interval();
            if let Some(last) = self.last_frame {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        }

        self.render(frame);
        frame.sequence = self.sequence;
        let now = Instant::now();
        frame.timestamp = Some(now);
        self.last_frame = Some(now);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.streaming = false;
        let mut state = self.handle.lock();
        state.sensor_closes += 1;
        state.streaming = false;
    }
}

/// Simulated tilt motor.
pub struct SimMotor {
    handle: SimHandle,
    open: bool,
}

impl TiltMotor for SimMotor {
    fn set_position(&mut self, angle: i32) -> Result<(), MotorError> {
        if !self.open {
            return Err(MotorError::Closed);
        }
        let mut state = self.handle.lock();
        if state.fail_motor_commands > 0 {
            state.fail_motor_commands -= 1;
            return Err(MotorError::Disconnected("simulated motor".into()));
        }
        state.positions.push(angle);
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.handle.lock().motor_closes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_mode() -> SensorMode {
        SensorMode {
            width: 16,
            height: 10,
            fps: 30,
        }
    }

    #[test]
    fn test_frame_contains_user_blob() {
        let mut backend = SimBackend::new();
        let mut sensor = backend.open_sensor(small_mode()).unwrap();
        sensor.start_streaming().unwrap();

        let mut frame = RawFrame::allocate(16, 10, 6).unwrap();
        sensor
            .wait_for_frame(&mut frame, Duration::from_millis(10))
            .unwrap();

        assert_eq!(frame.users(), &[1]);
        let user_pixels = frame.labels.iter().filter(|&&l| l == 1).count();
        // 25% of 16 wide, 60% of 10 high
        assert_eq!(user_pixels, 4 * 6);
        for (d, l) in frame.depth.iter().zip(&frame.labels) {
            if *l == 1 {
                assert_eq!(*d, 2500);
            } else {
                assert_eq!(*d, 8000);
            }
        }
    }

    #[test]
    fn test_user_moves_between_frames() {
        let mut backend = SimBackend::new();
        let mut sensor = backend.open_sensor(small_mode()).unwrap();
        sensor.start_streaming().unwrap();

        let mut frame = RawFrame::allocate(16, 10, 6).unwrap();
        let timeout = Duration::from_millis(10);
        sensor.wait_for_frame(&mut frame, timeout).unwrap();
        let first = frame.labels.clone();
        sensor.wait_for_frame(&mut frame, timeout).unwrap();
        assert_ne!(first, frame.labels);
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn test_presence_period_hides_user() {
        let scene = SimScene {
            presence_period: Some(1),
            ..SimScene::default()
        };
        let mut backend = SimBackend::with_scene(scene);
        let mut sensor = backend.open_sensor(small_mode()).unwrap();
        sensor.start_streaming().unwrap();

        let mut frame = RawFrame::allocate(16, 10, 6).unwrap();
        let timeout = Duration::from_millis(10);
        sensor.wait_for_frame(&mut frame, timeout).unwrap();
        assert_eq!(frame.users(), &[1]);
        sensor.wait_for_frame(&mut frame, timeout).unwrap();
        assert!(frame.users().is_empty());
        assert!(frame.labels.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_wait_requires_streaming() {
        let mut backend = SimBackend::new();
        let mut sensor = backend.open_sensor(small_mode()).unwrap();
        let mut frame = RawFrame::allocate(16, 10, 6).unwrap();
        let result = sensor.wait_for_frame(&mut frame, Duration::from_millis(10));
        assert!(matches!(result, Err(SensorError::NotStreaming)));
    }

    #[test]
    fn test_wait_rejects_wrong_frame_size() {
        let mut backend = SimBackend::new();
        let mut sensor = backend.open_sensor(small_mode()).unwrap();
        sensor.start_streaming().unwrap();
        let mut frame = RawFrame::allocate(8, 8, 6).unwrap();
        let result = sensor.wait_for_frame(&mut frame, Duration::from_millis(10));
        assert!(matches!(
            result,
            Err(SensorError::Frame(FrameError::SizeMismatch { .. }))
        ));
    }

    #[test]
    fn test_injected_faults() {
        let mut backend = SimBackend::new();
        let handle = backend.handle();

        handle.fail_next_sensor_opens(1);
        assert!(backend.open_sensor(small_mode()).is_err());
        let mut sensor = backend.open_sensor(small_mode()).unwrap();

        handle.fail_next_stream_starts(1);
        assert!(sensor.start_streaming().is_err());
        sensor.start_streaming().unwrap();

        handle.fail_next_frames(1);
        let mut frame = RawFrame::allocate(16, 10, 6).unwrap();
        let timeout = Duration::from_millis(5);
        assert!(matches!(
            sensor.wait_for_frame(&mut frame, timeout),
            Err(SensorError::Timeout(t)) if t == timeout
        ));
        sensor.wait_for_frame(&mut frame, timeout).unwrap();
        assert_eq!(handle.frames_served(), 1);
    }

    #[test]
    fn test_motor_records_positions() {
        let mut backend = SimBackend::new();
        let handle = backend.handle();
        let mut motor = backend.open_motor(0).unwrap();

        motor.set_position(100).unwrap();
        handle.fail_next_motor_commands(1);
        assert!(motor.set_position(200).is_err());
        motor.set_position(300).unwrap();
        assert_eq!(handle.positions(), vec![100, 300]);

        motor.close();
        motor.close();
        assert_eq!(handle.motor_closes(), 1);
        assert!(matches!(motor.set_position(1), Err(MotorError::Closed)));
    }

    #[test]
    fn test_missing_motor() {
        let mut backend = SimBackend::new();
        backend.handle().set_motor_missing(true);
        assert!(matches!(backend.open_motor(0), Err(MotorError::NotFound(0))));
        backend.handle().set_motor_missing(false);
        assert!(matches!(backend.open_motor(1), Err(MotorError::NotFound(1))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut backend = SimBackend::new();
        let handle = backend.handle();
        let mut sensor = backend.open_sensor(small_mode()).unwrap();
        sensor.start_streaming().unwrap();
        assert!(handle.is_streaming());
        sensor.close();
        sensor.close();
        assert_eq!(handle.sensor_closes(), 1);
        assert!(!handle.is_streaming());
    }
}
