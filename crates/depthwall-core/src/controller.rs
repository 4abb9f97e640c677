//! Session lifecycle: acquisition loop, periodic self-reset, and the public
//! depth/user/tilt API.

use crate::actuator::Actuator;
use crate::config::SessionConfig;
use crate::error::ControllerError;
use crate::observer::{LogObserver, UserObserver};
use crate::processor::FrameProcessor;
use crate::session::DeviceSession;
use depthwall_hw::DeviceBackend;
use image::GrayImage;

/// Cycles between per-frame debug logs.
const LOG_EVERY: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Resetting,
    /// Setup or a reset failed; only [`DepthController::reset`] can recover.
    Failed,
}

/// Drives a [`DeviceSession`] through acquire/process cycles and reopens it
/// every `max_iterations` cycles.
pub struct DepthController<B: DeviceBackend> {
    session: DeviceSession<B>,
    processor: FrameProcessor,
    actuator: Actuator,
    state: SessionState,
    iterations: u32,
    max_iterations: u32,
    resets: u64,
}

impl<B: DeviceBackend> DepthController<B> {
    /// Open the devices and start streaming. User presence is logged.
    pub fn new(backend: B, config: SessionConfig) -> Result<Self, ControllerError> {
        Self::with_observer(backend, config, Box::new(LogObserver))
    }

    pub fn with_observer(
        backend: B,
        config: SessionConfig,
        observer: Box<dyn UserObserver>,
    ) -> Result<Self, ControllerError> {
        config.validate()?;
        let processor = FrameProcessor::new(
            config.mode.width,
            config.mode.height,
            config.depth_threshold,
            config.intensity,
        )?;
        let session = DeviceSession::new(backend, &config, observer)?;

        let mut controller = Self {
            session,
            processor,
            actuator: Actuator::new(config.motor_angle),
            state: SessionState::Failed,
            iterations: 0,
            max_iterations: config.max_iterations,
            resets: 0,
        };
        controller.init()?;
        controller.state = SessionState::Running;
        Ok(controller)
    }

    /// Acquire and process one frame.
    ///
    /// When `max_iterations` cycles have completed since the last
    /// (re)initialization, the session is reset instead; the reset's own
    /// cycle stands in for this one.
    pub fn update(&mut self) -> Result<(), ControllerError> {
        if self.state == SessionState::Failed {
            return Err(ControllerError::SessionFailed);
        }
        if self.iterations >= self.max_iterations {
            return self.reset();
        }
        self.cycle()
    }

    /// Close and reopen the devices, restart streaming, and run one cycle.
    ///
    /// Any failure leaves the controller [`SessionState::Failed`].
    pub fn reset(&mut self) -> Result<(), ControllerError> {
        tracing::info!(
            iterations = self.iterations,
            resets = self.resets,
            "resetting device session"
        );
        self.state = SessionState::Resetting;
        self.session.close();
        self.iterations = 0;

        match self.reinit_and_cycle() {
            Ok(()) => {
                self.state = SessionState::Running;
                self.resets += 1;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "session reset failed");
                self.session.close();
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Adjust the depth threshold by `delta` and return the new value.
    ///
    /// A result that is not positive is rejected; the threshold is unchanged.
    pub fn set_depth(&mut self, delta: i32) -> Result<i32, ControllerError> {
        let threshold = self.processor.threshold().saturating_add(delta);
        self.processor.set_threshold(threshold)?;
        tracing::debug!(threshold, scale = self.processor.scale(), "depth threshold changed");
        Ok(threshold)
    }

    /// Tilt by `delta`, clamped to the actuator range. Returns the new angle.
    pub fn set_motor_angle(&mut self, delta: i32) -> Result<i32, ControllerError> {
        let result = self.actuator.set_angle(delta, self.session.motor_mut());
        self.actuator_result(result)
    }

    /// Return to the angle recorded at construction.
    pub fn reset_motor_angle(&mut self) -> Result<i32, ControllerError> {
        let result = self.actuator.reset_angle(self.session.motor_mut());
        self.actuator_result(result)
    }

    /// Mirrored depth intensities from the last successful cycle.
    pub fn depth_matrix(&self) -> &GrayImage {
        self.processor.depth()
    }

    /// Mirrored user labels from the last successful cycle.
    pub fn users_matrix(&self) -> &GrayImage {
        self.processor.users()
    }

    /// Successful cycles since the last (re)initialization.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Completed resets since construction.
    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn depth_threshold(&self) -> i32 {
        self.processor.threshold()
    }

    pub fn motor_angle(&self) -> i32 {
        self.actuator.current()
    }

    pub fn initial_motor_angle(&self) -> i32 {
        self.actuator.initial()
    }

    pub fn tracked_users(&self) -> &[u16] {
        self.session.tracked_users()
    }

    pub fn has_motor(&self) -> bool {
        self.session.has_motor()
    }

    /// Fraction of pixels with a depth reading in the last frame.
    pub fn valid_fraction(&self) -> f32 {
        self.session.frame().valid_fraction()
    }

    pub fn backend(&self) -> &B {
        self.session.backend()
    }

    /// Release the devices. The controller is `Failed` afterwards.
    pub fn close(&mut self) {
        self.session.close();
        self.state = SessionState::Failed;
    }

    fn init(&mut self) -> Result<(), ControllerError> {
        self.iterations = 0;
        self.session.open()?;
        if self.session.has_motor() {
            if let Err(e) = self.actuator.apply(self.session.motor_mut()) {
                tracing::warn!(error = %e, angle = self.actuator.current(), "failed to restore tilt angle");
            }
        }
        self.session.start_streaming()
    }

    fn reinit_and_cycle(&mut self) -> Result<(), ControllerError> {
        self.init()?;
        self.cycle()
    }

    fn cycle(&mut self) -> Result<(), ControllerError> {
        let frame = self.session.wait_for_next_frame()?;
        self.processor.process(frame)?;
        self.iterations += 1;

        if self.iterations % LOG_EVERY == 0 {
            tracing::debug!(
                iterations = self.iterations,
                users = self.session.tracked_users().len(),
                "processed frame"
            );
        }
        Ok(())
    }

    fn actuator_result(
        &self,
        result: Result<i32, depthwall_hw::MotorError>,
    ) -> Result<i32, ControllerError> {
        result.map_err(|e| {
            tracing::warn!(error = %e, angle = self.actuator.current(), "tilt command failed");
            ControllerError::Actuator(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntensityMapping;
    use crate::error::Phase;
    use depthwall_hw::{SensorError, SensorMode, SimBackend, SimHandle};

    fn small_config() -> SessionConfig {
        SessionConfig {
            mode: SensorMode {
                width: 16,
                height: 10,
                fps: 30,
            },
            frame_timeout_ms: 50,
            ..SessionConfig::default()
        }
    }

    fn controller(config: SessionConfig) -> (DepthController<SimBackend>, SimHandle) {
        let backend = SimBackend::new();
        let handle = backend.handle();
        let controller = DepthController::new(backend, config).unwrap();
        (controller, handle)
    }

    #[test]
    fn test_new_opens_and_applies_angle() {
        let (c, handle) = controller(small_config());
        assert_eq!(c.state(), SessionState::Running);
        assert_eq!(c.iterations(), 0);
        assert_eq!(handle.sensor_opens(), 1);
        assert!(handle.is_streaming());
        assert_eq!(handle.positions(), vec![10_000]);
    }

    #[test]
    fn test_new_clamps_motor_angle() {
        let config = SessionConfig {
            motor_angle: 20_000,
            ..small_config()
        };
        let (c, handle) = controller(config);
        assert_eq!(c.initial_motor_angle(), 15_000);
        assert_eq!(c.motor_angle(), 15_000);
        assert_eq!(handle.last_position(), Some(15_000));
    }

    #[test]
    fn test_new_rejects_bad_threshold() {
        let config = SessionConfig {
            depth_threshold: 0,
            ..small_config()
        };
        let result = DepthController::new(SimBackend::new(), config);
        assert!(matches!(result, Err(ControllerError::Config(_))));
    }

    #[test]
    fn test_new_surfaces_device_init_failure() {
        let backend = SimBackend::new();
        backend.handle().fail_next_stream_starts(1);
        let result = DepthController::new(backend, small_config());
        assert!(matches!(
            result,
            Err(ControllerError::DeviceInit {
                phase: Phase::StartStreaming,
                ..
            })
        ));
    }

    #[test]
    fn test_update_counts_iterations() {
        let (mut c, _) = controller(small_config());
        c.update().unwrap();
        c.update().unwrap();
        assert_eq!(c.iterations(), 2);
        assert_eq!(c.resets(), 0);
    }

    #[test]
    fn test_periodic_reset() {
        let config = SessionConfig {
            max_iterations: 2,
            ..small_config()
        };
        let (mut c, handle) = controller(config);
        for _ in 0..3 {
            c.update().unwrap();
        }
        assert_eq!(c.resets(), 1);
        assert_eq!(c.iterations(), 1);
        assert_eq!(handle.sensor_opens(), 2);
        assert_eq!(handle.sensor_closes(), 1);
    }

    #[test]
    fn test_one_reset_per_max_iterations_cycles() {
        let config = SessionConfig {
            max_iterations: 3,
            ..small_config()
        };
        let (mut c, _) = controller(config);
        let mut resets_seen = Vec::new();
        for _ in 0..10 {
            c.update().unwrap();
            resets_seen.push(c.resets());
        }
        assert_eq!(resets_seen, vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3]);
        assert_eq!(c.iterations(), 1);
    }

    #[test]
    fn test_explicit_reset_zeroes_counter_then_cycles() {
        let (mut c, handle) = controller(small_config());
        c.update().unwrap();
        c.update().unwrap();
        c.update().unwrap();
        c.reset().unwrap();
        assert_eq!(c.iterations(), 1);
        assert_eq!(c.state(), SessionState::Running);
        // the current angle is re-applied on reopen
        assert_eq!(handle.positions(), vec![10_000, 10_000]);
    }

    #[test]
    fn test_failed_update_does_not_count() {
        let (mut c, handle) = controller(small_config());
        handle.fail_next_frames(1);
        let err = c.update().unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Acquisition(SensorError::Timeout(_))
        ));
        assert!(err.is_recoverable());
        assert_eq!(c.iterations(), 0);
        assert_eq!(c.state(), SessionState::Running);

        c.update().unwrap();
        assert_eq!(c.iterations(), 1);
    }

    #[test]
    fn test_failed_reset_is_fatal_until_reset_succeeds() {
        let (mut c, handle) = controller(small_config());
        handle.fail_next_sensor_opens(1);
        let err = c.reset().unwrap_err();
        assert!(matches!(
            err,
            ControllerError::DeviceInit {
                phase: Phase::OpenSensor,
                ..
            }
        ));
        assert_eq!(c.state(), SessionState::Failed);
        assert!(matches!(c.update(), Err(ControllerError::SessionFailed)));

        c.reset().unwrap();
        assert_eq!(c.state(), SessionState::Running);
        c.update().unwrap();
        assert_eq!(c.iterations(), 2);
    }

    #[test]
    fn test_reset_cycle_failure_propagates() {
        let (mut c, handle) = controller(small_config());
        handle.fail_next_frames(1);
        assert!(matches!(c.reset(), Err(ControllerError::Acquisition(_))));
        assert_eq!(c.state(), SessionState::Failed);
        assert!(!handle.is_streaming());
    }

    #[test]
    fn test_matrices_follow_frames() {
        let (mut c, _) = controller(small_config());
        assert!(c.users_matrix().iter().all(|&v| v == 0));
        c.update().unwrap();

        // user at depth 2500 (< 6000) occupies raw x 0..4, mirrored to 12..16
        let users = c.users_matrix();
        let depth = c.depth_matrix();
        assert_eq!(users.dimensions(), (16, 10));
        for y in 4..10 {
            for x in 0..16 {
                let expected_user = if x >= 12 { 1 } else { 0 };
                assert_eq!(users.get_pixel(x, y).0[0], expected_user, "({x},{y})");
                if x >= 12 {
                    assert_ne!(depth.get_pixel(x, y).0[0], 0);
                } else {
                    // wall at 8000 is beyond the threshold
                    assert_eq!(depth.get_pixel(x, y).0[0], 0);
                }
            }
        }
        assert_eq!(c.tracked_users(), &[1]);
    }

    #[test]
    fn test_set_depth_recomputes_and_rejects() {
        let config = SessionConfig {
            intensity: IntensityMapping::Inverted,
            ..small_config()
        };
        let (mut c, _) = controller(config);
        assert_eq!(c.set_depth(3000).unwrap(), 9000);
        c.update().unwrap();
        // the wall at 8000 is now inside the threshold
        assert!(c.depth_matrix().iter().all(|&v| v != 0));

        assert!(matches!(c.set_depth(-9000), Err(ControllerError::Config(_))));
        assert_eq!(c.depth_threshold(), 9000);
    }

    #[test]
    fn test_motor_angle_commands() {
        let (mut c, handle) = controller(small_config());
        assert_eq!(c.set_motor_angle(2500).unwrap(), 12_500);
        assert_eq!(c.set_motor_angle(5000).unwrap(), 15_000);
        assert_eq!(c.reset_motor_angle().unwrap(), 10_000);
        assert_eq!(handle.positions(), vec![10_000, 12_500, 15_000, 10_000]);
    }

    #[test]
    fn test_motor_failure_is_recoverable() {
        let (mut c, handle) = controller(small_config());
        handle.fail_next_motor_commands(1);
        let err = c.set_motor_angle(-1000).unwrap_err();
        assert!(matches!(err, ControllerError::Actuator(_)));
        assert!(err.is_recoverable());
        assert_eq!(c.motor_angle(), 9000);

        c.update().unwrap();
        assert_eq!(c.state(), SessionState::Running);
    }

    #[test]
    fn test_close_marks_failed() {
        let (mut c, handle) = controller(small_config());
        c.close();
        assert_eq!(c.state(), SessionState::Failed);
        assert_eq!(handle.sensor_closes(), 1);
        assert!(matches!(c.update(), Err(ControllerError::SessionFailed)));
    }
}
