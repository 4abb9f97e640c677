//! Tilt angle bookkeeping.

use depthwall_hw::{clamp_tilt, MotorError, TiltMotor};

/// Tracks the initial and current tilt angle and pushes changes to a motor.
///
/// Both angles are clamped to the actuator range on every mutation. A failed
/// motor command still updates the stored angle, so reopening the session
/// re-applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actuator {
    initial: i32,
    current: i32,
}

impl Actuator {
    pub fn new(angle: i32) -> Self {
        let angle = clamp_tilt(angle);
        Self {
            initial: angle,
            current: angle,
        }
    }

    /// Angle recorded at construction.
    pub fn initial(&self) -> i32 {
        self.initial
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    /// Add `delta` to the current angle, clamp, and apply.
    pub fn set_angle<M: TiltMotor>(
        &mut self,
        delta: i32,
        motor: Option<&mut M>,
    ) -> Result<i32, MotorError> {
        self.current = clamp_tilt(self.current.saturating_add(delta));
        self.apply(motor)?;
        Ok(self.current)
    }

    /// Restore the construction-time angle and apply it.
    pub fn reset_angle<M: TiltMotor>(&mut self, motor: Option<&mut M>) -> Result<i32, MotorError> {
        self.current = self.initial;
        self.apply(motor)?;
        Ok(self.current)
    }

    /// Send the current angle to `motor`.
    pub fn apply<M: TiltMotor>(&self, motor: Option<&mut M>) -> Result<(), MotorError> {
        let motor = motor.ok_or(MotorError::Closed)?;
        motor.set_position(self.current)
    }
}
