use depthwall_hw::SensorMode;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// How a depth sample below the threshold becomes an 8-bit intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntensityMapping {
    /// Negate the scaled depth, truncate toward zero and wrap to 8 bits.
    /// Bit-compatible with the classic depth wall output: near pixels come
    /// out bright, `0` stays `0`.
    #[default]
    Wrapping,
    /// `255 - scaled`, saturating. Never wraps.
    Inverted,
}

impl IntensityMapping {
    /// Map `depth` (already known to be below the threshold) with `scale`.
    pub fn apply(self, depth: u16, scale: f32) -> u8 {
        let scaled = depth as f32 * scale;
        match self {
            Self::Wrapping => (-scaled) as i32 as u8,
            Self::Inverted => 255 - (scaled as i32).clamp(0, 255) as u8,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on users tracked per frame.
    pub max_users: u16,
    /// Successful cycles before the session is torn down and reopened.
    pub max_iterations: u32,
    /// Depth samples at or beyond this value are masked out. Must be > 0.
    pub depth_threshold: i32,
    /// Initial tilt angle, clamped to the actuator range.
    pub motor_angle: i32,
    /// Which backend motor to open.
    pub motor_index: usize,
    /// Fail session open when no motor is available.
    pub require_motor: bool,
    /// Longest wait for a single frame.
    pub frame_timeout_ms: u64,
    pub mode: SensorMode,
    pub intensity: IntensityMapping,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_users: 6,
            max_iterations: 10_000,
            depth_threshold: 6000,
            motor_angle: 10_000,
            motor_index: 0,
            require_motor: true,
            frame_timeout_ms: 2000,
            mode: SensorMode::VGA_30,
            intensity: IntensityMapping::Wrapping,
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(src: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_threshold(self.depth_threshold)?;
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.mode.width == 0 || self.mode.height == 0 {
            return Err(ConfigError::EmptyMode {
                width: self.mode.width,
                height: self.mode.height,
            });
        }
        if self.frame_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }
}

/// A depth threshold must be strictly positive.
pub fn validate_threshold(threshold: i32) -> Result<(), ConfigError> {
    if threshold <= 0 {
        return Err(ConfigError::NonPositiveThreshold(threshold));
    }
    Ok(())
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("depth threshold must be positive, got {0}")]
    NonPositiveThreshold(i32),
    #[error("max_iterations must be at least 1")]
    ZeroIterations,
    #[error("sensor mode {width}x{height} has no pixels")]
    EmptyMode { width: u32, height: u32 },
    #[error("frame timeout must be non-zero")]
    ZeroTimeout,
    #[error("bad config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}
