use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::post_processing::FilterConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Preferred port; `None` scans every available port.
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Bound on a single request/response exchange.
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            timeout_ms: 1000,
        }
    }
}

impl SerialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub refresh_interval_ms: u64,
    /// Time after which the board firmware cuts the power supply on its own.
    pub board_timeout_ms: u16,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: 2000,
            board_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformLimits {
    pub max_voltage: f64,
    pub min_frequency: f64,
    pub max_frequency: f64,
    /// Capacitance per actuated area (F/mm²) assumed when predicting the
    /// current of a load no baseline has been measured for yet.
    pub max_capacitance_per_area: f64,
}

impl Default for WaveformLimits {
    fn default() -> Self {
        Self {
            max_voltage: 200.0,
            min_frequency: 100.0,
            max_frequency: 20e3,
            max_capacitance_per_area: 5e-12,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub sampling_window_ms: u16,
    /// Lower bound on the pause the board takes between sampling windows.
    pub min_delay_between_windows_ms: u16,
    pub use_rms: bool,
    pub use_anti_aliasing_filter: bool,
    pub normalize_force: bool,
    /// Re-issue the actuation voltage with a corrected set point when the
    /// measured voltage misses it by more than the calibration tolerance.
    pub auto_adjust_amplifier_gain: bool,
    /// Windows sampled with all switches off when measuring stray capacitance.
    pub stabilization_windows: u16,
    pub filter: FilterConfig,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            sampling_window_ms: 10,
            min_delay_between_windows_ms: 0,
            use_rms: true,
            use_anti_aliasing_filter: true,
            normalize_force: true,
            auto_adjust_amplifier_gain: false,
            stabilization_windows: 5,
            filter: FilterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Name the board firmware reports for itself.
    pub device_name: String,
    /// Oldest firmware major version the session will talk to.
    pub min_firmware_major: u64,
    /// Accepted VGND deviation from Aref/2, as a fraction of Aref/2.
    pub vgnd_band_fraction: f64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            device_name: "Arduino DMF Controller".to_string(),
            min_firmware_major: 2,
            vgnd_band_fraction: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlBoardConfig {
    pub serial: SerialConfig,
    pub watchdog: WatchdogConfig,
    pub limits: WaveformLimits,
    pub feedback: FeedbackConfig,
    pub identity: IdentityConfig,
}

impl ControlBoardConfig {
    /// Parse and validate a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate", "must be positive"));
        }
        if self.serial.timeout_ms == 0 {
            return Err(invalid("serial.timeout_ms", "must be positive"));
        }
        if self.watchdog.refresh_interval_ms == 0
            || self.watchdog.refresh_interval_ms >= u64::from(self.watchdog.board_timeout_ms)
        {
            return Err(invalid(
                "watchdog.refresh_interval_ms",
                format!(
                    "{} ms must be positive and shorter than the {} ms board timeout",
                    self.watchdog.refresh_interval_ms, self.watchdog.board_timeout_ms
                ),
            ));
        }
        let limits = &self.limits;
        if limits.max_voltage <= 0.0 {
            return Err(invalid("limits.max_voltage", "must be positive"));
        }
        if limits.min_frequency <= 0.0 || limits.min_frequency > limits.max_frequency {
            return Err(invalid(
                "limits.min_frequency",
                format!(
                    "{} Hz..{} Hz is not a valid band",
                    limits.min_frequency, limits.max_frequency
                ),
            ));
        }
        if !limits.max_capacitance_per_area.is_finite() || limits.max_capacitance_per_area <= 0.0 {
            return Err(invalid("limits.max_capacitance_per_area", "must be positive"));
        }
        if self.feedback.sampling_window_ms == 0 {
            return Err(invalid("feedback.sampling_window_ms", "must be positive"));
        }
        if self.feedback.stabilization_windows == 0 {
            return Err(invalid("feedback.stabilization_windows", "must be positive"));
        }
        self.feedback
            .filter
            .validate()
            .map_err(|e| invalid("feedback.filter", e.to_string()))?;
        if !(0.0..1.0).contains(&self.identity.vgnd_band_fraction) {
            return Err(invalid("identity.vgnd_band_fraction", "must be within [0, 1)"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ControlBoardConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = ControlBoardConfig::from_toml_str(
            r#"
            [serial]
            port = "/dev/ttyACM0"
            baud_rate = 57600

            [feedback]
            use_anti_aliasing_filter = false
            filter = { enabled = true, window = 7, order = 2 }
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.serial.baud_rate, 57600);
        assert_eq!(config.serial.timeout_ms, 1000);
        assert!(!config.feedback.use_anti_aliasing_filter);
        assert_eq!(config.feedback.filter.window, 7);
        assert_eq!(config.watchdog, WatchdogConfig::default());
    }

    #[test]
    fn test_watchdog_interval_must_undercut_board_timeout() {
        let err = ControlBoardConfig::from_toml_str(
            "[watchdog]\nrefresh_interval_ms = 5000\nboard_timeout_ms = 5000\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "watchdog.refresh_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_even_filter_window_rejected() {
        let err = ControlBoardConfig::from_toml_str(
            "[feedback.filter]\nenabled = true\nwindow = 6\norder = 2\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "feedback.filter", .. }));
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        assert!(matches!(
            ControlBoardConfig::from_toml_str("[serial\nbaud_rate = 1"),
            Err(ConfigError::Parse(_))
        ));
    }
}
