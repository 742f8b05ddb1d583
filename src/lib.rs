//! # DMF Control RS
//!
//! A Rust library for driving digital-microfluidics (DMF) control boards and
//! measuring the feedback they report.
//!
//! The board switches a high-voltage AC waveform onto electrodes to move
//! droplets. While it actuates, it samples the amplifier output and the
//! current through the device, from which this library derives impedance,
//! capacitance and the electrostatic force acting on the droplet.
//!
//! ## Features
//!
//! - **Framed serial protocol**: CRC-checked request/response frames over `serialport`
//! - **Connection lifecycle**: handshake with firmware, Aref and VGND checks, port discovery
//! - **Watchdog lease**: background refresh so the board powers down if the host goes away
//! - **Safety limits**: predicted and measured current, waveform limits, voltage tolerance
//! - **Calibration**: reference and device load wizards, stray capacitance cache, board storage
//! - **Protocols**: sample scheduling, force feedback retries, frequency and voltage sweeps
//! - **DataFrame output**: measurement series as `polars` frames
//!
//! ## Examples
//!
//! ### Running a protocol
//!
//! ```rust,no_run
//! use dmf_control_rs::{ControlBoardConfig, DmfControlBoard, FeedbackAction, ProtocolStep, RetryPolicy};
//! use std::time::Duration;
//!
//! let mut board = DmfControlBoard::new(ControlBoardConfig::default())?;
//! board.connect_any()?;
//!
//! let step = ProtocolStep::new(100.0, 10e3, Duration::from_millis(500))
//!     .with_samples(50)
//!     .with_channels(vec![true, false, true], 4.0)
//!     .with_feedback(FeedbackAction::Retry(RetryPolicy {
//!         max_attempts: 3,
//!         acceptable_force: (15.0, 40.0),
//!         increase_voltage: 10.0,
//!     }));
//!
//! for report in board.run_protocol(&[step]).into_result()? {
//!     if let Some(result) = report.last_measurement() {
//!         println!("Step {}: {:.2} µN/mm", report.index, result.force_estimate);
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Calibration
//!
//! ```rust,no_run
//! use dmf_control_rs::{CalibrationKind, DmfControlBoard};
//!
//! let mut board = DmfControlBoard::from_toml_str("[serial]\nport = \"/dev/ttyACM0\"\n")?;
//! board.connect("/dev/ttyACM0")?;
//! let profile = board.run_calibration_wizard(CalibrationKind::ReferenceLoad {
//!     test_voltage: 50.0,
//!     frequency: 1e3,
//!     reference_resistance: 25e3,
//! })?;
//! println!("Amplifier gain: {:.1}", profile.amplifier_gain);
//! board.write_calibration()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod board_protocol;
pub mod calibration;
pub mod config;
pub mod control_board;
pub mod device_session;
pub mod measurement;
pub mod post_processing;
pub mod protocol_executor;
pub mod safety;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
mod sim_board;

// Re-export the main types for convenience
pub use control_board::{ControlBoardError, DmfControlBoard};

pub use config::{ConfigError, ControlBoardConfig, FeedbackConfig, WaveformLimits};

pub use calibration::{CalibrationError, CalibrationKind, CalibrationProfile, CalibrationStore};

pub use device_session::{DeviceSession, HandshakeInfo, SessionError, SessionState};

pub use protocol_executor::{
    CancelHandle, ExecutorError, FeedbackAction, ProtocolOutcome, ProtocolReport, ProtocolRun, ProtocolStep,
    RetryPolicy, StepReport, StepStatus,
};

pub use measurement::MeasurementResult;

pub use post_processing::FilterConfig;

pub use safety::{SafetyError, ToleranceWarning};

pub use transport::{SerialTransport, Transport, TransportError};
