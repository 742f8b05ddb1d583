use crate::calibration::{CalibrationError, CalibrationKind, CalibrationProfile, CalibrationStore};
use crate::config::{ConfigError, ControlBoardConfig};
use crate::device_session::{DeviceSession, HandshakeInfo, SessionError, SessionState, TransportOpener};
use crate::protocol_executor::{CancelHandle, ProtocolExecutor, ProtocolReport, ProtocolStep};

#[derive(Debug, thiserror::Error)]
pub enum ControlBoardError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
}

/// A DMF control board: connection, calibration and protocol execution
/// behind one handle.
///
/// Every call blocks until the board has answered; run it off any UI thread
/// and use [`DmfControlBoard::cancel_handle`] to stop a protocol from elsewhere.
pub struct DmfControlBoard {
    session: DeviceSession,
    calibration: CalibrationStore,
    executor: ProtocolExecutor,
}

impl DmfControlBoard {
    pub fn new(config: ControlBoardConfig) -> Result<Self, ControlBoardError> {
        config.validate()?;
        Ok(Self::from_session(DeviceSession::new(config)))
    }

    /// Board reached through a custom transport, e.g. a network bridge.
    pub fn with_opener(config: ControlBoardConfig, opener: TransportOpener) -> Result<Self, ControlBoardError> {
        config.validate()?;
        Ok(Self::from_session(DeviceSession::with_opener(config, opener)))
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ControlBoardError> {
        Self::new(ControlBoardConfig::from_toml_str(text)?)
    }

    fn from_session(session: DeviceSession) -> Self {
        Self {
            session,
            calibration: CalibrationStore::default(),
            executor: ProtocolExecutor::new(),
        }
    }

    pub fn config(&self) -> &ControlBoardConfig {
        self.session.config()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_ready()
    }

    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.session.handshake()
    }

    /// Connect on `port` at the configured baud rate.
    pub fn connect(&mut self, port: &str) -> Result<HandshakeInfo, ControlBoardError> {
        let baud_rate = self.config().serial.baud_rate;
        Ok(self.session.connect(port, baud_rate)?)
    }

    /// Connect on the configured port, or the first port with a working board.
    pub fn connect_any(&mut self) -> Result<HandshakeInfo, ControlBoardError> {
        let baud_rate = self.config().serial.baud_rate;
        Ok(self.session.connect_any(baud_rate)?)
    }

    pub fn disconnect(&mut self) -> Result<(), ControlBoardError> {
        Ok(self.session.disconnect()?)
    }

    pub fn set_realtime_mode(&mut self, enabled: bool) -> Result<(), ControlBoardError> {
        Ok(self.session.set_realtime_mode(enabled)?)
    }

    pub fn realtime_mode(&self) -> bool {
        self.session.realtime_mode()
    }

    /// Run `steps` in order. Aborts, cancellation and tolerance warnings
    /// are all carried by the report.
    pub fn run_protocol(&mut self, steps: &[ProtocolStep]) -> ProtocolReport {
        self.executor
            .run_protocol(&mut self.session, &mut self.calibration, steps)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.executor.cancel_handle()
    }

    pub fn cancel(&self) {
        self.executor.cancel_handle().cancel();
    }

    pub fn calibration_profile(&self) -> CalibrationProfile {
        self.calibration.save()
    }

    pub fn set_calibration_profile(&mut self, profile: CalibrationProfile) -> Result<(), ControlBoardError> {
        Ok(self.calibration.load(profile)?)
    }

    pub fn run_calibration_wizard(&mut self, kind: CalibrationKind) -> Result<CalibrationProfile, ControlBoardError> {
        Ok(self
            .calibration
            .run_calibration_wizard(&mut self.session, kind)?)
    }

    /// Replace the active calibration with the one stored on the board.
    pub fn reload_calibration(&mut self) -> Result<CalibrationProfile, ControlBoardError> {
        Ok(self.calibration.reload_from_device(&mut self.session)?)
    }

    /// Store the active calibration on the board.
    pub fn write_calibration(&mut self) -> Result<(), ControlBoardError> {
        Ok(self.calibration.write_to_device(&mut self.session)?)
    }
}
