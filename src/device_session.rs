use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::board_protocol::{
    BoardCommand, BoardProtocolError, BoardResponse, SampleChunk, SamplingFlags,
};
use crate::config::ControlBoardConfig;
use crate::measurement::{adc_to_volts, SampleBuffer};
use crate::transport::{SerialTransport, Transport, TransportError};
use crate::watchdog::{self, SharedTransport, WatchdogLease};
use std::sync::{Arc, Mutex};

/// Opens a transport for `(port, baud_rate, timeout)`.
pub type TransportOpener =
    Box<dyn FnMut(&str, u32, Duration) -> Result<Box<dyn Transport>, TransportError> + Send>;

/// Smallest pause between buffer polls while a measurement runs.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] BoardProtocolError),

    #[error("No answer to the handshake on {port}")]
    DeviceNotResponding { port: String },

    #[error("Unsupported board: found {found}, expected {expected}")]
    IdentityMismatch { expected: String, found: String },

    #[error("Unreadable firmware version '{0}'")]
    InvalidFirmwareVersion(String),

    #[error("VGND out of range: high {high:.3} V, low {low:.3} V, accepted {min:.3}..{max:.3} V")]
    VgndOutOfRange {
        high: f64,
        low: f64,
        min: f64,
        max: f64,
    },

    #[error("Unexpected reply to {command}")]
    UnexpectedResponse { command: &'static str },

    #[error("No control board is connected")]
    NotConnected,

    #[error("No serial port with a working control board found")]
    NoBoardFound,

    #[error("Watchdog refresh interval {interval:?} must be shorter than board timeout {board_timeout:?}")]
    InvalidWatchdogInterval {
        interval: Duration,
        board_timeout: Duration,
    },

    #[error("Failed to start watchdog thread: {0}")]
    WatchdogThread(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// What the board told us about itself during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeInfo {
    pub firmware_version: semver::Version,
    pub serial_number: String,
    pub aref_volts: f64,
    pub bus_devices: Vec<u8>,
    pub channel_count: u16,
    pub vgnd_high_volts: f64,
    pub vgnd_low_volts: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub port: String,
    pub baud_rate: u32,
    pub handshake: HandshakeInfo,
}

/// Timing of one measurement on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingRequest {
    pub sampling_window_ms: u16,
    pub n_windows: u16,
    pub delay_between_windows_ms: u16,
    pub flags: SamplingFlags,
}

impl SamplingRequest {
    pub fn period(&self) -> Duration {
        Duration::from_millis(u64::from(self.sampling_window_ms) + u64::from(self.delay_between_windows_ms))
    }

    pub fn duration(&self) -> Duration {
        self.period() * u32::from(self.n_windows)
    }
}

/// Samples gathered by [`DeviceSession::acquire_samples`].
#[derive(Debug, Clone)]
pub struct Acquisition {
    pub buffer: SampleBuffer,
    /// The stop predicate fired before the board finished.
    pub interrupted: bool,
}

struct Link {
    connection: Connection,
    transport: SharedTransport,
    lease: Option<WatchdogLease>,
}

pub struct DeviceSession {
    config: ControlBoardConfig,
    opener: TransportOpener,
    state: SessionState,
    link: Option<Link>,
    realtime_mode: bool,
}

impl DeviceSession {
    /// Session that talks to real serial ports.
    pub fn new(config: ControlBoardConfig) -> Self {
        Self::with_opener(
            config,
            Box::new(|port, baud_rate, timeout| {
                let transport = SerialTransport::open(port, baud_rate, timeout)?;
                Ok(Box::new(transport) as Box<dyn Transport>)
            }),
        )
    }

    pub fn with_opener(config: ControlBoardConfig, opener: TransportOpener) -> Self {
        Self {
            config,
            opener,
            state: SessionState::Disconnected,
            link: None,
            realtime_mode: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.link.as_ref().map(|link| &link.connection)
    }

    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.connection().map(|connection| &connection.handshake)
    }

    pub fn config(&self) -> &ControlBoardConfig {
        &self.config
    }

    pub fn realtime_mode(&self) -> bool {
        self.realtime_mode
    }

    pub fn watchdog_refresh_count(&self) -> Option<u64> {
        self.link
            .as_ref()
            .and_then(|link| link.lease.as_ref())
            .map(WatchdogLease::refresh_count)
    }

    pub fn supports_partial_reads(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| watchdog::lock(&link.transport).supports_partial_reads())
    }

    /// Names of the serial ports present on this machine.
    pub fn available_ports() -> Result<Vec<String>, SessionError> {
        let ports = serialport::available_ports().map_err(TransportError::from)?;
        Ok(ports.into_iter().map(|port| port.port_name).collect())
    }

    /// Connect to the board on `port`, handshake, power it up and start the watchdog.
    ///
    /// Calling this again with the same port and baud rate while ready
    /// returns the cached handshake without touching the link.
    pub fn connect(&mut self, port: &str, baud_rate: u32) -> Result<HandshakeInfo, SessionError> {
        if let Some(link) = &self.link {
            if self.state == SessionState::Ready
                && link.connection.port == port
                && link.connection.baud_rate == baud_rate
            {
                log::debug!("Already connected to {} at {} baud", port, baud_rate);
                return Ok(link.connection.handshake.clone());
            }
            log::info!(
                "Switching from {} to {}; disconnecting first",
                link.connection.port,
                port
            );
            if let Err(e) = self.disconnect() {
                log::warn!("Disconnect before reconnect failed: {}", e);
            }
        }

        self.state = SessionState::Connecting;
        log::debug!("Connecting to control board on port {}", port);
        let transport = match (self.opener)(port, baud_rate, self.config.serial.timeout()) {
            Ok(transport) => Arc::new(Mutex::new(transport)),
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(e.into());
            }
        };

        self.state = SessionState::Handshaking;
        let result = self
            .handshake_with(&transport, port)
            .and_then(|handshake| self.power_up(&transport).map(|lease| (handshake, lease)));

        match result {
            Ok((handshake, lease)) => {
                log::info!(
                    "Connected to control board {} (firmware {}) on {}",
                    handshake.serial_number,
                    handshake.firmware_version,
                    port
                );
                self.link = Some(Link {
                    connection: Connection {
                        port: port.to_string(),
                        baud_rate,
                        handshake: handshake.clone(),
                    },
                    transport,
                    lease: Some(lease),
                });
                self.state = SessionState::Ready;
                Ok(handshake)
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {}", port, e);
                watchdog::lock(&transport).close();
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Try the configured port first, then every other port on the machine.
    pub fn connect_any(&mut self, baud_rate: u32) -> Result<HandshakeInfo, SessionError> {
        let mut candidates = Vec::new();
        if let Some(port) = self.config.serial.port.clone() {
            candidates.push(port);
        }
        match Self::available_ports() {
            Ok(ports) => candidates.extend(ports),
            Err(e) => log::warn!("Could not enumerate serial ports: {}", e),
        }
        self.connect_first(&candidates, baud_rate)
    }

    pub(crate) fn connect_first(
        &mut self,
        candidates: &[String],
        baud_rate: u32,
    ) -> Result<HandshakeInfo, SessionError> {
        let mut tried = Vec::new();
        let mut mismatch = None;
        for port in candidates {
            if tried.contains(port) {
                continue;
            }
            tried.push(port.clone());
            match self.connect(port, baud_rate) {
                Ok(handshake) => return Ok(handshake),
                Err(e @ SessionError::IdentityMismatch { .. }) => {
                    log::warn!("Unsupported board on {}: {}. Checking other ports...", port, e);
                    mismatch.get_or_insert(e);
                }
                Err(e) => log::warn!("No control board on {}: {}. Checking other ports...", port, e),
            }
        }
        Err(mismatch.unwrap_or(SessionError::NoBoardFound))
    }

    fn handshake_with(
        &self,
        transport: &SharedTransport,
        port: &str,
    ) -> Result<HandshakeInfo, SessionError> {
        let identity = &self.config.identity;
        let device_name = match watchdog::exchange(transport, &BoardCommand::GetDeviceName) {
            Ok(BoardResponse::DeviceName(name)) => name,
            Ok(_) => return Err(SessionError::UnexpectedResponse { command: "GetDeviceName" }),
            Err(SessionError::Transport(TransportError::Timeout { .. })) => {
                return Err(SessionError::DeviceNotResponding {
                    port: port.to_string(),
                })
            }
            Err(e) => return Err(e),
        };
        if device_name != identity.device_name {
            return Err(SessionError::IdentityMismatch {
                expected: format!("device '{}'", identity.device_name),
                found: format!("device '{device_name}'"),
            });
        }

        let version_text = match watchdog::exchange(transport, &BoardCommand::GetFirmwareVersion)? {
            BoardResponse::FirmwareVersion(text) => text,
            _ => {
                return Err(SessionError::UnexpectedResponse {
                    command: "GetFirmwareVersion",
                })
            }
        };
        let firmware_version = semver::Version::parse(&version_text)
            .map_err(|_| SessionError::InvalidFirmwareVersion(version_text.clone()))?;
        log::debug!("{} firmware version: {}", device_name, firmware_version);
        if firmware_version.major < identity.min_firmware_major {
            return Err(SessionError::IdentityMismatch {
                expected: format!("firmware {}.x or newer", identity.min_firmware_major),
                found: format!("firmware {firmware_version}"),
            });
        }

        let serial_number = match watchdog::exchange(transport, &BoardCommand::GetSerialNumber)? {
            BoardResponse::SerialNumber(serial) => serial,
            _ => return Err(SessionError::UnexpectedResponse { command: "GetSerialNumber" }),
        };
        let aref_volts = match watchdog::exchange(transport, &BoardCommand::GetAref)? {
            BoardResponse::Aref(volts) => f64::from(volts),
            _ => return Err(SessionError::UnexpectedResponse { command: "GetAref" }),
        };
        let bus_devices = match watchdog::exchange(transport, &BoardCommand::BusScan)? {
            BoardResponse::BusDevices(addresses) => addresses,
            _ => return Err(SessionError::UnexpectedResponse { command: "BusScan" }),
        };
        for address in &bus_devices {
            log::info!("Bus device found at address 0x{:02x}", address);
        }
        let channel_count = match watchdog::exchange(transport, &BoardCommand::GetChannelCount)? {
            BoardResponse::ChannelCount(count) => count,
            _ => return Err(SessionError::UnexpectedResponse { command: "GetChannelCount" }),
        };

        let (vgnd_high_volts, vgnd_low_volts) = match watchdog::exchange(transport, &BoardCommand::MeasureVgnd)? {
            BoardResponse::Vgnd { high_adc, low_adc } => (
                adc_to_volts(high_adc, aref_volts),
                adc_to_volts(low_adc, aref_volts),
            ),
            _ => return Err(SessionError::UnexpectedResponse { command: "MeasureVgnd" }),
        };
        let nominal = aref_volts / 2.0;
        let band = nominal * self.config.identity.vgnd_band_fraction;
        let (min, max) = (nominal - band, nominal + band);
        if ![vgnd_high_volts, vgnd_low_volts]
            .iter()
            .all(|v| (min..=max).contains(v))
        {
            return Err(SessionError::VgndOutOfRange {
                high: vgnd_high_volts,
                low: vgnd_low_volts,
                min,
                max,
            });
        }
        log::debug!(
            "Serial {}, Aref {:.3} V, {} channels, VGND {:.3}/{:.3} V",
            serial_number,
            aref_volts,
            channel_count,
            vgnd_high_volts,
            vgnd_low_volts
        );

        Ok(HandshakeInfo {
            firmware_version,
            serial_number,
            aref_volts,
            bus_devices,
            channel_count,
            vgnd_high_volts,
            vgnd_low_volts,
        })
    }

    fn power_up(&self, transport: &SharedTransport) -> Result<WatchdogLease, SessionError> {
        watchdog::exchange(transport, &BoardCommand::AllSwitchesOff)?;
        watchdog::exchange(transport, &BoardCommand::SetPower(true))?;
        let watchdog = &self.config.watchdog;
        let lease = WatchdogLease::acquire(
            Arc::clone(transport),
            Duration::from_millis(watchdog.refresh_interval_ms),
            Duration::from_millis(u64::from(watchdog.board_timeout_ms)),
        );
        if let Err(e) = &lease {
            log::error!("Watchdog lease not acquired ({}); powering the board down", e);
            if let Err(power_off) = watchdog::exchange(transport, &BoardCommand::SetPower(false)) {
                log::error!("Failed to power the board down: {}", power_off);
            }
        }
        lease
    }

    /// Switch everything off, release the watchdog and close the link.
    ///
    /// Every teardown step runs even if an earlier one fails; the first
    /// failure is returned.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        let Some(mut link) = self.link.take() else {
            self.state = SessionState::Disconnected;
            return Ok(());
        };
        log::debug!("Disconnecting from {}", link.connection.port);

        let mut first_error = None;
        let mut note = |result: Result<(), SessionError>| {
            if let Err(e) = result {
                log::warn!("Teardown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        };
        note(watchdog::exchange(&link.transport, &BoardCommand::AllSwitchesOff).map(drop));
        note(watchdog::exchange(&link.transport, &BoardCommand::SetPower(false)).map(drop));
        if let Some(lease) = link.lease.take() {
            note(lease.release());
        }
        watchdog::lock(&link.transport).close();
        self.state = SessionState::Disconnected;

        first_error.map_or(Ok(()), Err)
    }

    /// Turning realtime mode off always tears the connection down.
    pub fn set_realtime_mode(&mut self, enabled: bool) -> Result<(), SessionError> {
        let was_enabled = std::mem::replace(&mut self.realtime_mode, enabled);
        if was_enabled && !enabled {
            log::info!("Realtime mode disabled; releasing the control board");
        }
        if !enabled && self.link.is_some() {
            return self.disconnect();
        }
        Ok(())
    }

    /// Send one command. A closed link tears the connection down.
    pub fn request(&mut self, command: &BoardCommand) -> Result<BoardResponse, SessionError> {
        let link = self.link.as_ref().ok_or(SessionError::NotConnected)?;
        let result = watchdog::exchange(&link.transport, command);
        if let Err(SessionError::Transport(TransportError::Disconnected)) = &result {
            log::error!("Link to {} lost during {}", link.connection.port, command.name());
            if let Some(mut link) = self.link.take() {
                drop(link.lease.take());
            }
            self.state = SessionState::Disconnected;
        }
        result
    }

    pub fn refresh_watchdog(&mut self) -> Result<(), SessionError> {
        let link = self.link.as_ref().ok_or(SessionError::NotConnected)?;
        match &link.lease {
            Some(lease) => lease.renew(),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Command every switch off. Used on every fatal path.
    pub fn safe_off(&mut self) -> Result<(), SessionError> {
        log::debug!("Commanding all switches off");
        self.request(&BoardCommand::AllSwitchesOff).map(drop)
    }

    /// Run one measurement on the board and drain its buffer.
    ///
    /// Polls at a fraction of the sampling period until the board reports
    /// completion, the buffer is full, or the measurement overruns its
    /// duration by the transport timeout. `should_stop` is consulted between
    /// polls when the transport supports partial reads.
    pub fn acquire_samples(
        &mut self,
        request: &SamplingRequest,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<Acquisition, SessionError> {
        self.refresh_watchdog()?;
        self.request(&BoardCommand::StartMeasurement {
            sampling_window_ms: request.sampling_window_ms,
            n_windows: request.n_windows,
            delay_between_windows_ms: request.delay_between_windows_ms,
            flags: request.flags,
        })?;

        let partial_reads = self.supports_partial_reads();
        let poll_interval = (request.period() / 2).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        let deadline = Instant::now() + request.duration() + self.config.serial.timeout();
        let mut buffer = SampleBuffer::with_capacity(usize::from(request.n_windows));

        loop {
            if partial_reads && should_stop() {
                log::info!("Measurement interrupted after {} samples", buffer.len());
                self.request(&BoardCommand::StopMeasurement)?;
                return Ok(Acquisition {
                    buffer,
                    interrupted: true,
                });
            }

            let chunk = match self.request(&BoardCommand::ReadBuffer)? {
                BoardResponse::Samples(chunk) => chunk,
                _ => return Err(SessionError::UnexpectedResponse { command: "ReadBuffer" }),
            };
            let SampleChunk { samples, complete } = chunk;
            let refused = buffer.extend(samples);
            if refused > 0 {
                log::warn!("Board sent {} samples beyond the requested count", refused);
            }

            if complete || buffer.is_full() {
                return Ok(Acquisition {
                    buffer,
                    interrupted: false,
                });
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "Measurement overran {:?}; stopping with {} of {} samples",
                    request.duration(),
                    buffer.len(),
                    request.n_windows
                );
                self.request(&BoardCommand::StopMeasurement)?;
                return Ok(Acquisition {
                    buffer,
                    interrupted: false,
                });
            }
            thread::sleep(poll_interval);
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.link.is_some() {
            if let Err(e) = self.disconnect() {
                log::warn!("Disconnect on drop failed: {}", e);
            }
        }
    }
}
