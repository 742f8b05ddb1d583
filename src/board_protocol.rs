//! Command vocabulary understood by the control-board firmware.
//!
//! Every request is a [`Frame`] whose id selects the command. Responses echo
//! the id and start with a status byte (`0` = accepted) followed by the
//! command-specific data. Multi-byte values are little endian.

use crate::transport::{Frame, MAX_PAYLOAD_LENGTH};

/// Bytes per sample in a buffer read: hv ADC (u16), fb ADC (u16), hv resistor (i8), fb resistor (i8).
pub const SAMPLE_SIZE: usize = 6;

/// Bytes ahead of the samples in a buffer read: count (u16), flags (u8), reserved (u8).
pub const SAMPLE_CHUNK_HEADER: usize = 4;

/// Maximum number of samples the board can hold for one measurement.
pub const SAMPLE_BUFFER_CAPACITY: usize = (MAX_PAYLOAD_LENGTH - SAMPLE_CHUNK_HEADER) / SAMPLE_SIZE;

const STATUS_OK: u8 = 0;

#[derive(Debug, thiserror::Error)]
pub enum BoardProtocolError {
    #[error("Board rejected {command} with status {status}")]
    Rejected { command: &'static str, status: u8 },

    #[error("Malformed {command} payload: {reason}")]
    Malformed { command: &'static str, reason: String },

    #[error("Unknown command id 0x{0:02x}")]
    UnknownCommand(u8),
}

fn malformed(command: &'static str, reason: impl Into<String>) -> BoardProtocolError {
    BoardProtocolError::Malformed {
        command,
        reason: reason.into(),
    }
}

/// Test load the board can switch onto its output during calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestLoad {
    Disconnected,
    Reference,
    Device,
}

impl TestLoad {
    fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Reference => 1,
            Self::Device => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Reference),
            2 => Some(Self::Device),
            _ => None,
        }
    }
}

/// Options forwarded to the board's sampling routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplingFlags {
    pub rms: bool,
    pub anti_aliasing_filter: bool,
}

impl SamplingFlags {
    fn bits(self) -> u8 {
        u8::from(self.rms) | (u8::from(self.anti_aliasing_filter) << 1)
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            rms: bits & 0x01 != 0,
            anti_aliasing_filter: bits & 0x02 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoardCommand {
    GetDeviceName,
    GetFirmwareVersion,
    GetSerialNumber,
    GetAref,
    BusScan,
    GetChannelCount,
    MeasureVgnd,
    SetPower(bool),
    SetWatchdog { enabled: bool, timeout_ms: u16 },
    RefreshWatchdog,
    SetWaveformVoltage(f32),
    SetWaveformFrequency(f32),
    SetSwitchStates(Vec<bool>),
    AllSwitchesOff,
    StartMeasurement {
        sampling_window_ms: u16,
        n_windows: u16,
        delay_between_windows_ms: u16,
        flags: SamplingFlags,
    },
    ReadBuffer,
    StopMeasurement,
    ApplyTestLoad { load: TestLoad, max_current_ma: f32 },
    ReadStoredCalibration,
    WriteStoredCalibration(StoredCalibration),
}

/// Calibration values kept in the board's EEPROM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredCalibration {
    pub amplifier_gain: f32,
    pub vgnd_high: f32,
    pub vgnd_low: f32,
    pub capacitance_baseline: f32,
}

impl StoredCalibration {
    fn encode(&self, out: &mut Vec<u8>) {
        for value in [
            self.amplifier_gain,
            self.vgnd_high,
            self.vgnd_low,
            self.capacitance_baseline,
        ] {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    fn decode(command: &'static str, data: &[u8]) -> Result<Self, BoardProtocolError> {
        let mut reader = PayloadReader::new(command, data);
        Ok(Self {
            amplifier_gain: reader.f32()?,
            vgnd_high: reader.f32()?,
            vgnd_low: reader.f32()?,
            capacitance_baseline: reader.f32()?,
        })
    }
}

/// One raw feedback sample as reported by the board.
///
/// A resistor index of `-1` means the corresponding channel saturated and
/// the sample carries no usable reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub hv_adc: u16,
    pub fb_adc: u16,
    pub hv_resistor: i8,
    pub fb_resistor: i8,
}

impl RawSample {
    pub fn is_valid(&self) -> bool {
        self.hv_resistor >= 0 && self.fb_resistor >= 0
    }
}

/// Samples drained from the board's buffer by one `ReadBuffer` poll.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SampleChunk {
    pub samples: Vec<RawSample>,
    /// Set once the board has finished the requested number of windows.
    pub complete: bool,
}

impl SampleChunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SAMPLE_CHUNK_HEADER + self.samples.len() * SAMPLE_SIZE);
        out.extend_from_slice(&(self.samples.len() as u16).to_le_bytes());
        out.push(u8::from(self.complete));
        out.push(0);
        for sample in &self.samples {
            out.extend_from_slice(&sample.hv_adc.to_le_bytes());
            out.extend_from_slice(&sample.fb_adc.to_le_bytes());
            out.push(sample.hv_resistor as u8);
            out.push(sample.fb_resistor as u8);
        }
        out
    }

    fn decode(data: &[u8]) -> Result<Self, BoardProtocolError> {
        const NAME: &str = "ReadBuffer";
        let mut reader = PayloadReader::new(NAME, data);
        let count = reader.u16()? as usize;
        let complete = reader.u8()? != 0;
        reader.u8()?;
        if count > SAMPLE_BUFFER_CAPACITY {
            return Err(malformed(NAME, format!("{count} samples exceed buffer capacity")));
        }
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            samples.push(RawSample {
                hv_adc: reader.u16()?,
                fb_adc: reader.u16()?,
                hv_resistor: reader.u8()? as i8,
                fb_resistor: reader.u8()? as i8,
            });
        }
        Ok(Self { samples, complete })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoardResponse {
    Ack,
    DeviceName(String),
    FirmwareVersion(String),
    SerialNumber(String),
    Aref(f32),
    BusDevices(Vec<u8>),
    ChannelCount(u16),
    Vgnd { high_adc: u16, low_adc: u16 },
    Samples(SampleChunk),
    StoredCalibration(StoredCalibration),
}

struct PayloadReader<'a> {
    command: &'static str,
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(command: &'static str, data: &'a [u8]) -> Self {
        Self { command, data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], BoardProtocolError> {
        if self.data.len() < n {
            return Err(malformed(
                self.command,
                format!("expected {} more bytes, got {}", n, self.data.len()),
            ));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, BoardProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BoardProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn f32(&mut self) -> Result<f32, BoardProtocolError> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}

fn pack_bits(states: &[bool]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + states.len().div_ceil(8));
    out.extend_from_slice(&(states.len() as u16).to_le_bytes());
    for byte in states.chunks(8) {
        out.push(
            byte.iter()
                .enumerate()
                .fold(0u8, |acc, (bit, &on)| acc | (u8::from(on) << bit)),
        );
    }
    out
}

fn unpack_bits(command: &'static str, data: &[u8]) -> Result<Vec<bool>, BoardProtocolError> {
    let mut reader = PayloadReader::new(command, data);
    let count = reader.u16()? as usize;
    let packed = reader.take(count.div_ceil(8))?;
    Ok((0..count).map(|i| (packed[i / 8] >> (i % 8)) & 1 == 1).collect())
}

impl BoardCommand {
    pub fn id(&self) -> u8 {
        match self {
            Self::GetDeviceName => 0x00,
            Self::GetFirmwareVersion => 0x01,
            Self::GetSerialNumber => 0x02,
            Self::GetAref => 0x03,
            Self::BusScan => 0x04,
            Self::GetChannelCount => 0x05,
            Self::MeasureVgnd => 0x06,
            Self::SetPower(_) => 0x10,
            Self::SetWatchdog { .. } => 0x11,
            Self::RefreshWatchdog => 0x12,
            Self::SetWaveformVoltage(_) => 0x20,
            Self::SetWaveformFrequency(_) => 0x21,
            Self::SetSwitchStates(_) => 0x22,
            Self::AllSwitchesOff => 0x23,
            Self::StartMeasurement { .. } => 0x30,
            Self::ReadBuffer => 0x31,
            Self::StopMeasurement => 0x32,
            Self::ApplyTestLoad { .. } => 0x40,
            Self::ReadStoredCalibration => 0x41,
            Self::WriteStoredCalibration(_) => 0x42,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::GetDeviceName => "GetDeviceName",
            Self::GetFirmwareVersion => "GetFirmwareVersion",
            Self::GetSerialNumber => "GetSerialNumber",
            Self::GetAref => "GetAref",
            Self::BusScan => "BusScan",
            Self::GetChannelCount => "GetChannelCount",
            Self::MeasureVgnd => "MeasureVgnd",
            Self::SetPower(_) => "SetPower",
            Self::SetWatchdog { .. } => "SetWatchdog",
            Self::RefreshWatchdog => "RefreshWatchdog",
            Self::SetWaveformVoltage(_) => "SetWaveformVoltage",
            Self::SetWaveformFrequency(_) => "SetWaveformFrequency",
            Self::SetSwitchStates(_) => "SetSwitchStates",
            Self::AllSwitchesOff => "AllSwitchesOff",
            Self::StartMeasurement { .. } => "StartMeasurement",
            Self::ReadBuffer => "ReadBuffer",
            Self::StopMeasurement => "StopMeasurement",
            Self::ApplyTestLoad { .. } => "ApplyTestLoad",
            Self::ReadStoredCalibration => "ReadStoredCalibration",
            Self::WriteStoredCalibration(_) => "WriteStoredCalibration",
        }
    }

    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::new();
        match self {
            Self::SetPower(on) => payload.push(u8::from(*on)),
            Self::SetWatchdog {
                enabled,
                timeout_ms,
            } => {
                payload.push(u8::from(*enabled));
                payload.extend_from_slice(&timeout_ms.to_le_bytes());
            }
            Self::SetWaveformVoltage(v) | Self::SetWaveformFrequency(v) => {
                payload.extend_from_slice(&v.to_le_bytes());
            }
            Self::SetSwitchStates(states) => payload = pack_bits(states),
            Self::StartMeasurement {
                sampling_window_ms,
                n_windows,
                delay_between_windows_ms,
                flags,
            } => {
                payload.extend_from_slice(&sampling_window_ms.to_le_bytes());
                payload.extend_from_slice(&n_windows.to_le_bytes());
                payload.extend_from_slice(&delay_between_windows_ms.to_le_bytes());
                payload.push(flags.bits());
            }
            Self::ApplyTestLoad {
                load,
                max_current_ma,
            } => {
                payload.push(load.code());
                payload.extend_from_slice(&max_current_ma.to_le_bytes());
            }
            Self::WriteStoredCalibration(calibration) => calibration.encode(&mut payload),
            Self::GetDeviceName
            | Self::GetFirmwareVersion
            | Self::GetSerialNumber
            | Self::GetAref
            | Self::BusScan
            | Self::GetChannelCount
            | Self::MeasureVgnd
            | Self::RefreshWatchdog
            | Self::AllSwitchesOff
            | Self::ReadBuffer
            | Self::StopMeasurement
            | Self::ReadStoredCalibration => {}
        }
        Frame::new(self.id(), payload)
    }

    /// Board-side parse of a request frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, BoardProtocolError> {
        let data = frame.payload.as_slice();
        let command = match frame.id {
            0x00 => Self::GetDeviceName,
            0x01 => Self::GetFirmwareVersion,
            0x02 => Self::GetSerialNumber,
            0x03 => Self::GetAref,
            0x04 => Self::BusScan,
            0x05 => Self::GetChannelCount,
            0x06 => Self::MeasureVgnd,
            0x10 => Self::SetPower(PayloadReader::new("SetPower", data).u8()? != 0),
            0x11 => {
                let mut reader = PayloadReader::new("SetWatchdog", data);
                Self::SetWatchdog {
                    enabled: reader.u8()? != 0,
                    timeout_ms: reader.u16()?,
                }
            }
            0x12 => Self::RefreshWatchdog,
            0x20 => Self::SetWaveformVoltage(PayloadReader::new("SetWaveformVoltage", data).f32()?),
            0x21 => Self::SetWaveformFrequency(PayloadReader::new("SetWaveformFrequency", data).f32()?),
            0x22 => Self::SetSwitchStates(unpack_bits("SetSwitchStates", data)?),
            0x23 => Self::AllSwitchesOff,
            0x30 => {
                let mut reader = PayloadReader::new("StartMeasurement", data);
                Self::StartMeasurement {
                    sampling_window_ms: reader.u16()?,
                    n_windows: reader.u16()?,
                    delay_between_windows_ms: reader.u16()?,
                    flags: SamplingFlags::from_bits(reader.u8()?),
                }
            }
            0x31 => Self::ReadBuffer,
            0x32 => Self::StopMeasurement,
            0x40 => {
                let mut reader = PayloadReader::new("ApplyTestLoad", data);
                let code = reader.u8()?;
                Self::ApplyTestLoad {
                    load: TestLoad::from_code(code)
                        .ok_or_else(|| malformed("ApplyTestLoad", format!("unknown load {code}")))?,
                    max_current_ma: reader.f32()?,
                }
            }
            0x41 => Self::ReadStoredCalibration,
            0x42 => Self::WriteStoredCalibration(StoredCalibration::decode("WriteStoredCalibration", data)?),
            other => return Err(BoardProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

impl BoardResponse {
    /// Decode the reply to `command`.
    pub fn from_frame(command: &BoardCommand, frame: &Frame) -> Result<Self, BoardProtocolError> {
        let name = command.name();
        let mut reader = PayloadReader::new(name, &frame.payload);
        let status = reader.u8()?;
        if status != STATUS_OK {
            return Err(BoardProtocolError::Rejected {
                command: name,
                status,
            });
        }

        let response = match command {
            BoardCommand::GetDeviceName => {
                Self::DeviceName(String::from_utf8_lossy(reader.rest()).trim().to_string())
            }
            BoardCommand::GetFirmwareVersion => Self::FirmwareVersion(
                String::from_utf8_lossy(reader.rest()).trim().to_string(),
            ),
            BoardCommand::GetSerialNumber => {
                Self::SerialNumber(String::from_utf8_lossy(reader.rest()).trim().to_string())
            }
            BoardCommand::GetAref => Self::Aref(reader.f32()?),
            BoardCommand::BusScan => Self::BusDevices(reader.rest().to_vec()),
            BoardCommand::GetChannelCount => Self::ChannelCount(reader.u16()?),
            BoardCommand::MeasureVgnd => Self::Vgnd {
                high_adc: reader.u16()?,
                low_adc: reader.u16()?,
            },
            BoardCommand::ReadBuffer => Self::Samples(SampleChunk::decode(reader.rest())?),
            BoardCommand::ReadStoredCalibration => {
                Self::StoredCalibration(StoredCalibration::decode(name, reader.rest())?)
            }
            _ => Self::Ack,
        };
        Ok(response)
    }

    /// Board-side encoding of a successful reply to the request `id`.
    pub fn to_frame(&self, id: u8) -> Frame {
        let mut payload = vec![STATUS_OK];
        match self {
            Self::Ack => {}
            Self::DeviceName(text) | Self::FirmwareVersion(text) | Self::SerialNumber(text) => {
                payload.extend_from_slice(text.as_bytes());
            }
            Self::Aref(volts) => payload.extend_from_slice(&volts.to_le_bytes()),
            Self::BusDevices(addresses) => payload.extend_from_slice(addresses),
            Self::ChannelCount(count) => payload.extend_from_slice(&count.to_le_bytes()),
            Self::Vgnd { high_adc, low_adc } => {
                payload.extend_from_slice(&high_adc.to_le_bytes());
                payload.extend_from_slice(&low_adc.to_le_bytes());
            }
            Self::Samples(chunk) => payload.extend_from_slice(&chunk.encode()),
            Self::StoredCalibration(calibration) => calibration.encode(&mut payload),
        }
        Frame::new(id, payload)
    }

    /// Board-side encoding of a rejection.
    pub fn rejection(id: u8, status: u8) -> Frame {
        Frame::new(id, vec![status])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_capacity_matches_payload_limit() {
        assert_eq!(SAMPLE_BUFFER_CAPACITY, 332);
        let full = SampleChunk {
            samples: vec![
                RawSample {
                    hv_adc: 1,
                    fb_adc: 2,
                    hv_resistor: 0,
                    fb_resistor: 0
                };
                SAMPLE_BUFFER_CAPACITY
            ],
            complete: true,
        };
        assert!(full.encode().len() <= MAX_PAYLOAD_LENGTH);
    }

    #[test]
    fn test_switch_states_pack_lsb_first() {
        let states = vec![true, false, false, true, false, false, false, false, true];
        let frame = BoardCommand::SetSwitchStates(states.clone()).to_frame();
        assert_eq!(frame.payload, vec![9, 0, 0b0000_1001, 0b0000_0001]);
        assert_eq!(
            BoardCommand::from_frame(&frame).unwrap(),
            BoardCommand::SetSwitchStates(states)
        );
    }

    #[test]
    fn test_start_measurement_flags() {
        let command = BoardCommand::StartMeasurement {
            sampling_window_ms: 10,
            n_windows: 20,
            delay_between_windows_ms: 5,
            flags: SamplingFlags {
                rms: true,
                anti_aliasing_filter: true,
            },
        };
        let frame = command.to_frame();
        assert_eq!(frame.id, 0x30);
        assert_eq!(frame.payload[6], 0b11);
        assert_eq!(BoardCommand::from_frame(&frame).unwrap(), command);
    }

    #[test]
    fn test_rejected_status_surfaces() {
        let frame = BoardResponse::rejection(0x20, 3);
        let err = BoardResponse::from_frame(&BoardCommand::SetWaveformVoltage(10.0), &frame).unwrap_err();
        assert!(matches!(
            err,
            BoardProtocolError::Rejected {
                command: "SetWaveformVoltage",
                status: 3
            }
        ));
    }

    #[test]
    fn test_saturated_sample_survives_encoding() {
        let chunk = SampleChunk {
            samples: vec![RawSample {
                hv_adc: 700,
                fb_adc: 12,
                hv_resistor: -1,
                fb_resistor: 2,
            }],
            complete: false,
        };
        let frame = BoardResponse::Samples(chunk.clone()).to_frame(0x31);
        match BoardResponse::from_frame(&BoardCommand::ReadBuffer, &frame).unwrap() {
            BoardResponse::Samples(decoded) => {
                assert_eq!(decoded, chunk);
                assert!(!decoded.samples[0].is_valid());
            }
            other => unreachable!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let frame = Frame::new(0x03, vec![STATUS_OK, 0x00, 0x00]);
        assert!(matches!(
            BoardResponse::from_frame(&BoardCommand::GetAref, &frame),
            Err(BoardProtocolError::Malformed { .. })
        ));
    }
}
