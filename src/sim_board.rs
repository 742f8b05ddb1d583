//! In-memory control board used by the tests.
//!
//! Answers every command the way the firmware does and synthesises feedback
//! samples from a simple electrical model: the amplifier output is sensed
//! through `true_gain`, and the load is either the device capacitance, the
//! stray capacitance (all switches off) or a reference resistor.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::board_protocol::{
    BoardCommand, BoardResponse, RawSample, SampleChunk, StoredCalibration, TestLoad,
};
use crate::calibration::CalibrationProfile;
use crate::device_session::TransportOpener;
use crate::measurement::{adc_to_volts, volts_to_adc};
use crate::transport::{Frame, Transport, TransportError};
use crate::watchdog::SharedTransport;

/// Largest feedback voltage the sim lets the autoranging settle on (V).
const FEEDBACK_HEADROOM: f64 = 2.2;

const STATUS_BUSY: u8 = 3;

pub(crate) struct SimState {
    pub device_name: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub aref: f32,
    pub bus_devices: Vec<u8>,
    pub channel_count: u16,
    pub vgnd_high_adc: u16,
    pub vgnd_low_adc: u16,

    pub silent: bool,
    pub unplugged: bool,
    pub supports_partial_reads: bool,
    pub opens: usize,
    pub commands: Vec<BoardCommand>,

    pub powered: bool,
    pub watchdog_enabled: bool,
    pub watchdog_timeout_ms: u16,
    pub watchdog_refreshes: u64,
    pub switches: Vec<bool>,
    pub all_off_count: usize,
    pub voltage: f64,
    pub frequency: f64,
    pub test_load: TestLoad,
    pub stored_calibration: StoredCalibration,

    pub true_gain: f64,
    /// Ratio of delivered to requested actuation voltage.
    pub actuation_scale: f64,
    pub stray_capacitance: f64,
    /// Device capacitance per measurement with switches on; the last entry repeats.
    pub device_capacitance: VecDeque<f64>,
    pub reference_resistance: f64,
    pub feedback_resistors: Vec<f64>,
    /// Every feedback channel reads as saturated.
    pub saturated: bool,
    /// Sample of the next switched-on measurement that reads as a short circuit.
    pub short_circuit_sample: Option<usize>,

    pub chunk_size: usize,
    pending: VecDeque<RawSample>,
    pub measurements_started: usize,
    /// Measurements taken with every switch off and no test load.
    pub stray_measurements: usize,
    /// Runs on every buffer read, before the chunk is assembled.
    pub on_read_buffer: Option<Box<dyn FnMut() + Send>>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            device_name: "Arduino DMF Controller".to_string(),
            firmware_version: "2.1.0".to_string(),
            serial_number: "DMF-0042".to_string(),
            aref: 5.0,
            bus_devices: vec![0x2c, 0x50],
            channel_count: 120,
            vgnd_high_adc: 512,
            vgnd_low_adc: 512,
            silent: false,
            unplugged: false,
            supports_partial_reads: true,
            opens: 0,
            commands: Vec::new(),
            powered: false,
            watchdog_enabled: false,
            watchdog_timeout_ms: 0,
            watchdog_refreshes: 0,
            switches: Vec::new(),
            all_off_count: 0,
            voltage: 0.0,
            frequency: 1e3,
            test_load: TestLoad::Disconnected,
            stored_calibration: StoredCalibration {
                amplifier_gain: 100.0,
                vgnd_high: 2.5,
                vgnd_low: 2.5,
                capacitance_baseline: 0.0,
            },
            true_gain: 100.0,
            actuation_scale: 1.0,
            stray_capacitance: 0.0,
            device_capacitance: VecDeque::from(vec![0.0]),
            reference_resistance: 25e3,
            feedback_resistors: CalibrationProfile::default().feedback_resistors,
            saturated: false,
            short_circuit_sample: None,
            chunk_size: 50,
            pending: VecDeque::new(),
            measurements_started: 0,
            stray_measurements: 0,
            on_read_buffer: None,
        }
    }
}

enum Load {
    Resistive(f64),
    Capacitive(f64),
}

impl SimState {
    fn aref(&self) -> f64 {
        f64::from(self.aref)
    }

    fn load(&mut self) -> Load {
        match self.test_load {
            TestLoad::Reference => Load::Resistive(self.reference_resistance),
            TestLoad::Device => Load::Capacitive(self.next_device_capacitance()),
            TestLoad::Disconnected if self.switches.iter().any(|on| *on) => {
                Load::Capacitive(self.stray_capacitance + self.next_device_capacitance())
            }
            TestLoad::Disconnected => {
                self.stray_measurements += 1;
                Load::Capacitive(self.stray_capacitance)
            }
        }
    }

    fn next_device_capacitance(&mut self) -> f64 {
        if self.device_capacitance.len() > 1 {
            self.device_capacitance.pop_front().unwrap_or_default()
        } else {
            self.device_capacitance.front().copied().unwrap_or_default()
        }
    }

    fn sample(&self, load: &Load) -> RawSample {
        let aref = self.aref();
        let actuation = self.voltage * self.actuation_scale;
        let current = match *load {
            Load::Resistive(resistance) => actuation / resistance,
            Load::Capacitive(capacitance) => 2.0 * PI * self.frequency * capacitance * actuation,
        };
        let hv_volts = adc_to_volts(self.vgnd_high_adc, aref) + actuation / self.true_gain;
        let fb = self
            .feedback_resistors
            .iter()
            .rposition(|r| !self.saturated && current * r <= FEEDBACK_HEADROOM);
        let (fb_adc, fb_resistor) = match fb {
            Some(index) => (
                volts_to_adc(adc_to_volts(self.vgnd_low_adc, aref) + current * self.feedback_resistors[index], aref),
                index as i8,
            ),
            None => (1023, -1),
        };
        RawSample {
            hv_adc: volts_to_adc(hv_volts, aref),
            fb_adc,
            hv_resistor: 0,
            fb_resistor,
        }
    }

    fn handle(&mut self, command: &BoardCommand) -> Result<BoardResponse, u8> {
        let response = match command {
            BoardCommand::GetDeviceName => BoardResponse::DeviceName(self.device_name.clone()),
            BoardCommand::GetFirmwareVersion => BoardResponse::FirmwareVersion(self.firmware_version.clone()),
            BoardCommand::GetSerialNumber => BoardResponse::SerialNumber(self.serial_number.clone()),
            BoardCommand::GetAref => BoardResponse::Aref(self.aref),
            BoardCommand::BusScan => BoardResponse::BusDevices(self.bus_devices.clone()),
            BoardCommand::GetChannelCount => BoardResponse::ChannelCount(self.channel_count),
            BoardCommand::MeasureVgnd => BoardResponse::Vgnd {
                high_adc: self.vgnd_high_adc,
                low_adc: self.vgnd_low_adc,
            },
            BoardCommand::SetPower(on) => {
                self.powered = *on;
                BoardResponse::Ack
            }
            BoardCommand::SetWatchdog { enabled, timeout_ms } => {
                self.watchdog_enabled = *enabled;
                self.watchdog_timeout_ms = *timeout_ms;
                BoardResponse::Ack
            }
            BoardCommand::RefreshWatchdog => {
                self.watchdog_refreshes += 1;
                BoardResponse::Ack
            }
            BoardCommand::SetWaveformVoltage(volts) => {
                self.voltage = f64::from(*volts);
                BoardResponse::Ack
            }
            BoardCommand::SetWaveformFrequency(hz) => {
                self.frequency = f64::from(*hz);
                BoardResponse::Ack
            }
            BoardCommand::SetSwitchStates(states) => {
                self.switches = states.clone();
                BoardResponse::Ack
            }
            BoardCommand::AllSwitchesOff => {
                self.switches.iter_mut().for_each(|on| *on = false);
                self.all_off_count += 1;
                BoardResponse::Ack
            }
            BoardCommand::StartMeasurement { n_windows, .. } => {
                if !self.pending.is_empty() {
                    return Err(STATUS_BUSY);
                }
                self.measurements_started += 1;
                let load = self.load();
                let sample = self.sample(&load);
                self.pending = VecDeque::from(vec![sample; usize::from(*n_windows)]);
                if self.switches.iter().any(|on| *on) {
                    if let Some(index) = self.short_circuit_sample.take() {
                        if let Some(sample) = self.pending.get_mut(index) {
                            sample.fb_adc = 1023;
                            sample.fb_resistor = 0;
                        }
                    }
                }
                BoardResponse::Ack
            }
            BoardCommand::ReadBuffer => {
                if let Some(hook) = self.on_read_buffer.as_mut() {
                    hook();
                }
                let take = self.chunk_size.min(self.pending.len());
                let samples: Vec<RawSample> = self.pending.drain(..take).collect();
                BoardResponse::Samples(SampleChunk {
                    samples,
                    complete: self.pending.is_empty(),
                })
            }
            BoardCommand::StopMeasurement => {
                self.pending.clear();
                BoardResponse::Ack
            }
            BoardCommand::ApplyTestLoad { load, .. } => {
                self.test_load = *load;
                BoardResponse::Ack
            }
            BoardCommand::ReadStoredCalibration => BoardResponse::StoredCalibration(self.stored_calibration),
            BoardCommand::WriteStoredCalibration(calibration) => {
                self.stored_calibration = *calibration;
                BoardResponse::Ack
            }
        };
        Ok(response)
    }
}

struct SimTransport {
    state: Arc<Mutex<SimState>>,
    open: bool,
}

impl Transport for SimTransport {
    fn send(&mut self, request: &Frame) -> Result<Frame, TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.open || state.unplugged {
            return Err(TransportError::Disconnected);
        }
        if state.silent {
            return Err(TransportError::Timeout {
                timeout: Duration::from_millis(1),
            });
        }
        let command = BoardCommand::from_frame(request).map_err(|e| TransportError::Framing {
            reason: e.to_string(),
        })?;
        state.commands.push(command.clone());
        Ok(match state.handle(&command) {
            Ok(response) => response.to_frame(request.id),
            Err(status) => BoardResponse::rejection(request.id, status),
        })
    }

    fn supports_partial_reads(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .supports_partial_reads
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[derive(Clone, Default)]
pub(crate) struct SimBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shared_transport(&self) -> SharedTransport {
        Arc::new(Mutex::new(Box::new(SimTransport {
            state: Arc::clone(&self.state),
            open: true,
        })))
    }

    /// Opener for [`DeviceSession`](crate::device_session::DeviceSession);
    /// ports named `/dev/missing*` do not exist.
    pub fn opener(&self) -> TransportOpener {
        let state = Arc::clone(&self.state);
        Box::new(move |port, _baud_rate, _timeout| {
            if port.starts_with("/dev/missing") {
                return Err(TransportError::SerialPort(serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    format!("{port} does not exist"),
                )));
            }
            state.lock().unwrap_or_else(PoisonError::into_inner).opens += 1;
            Ok(Box::new(SimTransport {
                state: Arc::clone(&state),
                open: true,
            }) as Box<dyn Transport>)
        })
    }

    /// Profile describing this board exactly.
    pub fn matching_profile(&self) -> CalibrationProfile {
        let state = self.state();
        let aref = state.aref();
        CalibrationProfile {
            amplifier_gain: state.true_gain,
            vgnd_high: adc_to_volts(state.vgnd_high_adc, aref),
            vgnd_low: adc_to_volts(state.vgnd_low_adc, aref),
            feedback_resistors: state.feedback_resistors.clone(),
            ..CalibrationProfile::default()
        }
    }
}
