use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

use crate::board_protocol::{BoardCommand, BoardResponse, SamplingFlags, StoredCalibration, TestLoad};
use crate::device_session::{DeviceSession, SamplingRequest, SessionError};
use crate::measurement::{adc_to_volts, mean, SampleConverter};
use crate::safety::{
    check_current, check_waveform, predicted_current, SafetyError, CALIBRATION_CURRENT_LIMIT,
    OPERATING_CURRENT_LIMIT,
};

/// Plausible amplifier gain for the high-voltage stage.
pub const GAIN_RANGE: (f64, f64) = (10.0, 1000.0);

/// Plausible capacitance per unit area of a device (F/mm²).
pub const CAPACITANCE_BASELINE_RANGE: (f64, f64) = (0.0, 1e-9);

/// Sampling windows taken while a calibration load is connected.
const CALIBRATION_WINDOWS: u16 = 20;

/// Largest relative spread of the per-sample estimates accepted as stable.
const MAX_RELATIVE_SPREAD: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("Calibrated {quantity} = {value:e} is outside the plausible range {min:e}..={max:e}")]
    OutOfRange {
        quantity: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Calibration signal too unstable: {quantity} spread {spread:.1}%")]
    UnstableSignal { quantity: &'static str, spread: f64 },

    #[error("Calibration measurement produced no usable samples")]
    NoUsableSamples,

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Safety error: {0}")]
    Safety(#[from] SafetyError),
}

fn out_of_range(quantity: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), CalibrationError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CalibrationError::OutOfRange {
            quantity,
            value,
            min,
            max,
        })
    }
}

/// Everything needed to turn raw ADC codes into physical units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationProfile {
    pub amplifier_gain: f64,
    /// Virtual ground of the high-voltage sense channel (V).
    pub vgnd_high: f64,
    /// Virtual ground of the feedback channel (V).
    pub vgnd_low: f64,
    /// Capacitance per unit area of the bare device (F/mm²).
    pub capacitance_baseline: f64,
    /// Accepted deviation of the measured actuation voltage (V).
    pub voltage_tolerance: f64,
    /// Operating current limit (A). Never above 10 mA.
    pub current_limit: f64,
    /// Feedback resistors (Ω) indexed by the board's resistor index.
    pub feedback_resistors: Vec<f64>,
    /// When the profile was last calibrated; `None` for factory defaults.
    pub timestamp: Option<SystemTime>,
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self {
            amplifier_gain: 100.0,
            vgnd_high: 2.5,
            vgnd_low: 2.5,
            capacitance_baseline: 0.0,
            voltage_tolerance: 5.0,
            current_limit: OPERATING_CURRENT_LIMIT,
            feedback_resistors: vec![10.0, 1.0e3, 1.0e4, 1.0e5, 1.0e6],
            timestamp: None,
        }
    }
}

impl CalibrationProfile {
    /// Checks that do not depend on the connected board.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        out_of_range("amplifier gain", self.amplifier_gain, GAIN_RANGE)?;
        out_of_range(
            "capacitance baseline",
            self.capacitance_baseline,
            CAPACITANCE_BASELINE_RANGE,
        )?;
        out_of_range("current limit", self.current_limit, (f64::MIN_POSITIVE, OPERATING_CURRENT_LIMIT))?;
        out_of_range("voltage tolerance", self.voltage_tolerance, (0.0, f64::MAX))?;
        if self.feedback_resistors.is_empty() {
            return Err(CalibrationError::OutOfRange {
                quantity: "feedback resistor count",
                value: 0.0,
                min: 1.0,
                max: f64::from(i8::MAX),
            });
        }
        for &resistance in &self.feedback_resistors {
            out_of_range("feedback resistance", resistance, (f64::MIN_POSITIVE, f64::MAX))?;
        }
        Ok(())
    }

    /// Both virtual grounds must sit within `band_fraction` of `aref / 2`.
    pub fn validate_vgnd(&self, aref: f64, band_fraction: f64) -> Result<(), CalibrationError> {
        let nominal = aref / 2.0;
        let band = (nominal * (1.0 - band_fraction), nominal * (1.0 + band_fraction));
        out_of_range("VGND high", self.vgnd_high, band)?;
        out_of_range("VGND low", self.vgnd_low, band)
    }

    fn stored(&self) -> StoredCalibration {
        StoredCalibration {
            amplifier_gain: self.amplifier_gain as f32,
            vgnd_high: self.vgnd_high as f32,
            vgnd_low: self.vgnd_low as f32,
            capacitance_baseline: self.capacitance_baseline as f32,
        }
    }
}

/// Which known load the wizard measures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationKind {
    /// Drive a reference resistor (Ω) to recover amplifier gain and VGND.
    ReferenceLoad {
        test_voltage: f64,
        frequency: f64,
        reference_resistance: f64,
    },
    /// Drive the bare device over `actuated_area` (mm²) to recover the capacitance baseline.
    DeviceLoad {
        voltage: f64,
        frequency: f64,
        actuated_area: f64,
    },
}

impl CalibrationKind {
    fn waveform(&self) -> (f64, f64) {
        match *self {
            Self::ReferenceLoad {
                test_voltage,
                frequency,
                ..
            } => (test_voltage, frequency),
            Self::DeviceLoad { voltage, frequency, .. } => (voltage, frequency),
        }
    }

    fn test_load(&self) -> TestLoad {
        match self {
            Self::ReferenceLoad { .. } => TestLoad::Reference,
            Self::DeviceLoad { .. } => TestLoad::Device,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    frequency: u64,
    voltage: u64,
}

impl CacheKey {
    fn new(frequency: f64, voltage: f64) -> Self {
        Self {
            frequency: frequency.to_bits(),
            voltage: voltage.to_bits(),
        }
    }
}

/// Owns the active calibration profile and the stray capacitance measured
/// for each waveform.
#[derive(Debug, Default)]
pub struct CalibrationStore {
    profile: CalibrationProfile,
    stray_capacitance: HashMap<CacheKey, f64>,
}

impl CalibrationStore {
    pub fn new(profile: CalibrationProfile) -> Result<Self, CalibrationError> {
        profile.validate()?;
        Ok(Self {
            profile,
            stray_capacitance: HashMap::new(),
        })
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    /// Snapshot of the active profile.
    pub fn save(&self) -> CalibrationProfile {
        self.profile.clone()
    }

    /// Replace the active profile. Cached stray capacitances are dropped.
    pub fn load(&mut self, profile: CalibrationProfile) -> Result<(), CalibrationError> {
        profile.validate()?;
        self.profile = profile;
        self.invalidate();
        Ok(())
    }

    pub fn invalidate(&mut self) {
        if !self.stray_capacitance.is_empty() {
            log::debug!("Dropping {} cached stray capacitances", self.stray_capacitance.len());
        }
        self.stray_capacitance.clear();
    }

    pub fn cached_stray_capacitance(&self, frequency: f64, voltage: f64) -> Option<f64> {
        self.stray_capacitance
            .get(&CacheKey::new(frequency, voltage))
            .copied()
    }

    pub fn cache_len(&self) -> usize {
        self.stray_capacitance.len()
    }

    /// Stray capacitance for a waveform, running `measure` only on a cache miss.
    pub fn stray_capacitance_or_measure<E>(
        &mut self,
        frequency: f64,
        voltage: f64,
        measure: impl FnOnce() -> Result<f64, E>,
    ) -> Result<f64, E> {
        let key = CacheKey::new(frequency, voltage);
        if let Some(&capacitance) = self.stray_capacitance.get(&key) {
            log::debug!("Stray capacitance at {} Hz, {} V cached: {:e} F", frequency, voltage, capacitance);
            return Ok(capacitance);
        }
        let capacitance = measure()?;
        log::debug!("Stray capacitance at {} Hz, {} V measured: {:e} F", frequency, voltage, capacitance);
        self.stray_capacitance.insert(key, capacitance);
        Ok(capacitance)
    }

    /// Measure a known load and update the profile from it.
    ///
    /// The board is left with its test load disconnected and all switches
    /// off whatever the outcome. On error the active profile is unchanged.
    pub fn run_calibration_wizard(
        &mut self,
        session: &mut DeviceSession,
        kind: CalibrationKind,
    ) -> Result<CalibrationProfile, CalibrationError> {
        let (voltage, frequency) = kind.waveform();
        check_waveform(voltage, frequency, &session.config().limits)?;
        let predicted = match kind {
            CalibrationKind::ReferenceLoad {
                test_voltage,
                reference_resistance,
                ..
            } => test_voltage / reference_resistance,
            CalibrationKind::DeviceLoad { actuated_area, .. } => {
                let per_area = self
                    .profile
                    .capacitance_baseline
                    .max(session.config().limits.max_capacitance_per_area);
                predicted_current(voltage, frequency, per_area * actuated_area)
            }
        };
        check_current(predicted, CALIBRATION_CURRENT_LIMIT)?;
        let aref = session
            .handshake()
            .map(|handshake| handshake.aref_volts)
            .ok_or(SessionError::NotConnected)?;

        log::info!("Starting calibration: {:?}", kind);
        let measured = self.measure_known_load(session, kind, aref);

        let released = session
            .request(&BoardCommand::ApplyTestLoad {
                load: TestLoad::Disconnected,
                max_current_ma: 0.0,
            })
            .and_then(|_| session.safe_off());
        if let Err(e) = &released {
            log::error!("Failed to release calibration load: {}", e);
        }

        let candidate = measured?;
        released?;
        candidate.validate()?;
        candidate.validate_vgnd(aref, session.config().identity.vgnd_band_fraction)?;

        log::info!(
            "Calibration complete: gain {:.2}, VGND {:.3}/{:.3} V, baseline {:e} F/mm²",
            candidate.amplifier_gain,
            candidate.vgnd_high,
            candidate.vgnd_low,
            candidate.capacitance_baseline
        );
        self.profile = candidate;
        self.invalidate();
        Ok(self.profile.clone())
    }

    fn measure_known_load(
        &self,
        session: &mut DeviceSession,
        kind: CalibrationKind,
        aref: f64,
    ) -> Result<CalibrationProfile, CalibrationError> {
        let (voltage, frequency) = kind.waveform();
        let mut candidate = self.profile.clone();

        session.safe_off()?;
        if let CalibrationKind::ReferenceLoad { .. } = kind {
            match session.request(&BoardCommand::MeasureVgnd)? {
                BoardResponse::Vgnd { high_adc, low_adc } => {
                    candidate.vgnd_high = adc_to_volts(high_adc, aref);
                    candidate.vgnd_low = adc_to_volts(low_adc, aref);
                }
                _ => return Err(SessionError::UnexpectedResponse { command: "MeasureVgnd" }.into()),
            }
        }
        session.request(&BoardCommand::SetWaveformFrequency(frequency as f32))?;
        session.request(&BoardCommand::SetWaveformVoltage(voltage as f32))?;
        session.request(&BoardCommand::ApplyTestLoad {
            load: kind.test_load(),
            max_current_ma: (CALIBRATION_CURRENT_LIMIT * 1e3) as f32,
        })?;

        let feedback = &session.config().feedback;
        let request = SamplingRequest {
            sampling_window_ms: feedback.sampling_window_ms,
            n_windows: CALIBRATION_WINDOWS,
            delay_between_windows_ms: feedback.min_delay_between_windows_ms,
            flags: SamplingFlags {
                rms: feedback.use_rms,
                anti_aliasing_filter: feedback.use_anti_aliasing_filter,
            },
        };
        let acquisition = session.acquire_samples(&request, &|| false)?;

        match kind {
            CalibrationKind::ReferenceLoad {
                reference_resistance,
                ..
            } => {
                // Unit gain so that actuation voltage reads as the sensed voltage.
                let sensing = CalibrationProfile {
                    amplifier_gain: 1.0,
                    ..candidate.clone()
                };
                let converter = SampleConverter {
                    profile: &sensing,
                    aref,
                    frequency,
                    period_ms: request.period().as_secs_f64() * 1e3,
                };
                let mut gains = Vec::new();
                for sample in converter.convert_all(&acquisition.buffer) {
                    check_current(sample.current, CALIBRATION_CURRENT_LIMIT)?;
                    if sample.actuation_voltage > 0.0 {
                        gains.push(sample.current * reference_resistance / sample.actuation_voltage);
                    }
                }
                candidate.amplifier_gain = stable_mean("amplifier gain", &gains)?;
            }
            CalibrationKind::DeviceLoad { actuated_area, .. } => {
                let converter = SampleConverter {
                    profile: &candidate,
                    aref,
                    frequency,
                    period_ms: request.period().as_secs_f64() * 1e3,
                };
                let mut capacitances = Vec::new();
                for sample in converter.convert_all(&acquisition.buffer) {
                    check_current(sample.current, CALIBRATION_CURRENT_LIMIT)?;
                    capacitances.push(sample.capacitance / actuated_area);
                }
                candidate.capacitance_baseline = stable_mean("capacitance baseline", &capacitances)?;
            }
        }
        candidate.timestamp = Some(SystemTime::now());
        Ok(candidate)
    }

    /// Replace gain, VGND and baseline with the values stored on the board.
    pub fn reload_from_device(&mut self, session: &mut DeviceSession) -> Result<CalibrationProfile, CalibrationError> {
        let aref = session
            .handshake()
            .map(|handshake| handshake.aref_volts)
            .ok_or(SessionError::NotConnected)?;
        let stored = match session.request(&BoardCommand::ReadStoredCalibration)? {
            BoardResponse::StoredCalibration(stored) => stored,
            _ => {
                return Err(SessionError::UnexpectedResponse {
                    command: "ReadStoredCalibration",
                }
                .into())
            }
        };
        let candidate = CalibrationProfile {
            amplifier_gain: f64::from(stored.amplifier_gain),
            vgnd_high: f64::from(stored.vgnd_high),
            vgnd_low: f64::from(stored.vgnd_low),
            capacitance_baseline: f64::from(stored.capacitance_baseline),
            timestamp: Some(SystemTime::now()),
            ..self.profile.clone()
        };
        candidate.validate()?;
        candidate.validate_vgnd(aref, session.config().identity.vgnd_band_fraction)?;
        log::debug!("Calibration reloaded from board: {:?}", stored);
        self.profile = candidate;
        self.invalidate();
        Ok(self.profile.clone())
    }

    /// Store the active gain, VGND and baseline on the board.
    pub fn write_to_device(&self, session: &mut DeviceSession) -> Result<(), CalibrationError> {
        session.request(&BoardCommand::WriteStoredCalibration(self.profile.stored()))?;
        log::debug!("Calibration written to board");
        Ok(())
    }
}

fn stable_mean(quantity: &'static str, values: &[f64]) -> Result<f64, CalibrationError> {
    let average = mean(values).ok_or(CalibrationError::NoUsableSamples)?;
    let min_val = values.iter().fold(f64::INFINITY, |a, &b| a.min(b));
    let max_val = values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
    if average.abs() > 0.0 && (max_val - min_val) / average.abs() > MAX_RELATIVE_SPREAD {
        return Err(CalibrationError::UnstableSignal {
            quantity,
            spread: (max_val - min_val) / average.abs() * 100.0,
        });
    }
    Ok(average)
}
