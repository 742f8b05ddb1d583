use polars::prelude::*;
use std::f64::consts::PI;

use crate::board_protocol::{RawSample, SAMPLE_BUFFER_CAPACITY};
use crate::calibration::CalibrationProfile;

/// 10-bit ADC on the board.
pub const ADC_FULL_SCALE: f64 = 1023.0;

/// Measured actuation below this (V RMS) means the amplifier is probably off.
pub const LOW_ACTUATION_VOLTAGE: f64 = 5.0;

pub const TIME_COLUMN_NAME: &str = "time_ms";
pub const VOLTAGE_COLUMN_NAME: &str = "actuation_voltage";
pub const IMPEDANCE_COLUMN_NAME: &str = "impedance";
pub const CAPACITANCE_COLUMN_NAME: &str = "capacitance";
pub const FORCE_COLUMN_NAME: &str = "force";
const AREA_NORMALIZED_SUFFIX: &str = "_per_mm2";

pub fn adc_to_volts(adc: u16, aref: f64) -> f64 {
    f64::from(adc) / ADC_FULL_SCALE * aref
}

pub fn volts_to_adc(volts: f64, aref: f64) -> u16 {
    (volts / aref * ADC_FULL_SCALE).round().clamp(0.0, ADC_FULL_SCALE) as u16
}

/// Raw samples of one measurement, bounded by the board's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    samples: Vec<RawSample>,
    capacity: usize,
}

impl SampleBuffer {
    /// Buffer for `requested` samples, never more than the board can hold.
    pub fn with_capacity(requested: usize) -> Self {
        let capacity = requested.min(SAMPLE_BUFFER_CAPACITY);
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append whole samples until full; returns how many were refused.
    pub fn extend(&mut self, samples: impl IntoIterator<Item = RawSample>) -> usize {
        let mut refused = 0;
        for sample in samples {
            if self.samples.len() < self.capacity {
                self.samples.push(sample);
            } else {
                refused += 1;
            }
        }
        refused
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.capacity
    }

    pub fn samples(&self) -> &[RawSample] {
        &self.samples
    }
}

/// A raw sample translated into physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertedSample {
    pub time_ms: f64,
    /// Actuation voltage at the device (V RMS).
    pub actuation_voltage: f64,
    /// Current through the device (A).
    pub current: f64,
    /// |Z| of the device (Ω).
    pub impedance: f64,
    /// Device capacitance (F).
    pub capacitance: f64,
}

/// Turns ADC codes into volts, amps and farads with one calibration profile.
#[derive(Debug, Clone)]
pub struct SampleConverter<'a> {
    pub profile: &'a CalibrationProfile,
    pub aref: f64,
    pub frequency: f64,
    pub period_ms: f64,
}

impl SampleConverter<'_> {
    /// `None` for saturated samples or resistor indices the profile does not know.
    pub fn convert(&self, index: usize, sample: &RawSample) -> Option<ConvertedSample> {
        if !sample.is_valid() {
            return None;
        }
        let feedback_resistance = *self
            .profile
            .feedback_resistors
            .get(sample.fb_resistor as usize)?;
        let hv = adc_to_volts(sample.hv_adc, self.aref) - self.profile.vgnd_high;
        let fb = adc_to_volts(sample.fb_adc, self.aref) - self.profile.vgnd_low;

        let actuation_voltage = (hv * self.profile.amplifier_gain).abs();
        let current = fb.abs() / feedback_resistance;
        let impedance = if current > 0.0 {
            actuation_voltage / current
        } else {
            f64::INFINITY
        };
        let capacitance = if actuation_voltage > 0.0 {
            current / (2.0 * PI * self.frequency * actuation_voltage)
        } else {
            0.0
        };

        Some(ConvertedSample {
            time_ms: index as f64 * self.period_ms,
            actuation_voltage,
            current,
            impedance,
            capacitance,
        })
    }

    pub fn convert_all(&self, buffer: &SampleBuffer) -> Vec<ConvertedSample> {
        buffer
            .samples()
            .iter()
            .enumerate()
            .filter_map(|(i, sample)| self.convert(i, sample))
            .collect()
    }
}

/// Processed outcome of one measurement, handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementResult {
    pub frequency: f64,
    pub voltage: f64,
    pub actuated_area: f64,
    pub time_ms: Vec<f64>,
    pub actuation_voltage: Vec<f64>,
    pub impedance: Vec<f64>,
    /// Device capacitance with the stray (all switches off) part removed.
    pub capacitance: Vec<f64>,
    /// Force per unit length (µN/mm), or raw capacitance when normalisation is off.
    pub force: Vec<f64>,
    pub force_estimate: f64,
    pub amplifier_gain: f64,
    pub vgnd_high: f64,
    pub vgnd_low: f64,
    pub filter_applied: bool,
    pub force_normalized: bool,
    pub tolerance_violations_ignored: bool,
}

impl MeasurementResult {
    pub fn len(&self) -> usize {
        self.time_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_ms.is_empty()
    }

    pub fn mean_actuation_voltage(&self) -> Option<f64> {
        mean(&self.actuation_voltage)
    }

    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        DataFrame::new(vec![
            Column::from(Series::new(TIME_COLUMN_NAME.into(), self.time_ms.as_slice())),
            Column::from(Series::new(VOLTAGE_COLUMN_NAME.into(), self.actuation_voltage.as_slice())),
            Column::from(Series::new(IMPEDANCE_COLUMN_NAME.into(), self.impedance.as_slice())),
            Column::from(Series::new(CAPACITANCE_COLUMN_NAME.into(), self.capacitance.as_slice())),
            Column::from(Series::new(FORCE_COLUMN_NAME.into(), self.force.as_slice())),
        ])
    }

    /// Frame with impedance and capacitance also expressed per mm² of actuated electrode.
    pub fn to_area_normalized_frame(&self) -> Result<LazyFrame, PolarsError> {
        let area = self.actuated_area;
        let df = self.to_dataframe()?.lazy();
        if area <= 0.0 {
            return Ok(df);
        }
        Ok(df.with_columns([
            (col(IMPEDANCE_COLUMN_NAME) * lit(area))
                .alias(format!("{IMPEDANCE_COLUMN_NAME}{AREA_NORMALIZED_SUFFIX}")),
            (col(CAPACITANCE_COLUMN_NAME) / lit(area))
                .alias(format!("{CAPACITANCE_COLUMN_NAME}{AREA_NORMALIZED_SUFFIX}")),
        ]))
    }
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        None
    } else {
        Some(finite.iter().sum::<f64>() / finite.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hv_adc: u16, fb_adc: u16) -> RawSample {
        RawSample {
            hv_adc,
            fb_adc,
            hv_resistor: 0,
            fb_resistor: 1,
        }
    }

    #[test]
    fn test_buffer_refuses_beyond_capacity() {
        let mut buffer = SampleBuffer::with_capacity(3);
        let refused = buffer.extend((0..5).map(|i| sample(i, i)));
        assert_eq!(refused, 2);
        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_full());
    }

    #[test]
    fn test_buffer_capacity_is_bounded_by_board() {
        let buffer = SampleBuffer::with_capacity(10_000);
        assert_eq!(buffer.capacity(), SAMPLE_BUFFER_CAPACITY);
    }

    #[test]
    fn test_conversion_recovers_capacitance() {
        let profile = CalibrationProfile {
            amplifier_gain: 100.0,
            vgnd_high: 2.5,
            vgnd_low: 2.5,
            feedback_resistors: vec![10.0, 1.0e4],
            ..CalibrationProfile::default()
        };
        let aref = 5.0;
        let current = 1.0e-4;
        let converter = SampleConverter {
            profile: &profile,
            aref,
            frequency: 1000.0,
            period_ms: 10.0,
        };
        let raw = sample(volts_to_adc(3.5, aref), volts_to_adc(2.5 + current * 1.0e4, aref));

        let converted = converter.convert(4, &raw).unwrap();
        assert!((converted.time_ms - 40.0).abs() < 1e-9);
        assert!((converted.actuation_voltage - 100.0).abs() < 0.5);
        assert!((converted.current - current).abs() / current < 0.01);
        let expected_c = current / (2.0 * PI * 1000.0 * 100.0);
        assert!((converted.capacitance - expected_c).abs() / expected_c < 0.02);
    }

    #[test]
    fn test_saturated_sample_is_skipped() {
        let profile = CalibrationProfile::default();
        let converter = SampleConverter {
            profile: &profile,
            aref: 5.0,
            frequency: 1000.0,
            period_ms: 10.0,
        };
        let mut raw = sample(600, 600);
        raw.fb_resistor = -1;
        assert!(converter.convert(0, &raw).is_none());
        raw.fb_resistor = 99;
        assert!(converter.convert(0, &raw).is_none());
    }

    #[test]
    fn test_dataframe_export() {
        let result = MeasurementResult {
            frequency: 1e3,
            voltage: 100.0,
            actuated_area: 2.0,
            time_ms: vec![0.0, 10.0],
            actuation_voltage: vec![99.0, 101.0],
            impedance: vec![1e6, 2e6],
            capacitance: vec![2e-12, 4e-12],
            force: vec![1.0, 2.0],
            force_estimate: 1.5,
            amplifier_gain: 100.0,
            vgnd_high: 2.5,
            vgnd_low: 2.5,
            filter_applied: false,
            force_normalized: true,
            tolerance_violations_ignored: false,
        };
        let df = result.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 5);

        let normalized = result.to_area_normalized_frame().unwrap().collect().unwrap();
        let per_area = normalized.column("capacitance_per_mm2").unwrap().f64().unwrap();
        assert_eq!(per_area.get(1), Some(2e-12));
        assert_eq!(result.mean_actuation_voltage(), Some(100.0));
    }
}
