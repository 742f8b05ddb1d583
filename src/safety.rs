//! Safety policy checks. Everything here is a pure function of its inputs;
//! the only state is the [`ToleranceLog`] accumulator that the executor owns
//! for the duration of one protocol run.

use std::f64::consts::PI;
use std::fmt;

use crate::config::WaveformLimits;

/// Operating current limit (A).
pub const OPERATING_CURRENT_LIMIT: f64 = 10e-3;

/// Stricter current limit applied while a calibration load is connected (A).
pub const CALIBRATION_CURRENT_LIMIT: f64 = 5e-3;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SafetyError {
    #[error("Current limit exceeded: {measured_ma:.3} mA > {limit_ma:.3} mA")]
    CurrentLimitExceeded { measured_ma: f64, limit_ma: f64 },

    #[error("Waveform out of range: {0}")]
    WaveformOutOfRange(String),
}

/// Fail if `current` (A) exceeds `limit` (A).
pub fn check_current(current: f64, limit: f64) -> Result<(), SafetyError> {
    if !current.is_finite() || current.abs() > limit {
        return Err(SafetyError::CurrentLimitExceeded {
            measured_ma: current.abs() * 1e3,
            limit_ma: limit * 1e3,
        });
    }
    Ok(())
}

/// RMS current a sine of `voltage` (V RMS) at `frequency` drives into `capacitance` (F).
pub fn predicted_current(voltage: f64, frequency: f64, capacitance: f64) -> f64 {
    2.0 * PI * frequency * capacitance * voltage
}

pub fn check_waveform(voltage: f64, frequency: f64, limits: &WaveformLimits) -> Result<(), SafetyError> {
    if !voltage.is_finite() || voltage < 0.0 || voltage > limits.max_voltage {
        return Err(SafetyError::WaveformOutOfRange(format!(
            "voltage {voltage} V outside 0..={} V",
            limits.max_voltage
        )));
    }
    if !frequency.is_finite() || frequency < limits.min_frequency || frequency > limits.max_frequency {
        return Err(SafetyError::WaveformOutOfRange(format!(
            "frequency {frequency} Hz outside {}..={} Hz",
            limits.min_frequency, limits.max_frequency
        )));
    }
    Ok(())
}

/// A measured actuation voltage that missed its set point by more than the tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceViolation {
    pub requested: f64,
    pub measured: f64,
    pub tolerance: f64,
}

impl ToleranceViolation {
    pub fn deviation(&self) -> f64 {
        self.measured - self.requested
    }
}

impl fmt::Display for ToleranceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "set {:.1} V, measured {:.1} V (tolerance {:.1} V)",
            self.requested, self.measured, self.tolerance
        )
    }
}

/// Flag, never fail: tolerance misses are only reported.
pub fn check_voltage_tolerance(requested: f64, measured: f64, tolerance: f64) -> Option<ToleranceViolation> {
    if (measured - requested).abs() > tolerance {
        Some(ToleranceViolation {
            requested,
            measured,
            tolerance,
        })
    } else {
        None
    }
}

/// Tolerance violations attributed to the step that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedViolation {
    pub step: usize,
    pub violation: ToleranceViolation,
}

/// Single aggregated report of every tolerance violation in a protocol run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceWarning {
    pub violations: Vec<RecordedViolation>,
}

impl ToleranceWarning {
    pub fn steps(&self) -> Vec<usize> {
        let mut steps: Vec<usize> = self.violations.iter().map(|v| v.step).collect();
        steps.dedup();
        steps
    }

    pub fn worst(&self) -> Option<&RecordedViolation> {
        self.violations.iter().max_by(|a, b| {
            a.violation
                .deviation()
                .abs()
                .total_cmp(&b.violation.deviation().abs())
        })
    }
}

impl fmt::Display for ToleranceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} voltage tolerance violations in steps {:?}",
            self.violations.len(),
            self.steps()
        )?;
        if let Some(worst) = self.worst() {
            write!(f, "; worst in step {}: {}", worst.step, worst.violation)?;
        }
        Ok(())
    }
}

/// Collects tolerance violations while a protocol runs and hands them out
/// exactly once when it ends.
#[derive(Debug, Default)]
pub struct ToleranceLog {
    violations: Vec<RecordedViolation>,
}

impl ToleranceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: usize, violations: impl IntoIterator<Item = ToleranceViolation>) {
        self.violations.extend(
            violations
                .into_iter()
                .map(|violation| RecordedViolation { step, violation }),
        );
    }

    pub fn len(&self) -> usize {
        self.violations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Drain into one warning, or `None` if nothing was recorded.
    pub fn flush(&mut self) -> Option<ToleranceWarning> {
        if self.violations.is_empty() {
            return None;
        }
        Some(ToleranceWarning {
            violations: std::mem::take(&mut self.violations),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_limit() {
        assert!(check_current(9.9e-3, OPERATING_CURRENT_LIMIT).is_ok());
        assert!(check_current(-9.9e-3, OPERATING_CURRENT_LIMIT).is_ok());
        let err = check_current(10.5e-3, OPERATING_CURRENT_LIMIT).unwrap_err();
        assert!(matches!(err, SafetyError::CurrentLimitExceeded { limit_ma, .. } if (limit_ma - 10.0).abs() < 1e-9));
        assert!(check_current(6e-3, CALIBRATION_CURRENT_LIMIT).is_err());
        assert!(check_current(f64::NAN, OPERATING_CURRENT_LIMIT).is_err());
    }

    #[test]
    fn test_predicted_current_of_capacitive_load() {
        // 100 V RMS at 10 kHz into 1 nF
        let current = predicted_current(100.0, 10e3, 1e-9);
        assert!((current - 6.283e-3).abs() < 1e-6);
    }

    #[test]
    fn test_waveform_limits() {
        let limits = WaveformLimits::default();
        assert!(check_waveform(100.0, 1e3, &limits).is_ok());
        assert!(check_waveform(250.0, 1e3, &limits).is_err());
        assert!(check_waveform(100.0, 50.0, &limits).is_err());
        assert!(check_waveform(100.0, 30e3, &limits).is_err());
    }

    #[test]
    fn test_tolerance_is_a_flag() {
        assert!(check_voltage_tolerance(100.0, 104.0, 5.0).is_none());
        let violation = check_voltage_tolerance(100.0, 90.0, 5.0).unwrap();
        assert!((violation.deviation() + 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_log_flushes_once() {
        let mut log = ToleranceLog::new();
        assert!(log.flush().is_none());

        log.record(0, check_voltage_tolerance(100.0, 90.0, 5.0));
        log.record(2, check_voltage_tolerance(50.0, 70.0, 5.0));
        log.record(2, check_voltage_tolerance(50.0, 51.0, 5.0));
        assert_eq!(log.len(), 2);

        let warning = log.flush().unwrap();
        assert_eq!(warning.steps(), vec![0, 2]);
        assert_eq!(warning.worst().unwrap().step, 2);
        assert!(warning.to_string().starts_with("2 voltage tolerance violations"));
        assert!(log.flush().is_none());
    }
}
