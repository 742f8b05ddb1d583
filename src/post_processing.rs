//! Smoothing and force normalisation applied to a measured series before it
//! is handed to callers.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationProfile;

/// Converts ½·(F/mm²)·V² into µN/mm.
const FORCE_SCALE: f64 = 0.5 * 1e9;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PostProcessError {
    #[error("Invalid filter: window {window} must be odd and larger than order {order}")]
    InvalidFilterConfig { window: usize, order: usize },
}

/// Savitzky-Golay filter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub window: usize,
    pub order: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: 5,
            order: 2,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), PostProcessError> {
        if self.window % 2 == 0 || self.window < self.order + 1 {
            return Err(PostProcessError::InvalidFilterConfig {
                window: self.window,
                order: self.order,
            });
        }
        Ok(())
    }
}

/// Smooth `series` with a Savitzky-Golay filter.
///
/// Every point is replaced by the value at that point of a least-squares
/// polynomial fitted over a window around it. Near the edges the window is
/// shifted inwards so that it stays full. Returns the series and whether the
/// filter actually ran; a disabled filter or a series shorter than the window
/// comes back unchanged.
pub fn smooth(series: &[f64], config: &FilterConfig) -> Result<(Vec<f64>, bool), PostProcessError> {
    config.validate()?;
    if !config.enabled || series.len() < config.window {
        if config.enabled {
            log::debug!(
                "Series of {} points is shorter than the filter window {}; not filtering",
                series.len(),
                config.window
            );
        }
        return Ok((series.to_vec(), false));
    }

    let Some(weights) = smoothing_matrix(config.window, config.order) else {
        log::warn!(
            "Savitzky-Golay fit of order {} over {} points is singular; not filtering",
            config.order,
            config.window
        );
        return Ok((series.to_vec(), false));
    };
    let half = config.window / 2;
    let last_start = series.len() - config.window;
    let smoothed = (0..series.len())
        .map(|i| {
            let start = i.saturating_sub(half).min(last_start);
            let window = &series[start..start + config.window];
            weights
                .row(i - start)
                .iter()
                .zip(window)
                .map(|(weight, y)| weight * y)
                .sum::<f64>()
        })
        .collect();
    Ok((smoothed, true))
}

/// Savitzky-Golay weights for a window: row `k` gives the fitted value at
/// position `k` as a weighted sum of the window's samples.
///
/// This is the hat matrix `A (AᵀA)⁻¹ Aᵀ` of the polynomial design matrix `A`,
/// with positions centred on the middle of the window.
fn smoothing_matrix(window: usize, order: usize) -> Option<DMatrix<f64>> {
    let centre = (window / 2) as f64;
    let design = DMatrix::from_fn(window, order + 1, |row, power| {
        (row as f64 - centre).powi(power as i32)
    });
    let transposed = design.transpose();
    let projection = (&transposed * &design).lu().solve(&transposed)?;
    Some(design * projection)
}

/// Force per unit length (µN/mm) from capacitance (F) and actuation voltage (V).
///
/// force = ½ · (C / area − baseline) · V². Returns the series and whether it
/// was normalised; when disabled, or without a positive area, the raw
/// capacitance passes through unchanged.
pub fn normalize_force(
    capacitance: &[f64],
    voltage: &[f64],
    area: f64,
    profile: &CalibrationProfile,
    enabled: bool,
) -> (Vec<f64>, bool) {
    if !enabled {
        return (capacitance.to_vec(), false);
    }
    if area <= 0.0 {
        log::debug!("No actuated area; reporting raw capacitance instead of force");
        return (capacitance.to_vec(), false);
    }
    let force = capacitance
        .iter()
        .zip(voltage)
        .map(|(&c, &v)| FORCE_SCALE * (c / area - profile.capacitance_baseline) * v * v)
        .collect();
    (force, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(window: usize, order: usize) -> FilterConfig {
        FilterConfig {
            enabled: true,
            window,
            order,
        }
    }

    #[test]
    fn test_invalid_windows() {
        assert!(enabled(4, 2).validate().is_err());
        assert!(enabled(3, 3).validate().is_err());
        assert!(enabled(5, 4).validate().is_ok());
        assert_eq!(
            smooth(&[1.0; 10], &enabled(2, 1)),
            Err(PostProcessError::InvalidFilterConfig { window: 2, order: 1 })
        );
    }

    #[test]
    fn test_polynomial_is_preserved() {
        // A quadratic is reproduced exactly by an order-2 fit, edges included.
        let series: Vec<f64> = (0..20).map(|i| {
            let x = i as f64;
            0.5 * x * x - 3.0 * x + 2.0
        }).collect();
        let (smoothed, applied) = smooth(&series, &enabled(7, 2)).unwrap();
        assert!(applied);
        for (a, b) in series.iter().zip(&smoothed) {
            assert!((a - b).abs() < 1e-6, "{a} != {b}");
        }
    }

    #[test]
    fn test_centre_weights_match_tabulated_coefficients() {
        // Window 5, order 2: (-3, 12, 17, 12, -3) / 35
        let weights = smoothing_matrix(5, 2).unwrap();
        let expected = [-3.0, 12.0, 17.0, 12.0, -3.0];
        for (column, value) in expected.iter().enumerate() {
            assert!((weights[(2, column)] - value / 35.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_noise_is_reduced() {
        let series: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let (smoothed, _) = smooth(&series, &enabled(5, 1)).unwrap();
        let energy = |s: &[f64]| s[2..38].iter().map(|v| v * v).sum::<f64>();
        assert!(energy(&smoothed) < 0.1 * energy(&series));
    }

    #[test]
    fn test_short_series_passes_through() {
        let series = vec![1.0, 5.0, 2.0];
        let (smoothed, applied) = smooth(&series, &enabled(5, 2)).unwrap();
        assert!(!applied);
        assert_eq!(smoothed, series);

        let (smoothed, applied) = smooth(&series, &FilterConfig::default()).unwrap();
        assert!(!applied);
        assert_eq!(smoothed, series);
    }

    #[test]
    fn test_force_normalisation() {
        let profile = CalibrationProfile {
            capacitance_baseline: 1e-12,
            ..CalibrationProfile::default()
        };
        // 3 pF/mm² over a 1 pF/mm² baseline at 100 V
        let (force, normalized) = normalize_force(&[6e-12], &[100.0], 2.0, &profile, true);
        assert!(normalized);
        let expected = 0.5 * 2e-12 * 1e4 * 1e9;
        assert!((force[0] - expected).abs() < 1e-9);

        let (raw, normalized) = normalize_force(&[6e-12], &[100.0], 2.0, &profile, false);
        assert!(!normalized);
        assert_eq!(raw, vec![6e-12]);

        let (raw, normalized) = normalize_force(&[6e-12], &[100.0], 0.0, &profile, true);
        assert!(!normalized);
        assert_eq!(raw, vec![6e-12]);
    }
}
