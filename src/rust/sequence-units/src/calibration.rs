// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Calibration curves mapping a value in a calibration unit (e.g. a magnetic
//! field in nT) to the output quantity of a DAC channel.

use serde::{Deserialize, Serialize};

use crate::formula::{Formula, evaluate_constant};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpolationKind {
    #[default]
    Linear,
    #[serde(alias = "slinear")]
    SLinear,
    Nearest,
    #[serde(alias = "zero")]
    Previous,
    Next,
    Quadratic,
    Cubic,
}

/// Measured `(x, y)` pairs of a calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDataset {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    #[serde(default)]
    pub interpolation_mode: InterpolationKind,
}

/// An interpolating function through a sorted set of points.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolation {
    kind: InterpolationKind,
    x: Vec<f64>,
    y: Vec<f64>,
    // Hermite slopes, only populated for the smooth kinds.
    slopes: Vec<f64>,
}

impl Interpolation {
    pub fn new(dataset: &CalibrationDataset) -> Result<Self> {
        if dataset.x.len() != dataset.y.len() {
            return Err(Error::Interpolation(format!(
                "Calibration dataset has {} x values but {} y values",
                dataset.x.len(),
                dataset.y.len()
            )));
        }
        if dataset.x.len() < 2 {
            return Err(Error::Interpolation(
                "Calibration dataset needs at least two points".to_string(),
            ));
        }
        let mut points: Vec<(f64, f64)> = dataset
            .x
            .iter()
            .copied()
            .zip(dataset.y.iter().copied())
            .collect();
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(Error::Interpolation(
                "Calibration dataset contains non-finite values".to_string(),
            ));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        if points.windows(2).any(|w| w[0].0 == w[1].0) {
            return Err(Error::Interpolation(
                "Calibration dataset contains duplicate x values".to_string(),
            ));
        }
        let kind = match (dataset.interpolation_mode, points.len()) {
            (InterpolationKind::Cubic, n) if n < 4 => InterpolationKind::Quadratic,
            (kind, _) => kind,
        };
        let kind = match (kind, points.len()) {
            (InterpolationKind::Quadratic, n) if n < 3 => InterpolationKind::Linear,
            (kind, _) => kind,
        };
        let (x, y): (Vec<f64>, Vec<f64>) = points.into_iter().unzip();
        let slopes = match kind {
            InterpolationKind::Quadratic | InterpolationKind::Cubic => monotone_slopes(&x, &y),
            _ => Vec::new(),
        };
        Ok(Interpolation { kind, x, y, slopes })
    }

    pub fn kind(&self) -> InterpolationKind {
        self.kind
    }

    pub fn eval(&self, t: f64) -> Result<f64> {
        let (first, last) = (self.x[0], self.x[self.x.len() - 1]);
        if !(first..=last).contains(&t) {
            return Err(Error::Interpolation(format!(
                "Value {t} is outside of the calibrated range [{first}, {last}]"
            )));
        }
        // Index of the interval [x[k], x[k + 1]] containing t.
        let k = self
            .x
            .partition_point(|&xi| xi <= t)
            .saturating_sub(1)
            .min(self.x.len() - 2);
        let (x0, x1, y0, y1) = (self.x[k], self.x[k + 1], self.y[k], self.y[k + 1]);
        let h = x1 - x0;
        let s = (t - x0) / h;
        let value = match self.kind {
            InterpolationKind::Linear | InterpolationKind::SLinear => y0 + s * (y1 - y0),
            InterpolationKind::Nearest => {
                if s <= 0.5 {
                    y0
                } else {
                    y1
                }
            }
            InterpolationKind::Previous => {
                if t >= x1 {
                    y1
                } else {
                    y0
                }
            }
            InterpolationKind::Next => {
                if t <= x0 {
                    y0
                } else {
                    y1
                }
            }
            InterpolationKind::Quadratic | InterpolationKind::Cubic => {
                let (m0, m1) = (self.slopes[k], self.slopes[k + 1]);
                let s2 = s * s;
                let s3 = s2 * s;
                (2.0 * s3 - 3.0 * s2 + 1.0) * y0
                    + (s3 - 2.0 * s2 + s) * h * m0
                    + (-2.0 * s3 + 3.0 * s2) * y1
                    + (s3 - s2) * h * m1
            }
        };
        Ok(value)
    }
}

// Fritsch-Carlson slopes, which keep the Hermite spline monotone between
// monotone data points.
fn monotone_slopes(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();
    let delta: Vec<f64> = (0..n - 1).map(|k| (y[k + 1] - y[k]) / h[k]).collect();
    if n == 2 {
        return vec![delta[0], delta[0]];
    }
    let mut slopes = vec![0.0; n];
    for k in 1..n - 1 {
        if delta[k - 1] * delta[k] <= 0.0 {
            continue;
        }
        let w1 = 2.0 * h[k] + h[k - 1];
        let w2 = h[k] + 2.0 * h[k - 1];
        slopes[k] = (w1 + w2) / (w1 / delta[k - 1] + w2 / delta[k]);
    }
    slopes[0] = end_slope(h[0], h[1], delta[0], delta[1]);
    slopes[n - 1] = end_slope(h[n - 2], h[n - 3], delta[n - 2], delta[n - 3]);
    slopes
}

fn end_slope(h0: f64, h1: f64, d0: f64, d1: f64) -> f64 {
    let slope = ((2.0 * h0 + h1) * d0 - h0 * d1) / (h0 + h1);
    if slope.signum() != d0.signum() || d0 == 0.0 {
        0.0
    } else if d0.signum() != d1.signum() && slope.abs() > 3.0 * d0.abs() {
        3.0 * d0
    } else {
        slope
    }
}

/// Converts the text of a calibrated value into the output quantity.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationReader {
    Formula { formula: Formula, factor: f64 },
    Dataset { curve: Interpolation, factor: f64 },
}

impl CalibrationReader {
    pub fn formula(text: &str, factor: f64) -> Result<Self> {
        Ok(CalibrationReader::Formula {
            formula: Formula::parse(text)?,
            factor,
        })
    }

    pub fn dataset(dataset: &CalibrationDataset, factor: f64) -> Result<Self> {
        Ok(CalibrationReader::Dataset {
            curve: Interpolation::new(dataset)?,
            factor,
        })
    }

    pub fn read(&self, text: &str) -> Result<f64> {
        let x = evaluate_constant(text)?;
        let value = match self {
            CalibrationReader::Formula { formula, factor } => formula.eval(x) * factor,
            CalibrationReader::Dataset { curve, factor } => curve.eval(x)? * factor,
        };
        if !value.is_finite() {
            return Err(Error::NotFinite(text.to_string()));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dataset(x: &[f64], y: &[f64], mode: InterpolationKind) -> CalibrationDataset {
        CalibrationDataset {
            x: x.to_vec(),
            y: y.to_vec(),
            interpolation_mode: mode,
        }
    }

    #[test]
    fn test_linear() {
        let curve = Interpolation::new(&dataset(
            &[3.0, 1.0, 2.0],
            &[5.0, 2.0, 3.0],
            InterpolationKind::Linear,
        ))
        .unwrap();
        assert_eq!(curve.eval(1.5).unwrap(), 2.5);
        assert_eq!(curve.eval(3.0).unwrap(), 5.0);
        assert!(curve.eval(0.5).is_err());
    }

    #[test]
    fn test_mode_downgrade() {
        let two = dataset(&[0.0, 1.0], &[0.0, 2.0], InterpolationKind::Cubic);
        assert_eq!(
            Interpolation::new(&two).unwrap().kind(),
            InterpolationKind::Linear
        );
        let three = dataset(&[0.0, 1.0, 2.0], &[0.0, 2.0, 3.0], InterpolationKind::Cubic);
        assert_eq!(
            Interpolation::new(&three).unwrap().kind(),
            InterpolationKind::Quadratic
        );
    }

    #[test]
    fn test_invalid_datasets() {
        assert!(Interpolation::new(&dataset(&[1.0], &[1.0], InterpolationKind::Linear)).is_err());
        assert!(
            Interpolation::new(&dataset(&[1.0, 2.0], &[1.0], InterpolationKind::Linear)).is_err()
        );
        assert!(
            Interpolation::new(&dataset(
                &[1.0, 1.0],
                &[1.0, 2.0],
                InterpolationKind::Linear
            ))
            .is_err()
        );
    }

    #[test]
    fn test_step_kinds() {
        let x = [0.0, 1.0, 2.0];
        let y = [10.0, 20.0, 30.0];
        let previous = Interpolation::new(&dataset(&x, &y, InterpolationKind::Previous)).unwrap();
        assert_eq!(previous.eval(0.9).unwrap(), 10.0);
        let next = Interpolation::new(&dataset(&x, &y, InterpolationKind::Next)).unwrap();
        assert_eq!(next.eval(0.1).unwrap(), 20.0);
        let nearest = Interpolation::new(&dataset(&x, &y, InterpolationKind::Nearest)).unwrap();
        assert_eq!(nearest.eval(1.6).unwrap(), 30.0);
    }

    #[test]
    fn test_smooth_passes_through_points() {
        let x = [0.0, 1.0, 2.0, 4.0];
        let y = [0.0, 1.0, 4.0, 16.0];
        let curve = Interpolation::new(&dataset(&x, &y, InterpolationKind::Cubic)).unwrap();
        for (xi, yi) in x.iter().zip(y.iter()) {
            assert!((curve.eval(*xi).unwrap() - yi).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reader() {
        let reader = CalibrationReader::formula("2*x", 1e-3).unwrap();
        assert!((reader.read("500").unwrap() - 1.0).abs() < 1e-12);

        let reader = CalibrationReader::dataset(
            &dataset(&[0.0, 10.0], &[0.0, 5.0], InterpolationKind::Linear),
            1.0,
        )
        .unwrap();
        assert_eq!(reader.read("4").unwrap(), 2.0);
        assert!(reader.read("11").is_err());
    }

    proptest! {
        #[test]
        fn test_monotone_data_gives_monotone_curve(
            steps in prop::collection::vec((0.1f64..10.0, 0.0f64..10.0), 2..10)
        ) {
            let mut x = vec![0.0];
            let mut y = vec![0.0];
            for (dx, dy) in &steps {
                x.push(x[x.len() - 1] + dx);
                y.push(y[y.len() - 1] + dy);
            }
            let curve = Interpolation::new(&dataset(&x, &y, InterpolationKind::Cubic)).unwrap();
            let end = x[x.len() - 1];
            let mut previous = curve.eval(0.0).unwrap();
            for i in 1..=200 {
                let t = end * i as f64 / 200.0;
                let value = curve.eval(t.min(end)).unwrap();
                prop_assert!(value >= previous - 1e-9);
                prop_assert!(value <= y[y.len() - 1] + 1e-9);
                previous = value;
            }
        }
    }
}
