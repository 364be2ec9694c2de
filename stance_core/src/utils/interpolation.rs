// stance_core/src/utils/interpolation.rs

use crate::error::ConfigError;

/// Piecewise-linear interpolation over a strictly monotone sample grid.
///
/// Queries outside the grid are clamped to the first or last sample.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearInterpolator {
    x: Vec<f64>,
    y: Vec<f64>,
    ascending: bool,
}

impl LinearInterpolator {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, ConfigError> {
        if x.len() < 2 {
            return Err(ConfigError::TooFewNodes {
                required: 2,
                got: x.len(),
            });
        }
        if x.len() != y.len() {
            return Err(ConfigError::ShapeMismatch {
                what: "interpolation samples",
                expected: (x.len(), 1),
                got: (y.len(), 1),
            });
        }
        let ascending = x[x.len() - 1] > x[0];
        let monotone = x.windows(2).all(|w| {
            if ascending {
                w[1] > w[0]
            } else {
                w[1] < w[0]
            }
        });
        if !monotone {
            return Err(ConfigError::NonMonotoneGrid(format!(
                "{} samples spanning [{}, {}]",
                x.len(),
                x[0],
                x[x.len() - 1]
            )));
        }
        Ok(Self { x, y, ascending })
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Index `j` such that `x` lies in `[self.x[j], self.x[j + 1]]`.
    fn locate(&self, x: f64) -> usize {
        let upper = if self.ascending {
            self.x.partition_point(|&xi| xi <= x)
        } else {
            self.x.partition_point(|&xi| xi >= x)
        };
        upper.saturating_sub(1).min(self.x.len() - 2)
    }

    pub fn value(&self, x: f64) -> f64 {
        let j = self.locate(x);
        let (x0, x1) = (self.x[j], self.x[j + 1]);
        let s = ((x - x0) / (x1 - x0)).clamp(0.0, 1.0);
        self.y[j] + s * (self.y[j + 1] - self.y[j])
    }

    pub fn values(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.value(x)).collect()
    }
}
