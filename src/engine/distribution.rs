use rand::{Rng, rngs::StdRng};
use std::fmt;

use crate::{
    engine::{units::Units, value::Real},
    error::{EngineError, VeldResult},
};

/// A distribution value: *virtualized* (parameters only) or *realized* (a
/// finite ordered sequence of samples).
///
/// Virtualized distributions stay symbolic under affine arithmetic (shift
/// and scale have closed forms); anything element-wise requires realizing
/// first, which draws from the platform RNG.
#[derive(Clone, Debug)]
pub enum Distribution {
    Normal {
        mean: Real,
        std: Real,
        units: Units,
    },
    Uniform {
        low: Real,
        high: Real,
        units: Units,
    },
    Realized {
        samples: Vec<Real>,
        units: Units,
    },
}

impl Distribution {
    pub fn normal(mean: Real, std: Real, units: Units) -> Self {
        Distribution::Normal { mean, std, units }
    }

    pub fn uniform(low: Real, high: Real, units: Units) -> Self {
        Distribution::Uniform { low, high, units }
    }

    pub fn realized(samples: Vec<Real>, units: Units) -> Self {
        Distribution::Realized { samples, units }
    }

    pub fn realized_f64(samples: impl IntoIterator<Item = f64>, units: Units) -> Self {
        Distribution::Realized {
            samples: samples.into_iter().map(Real::from_f64).collect(),
            units,
        }
    }

    pub fn units(&self) -> &Units {
        match self {
            Distribution::Normal { units, .. }
            | Distribution::Uniform { units, .. }
            | Distribution::Realized { units, .. } => units,
        }
    }

    pub fn with_units(self, units: Units) -> Self {
        match self {
            Distribution::Normal { mean, std, .. } => Distribution::Normal { mean, std, units },
            Distribution::Uniform { low, high, .. } => Distribution::Uniform { low, high, units },
            Distribution::Realized { samples, .. } => Distribution::Realized { samples, units },
        }
    }

    pub fn is_virtualized(&self) -> bool {
        !matches!(self, Distribution::Realized { .. })
    }

    // --------------------------------------------------------------------------------------------
    // Affine arithmetic (closed-form on virtualized distributions)
    // --------------------------------------------------------------------------------------------

    pub fn shift(&self, delta: Real) -> Distribution {
        match self {
            Distribution::Normal { mean, std, units } => Distribution::Normal {
                mean: mean.add(delta),
                std: *std,
                units: units.clone(),
            },
            Distribution::Uniform { low, high, units } => Distribution::Uniform {
                low: low.add(delta),
                high: high.add(delta),
                units: units.clone(),
            },
            Distribution::Realized { samples, units } => Distribution::Realized {
                samples: samples.iter().map(|s| s.add(delta)).collect(),
                units: units.clone(),
            },
        }
    }

    pub fn scale(&self, factor: Real) -> Distribution {
        match self {
            Distribution::Normal { mean, std, units } => Distribution::Normal {
                mean: mean.mul(factor),
                std: std.mul(factor).abs(),
                units: units.clone(),
            },
            Distribution::Uniform { low, high, units } => {
                let (a, b) = (low.mul(factor), high.mul(factor));
                let (low, high) = if a.compare(b) == std::cmp::Ordering::Greater {
                    (b, a)
                } else {
                    (a, b)
                };
                Distribution::Uniform {
                    low,
                    high,
                    units: units.clone(),
                }
            }
            Distribution::Realized { samples, units } => Distribution::Realized {
                samples: samples.iter().map(|s| s.mul(factor)).collect(),
                units: units.clone(),
            },
        }
    }

    /// Element-wise transform; only realized distributions support it.
    pub fn map_realized(
        &self,
        op: impl Fn(Real) -> VeldResult<Real>,
    ) -> VeldResult<Distribution> {
        match self {
            Distribution::Realized { samples, units } => Ok(Distribution::Realized {
                samples: samples.iter().map(|s| op(*s)).collect::<VeldResult<_>>()?,
                units: units.clone(),
            }),
            _ => Err(virtualized_error("element-wise transform")),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Sampling
    // --------------------------------------------------------------------------------------------

    /// Draws `n` samples, materializing a realized distribution.
    pub fn sample(&self, n: usize, rng: &mut StdRng) -> Distribution {
        let units = self.units().clone();
        let samples = match self {
            Distribution::Normal { mean, std, .. } => {
                let (mu, sigma) = (mean.to_f64(), std.to_f64());
                (0..n)
                    .map(|_| Real::from_f64(mu + sigma * standard_normal(rng)))
                    .collect()
            }
            Distribution::Uniform { low, high, .. } => {
                let (a, b) = (low.to_f64(), high.to_f64());
                (0..n)
                    .map(|_| Real::from_f64(rng.random_range(a..=b)))
                    .collect()
            }
            Distribution::Realized { samples, .. } => {
                if samples.is_empty() {
                    Vec::new()
                } else {
                    (0..n)
                        .map(|_| samples[rng.random_range(0..samples.len())])
                        .collect()
                }
            }
        };
        Distribution::Realized { samples, units }
    }

    // --------------------------------------------------------------------------------------------
    // Reductions
    // --------------------------------------------------------------------------------------------

    pub fn mean(&self) -> VeldResult<Real> {
        match self {
            Distribution::Normal { mean, .. } => Ok(*mean),
            Distribution::Uniform { low, high, .. } => {
                low.add(*high).div(Real::from_i64(2))
            }
            Distribution::Realized { samples, .. } => {
                if samples.is_empty() {
                    return Err(empty_error("mean"));
                }
                let total = samples
                    .iter()
                    .fold(Real::from_i64(0), |acc, s| acc.add(*s));
                total.div(Real::from_i64(samples.len() as i64))
            }
        }
    }

    /// Population standard deviation; closed-form for virtualized shapes.
    pub fn std(&self) -> VeldResult<Real> {
        match self {
            Distribution::Normal { std, .. } => Ok(*std),
            Distribution::Uniform { low, high, .. } => {
                let width = high.sub(*low).to_f64();
                Ok(Real::from_f64(width / 12f64.sqrt()))
            }
            Distribution::Realized { samples, .. } => {
                if samples.is_empty() {
                    return Err(empty_error("std"));
                }
                let mean = self.mean()?.to_f64();
                let variance = samples
                    .iter()
                    .map(|s| (s.to_f64() - mean).powi(2))
                    .sum::<f64>()
                    / samples.len() as f64;
                Ok(Real::from_f64(variance.sqrt()))
            }
        }
    }

    pub fn min(&self) -> VeldResult<Real> {
        match self {
            Distribution::Uniform { low, .. } => Ok(*low),
            Distribution::Realized { samples, .. } => samples
                .iter()
                .copied()
                .reduce(|a, b| if a.compare(b).is_le() { a } else { b })
                .ok_or_else(|| empty_error("min")),
            Distribution::Normal { .. } => Err(virtualized_error("min")),
        }
    }

    pub fn max(&self) -> VeldResult<Real> {
        match self {
            Distribution::Uniform { high, .. } => Ok(*high),
            Distribution::Realized { samples, .. } => samples
                .iter()
                .copied()
                .reduce(|a, b| if a.compare(b).is_ge() { a } else { b })
                .ok_or_else(|| empty_error("max")),
            Distribution::Normal { .. } => Err(virtualized_error("max")),
        }
    }

    pub fn sum(&self) -> VeldResult<Real> {
        match self {
            Distribution::Realized { samples, .. } => Ok(samples
                .iter()
                .fold(Real::from_i64(0), |acc, s| acc.add(*s))),
            _ => Err(virtualized_error("sum")),
        }
    }

    pub fn count(&self) -> VeldResult<usize> {
        match self {
            Distribution::Realized { samples, .. } => Ok(samples.len()),
            _ => Err(virtualized_error("count")),
        }
    }

    pub fn samples(&self) -> VeldResult<&[Real]> {
        match self {
            Distribution::Realized { samples, .. } => Ok(samples),
            _ => Err(virtualized_error("samples")),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Normal { mean, std, units } => {
                write!(f, "normal({mean}, {std}) {units}")
            }
            Distribution::Uniform { low, high, units } => {
                write!(f, "uniform({low}, {high}) {units}")
            }
            Distribution::Realized { samples, units } => {
                write!(f, "[{} samples] {units}", samples.len())
            }
        }
    }
}

fn virtualized_error(op: &str) -> crate::error::VeldError {
    EngineError::Arithmetic(format!("'{op}' requires a realized distribution")).into()
}

fn empty_error(op: &str) -> crate::error::VeldError {
    EngineError::Arithmetic(format!("'{op}' over an empty distribution")).into()
}

/// Standard normal draw via Box-Muller. Dependency-free and deterministic
/// under a seeded `StdRng`.
fn standard_normal(rng: &mut StdRng) -> f64 {
    let mut u1: f64 = rng.random();
    while u1 <= f64::EPSILON {
        u1 = rng.random();
    }
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
