// stance_core/src/nlp/options.rs

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;

/// A raw option value as a caller or a scenario file supplies it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Int(i64),
    Num(f64),
    Str(String),
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Num(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Int(v) => write!(f, "{v}"),
            OptionValue::Num(v) => write!(f, "{v}"),
            OptionValue::Str(v) => f.write_str(v),
        }
    }
}

/// Options keyed by name, applied in key order.
pub type OptionMap = BTreeMap<String, OptionValue>;

/// Backend for the Newton-type linear systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinearSolver {
    /// Block-tridiagonal elimination with a Schur complement on the parameters.
    #[default]
    Banded,
    /// Assembles the full matrix and factors it with a dense Cholesky.
    Dense,
}

/// Engine settings. Keys and meanings follow the IPOPT option names where one exists.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    pub linear_solver: LinearSolver,
    /// 0 silences the engine, 5 logs every iteration, 12 adds the step details.
    pub print_level: u8,
    /// Suppress the start-up banner (`sb = "yes"`).
    pub suppress_banner: bool,
    pub max_iter: usize,
    /// Wall-clock cap in seconds.
    pub max_cpu_time: f64,
    /// Stationarity tolerance on the projected Lagrangian gradient.
    pub tol: f64,
    pub acceptable_tol: f64,
    pub constr_viol_tol: f64,
    pub acceptable_constr_viol_tol: f64,
    /// Initial augmented-Lagrangian penalty. `None` derives it from the initial guess.
    pub penalty_init: Option<f64>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            linear_solver: LinearSolver::Banded,
            print_level: 0,
            suppress_banner: false,
            max_iter: 3000,
            max_cpu_time: 1e6,
            tol: 1e-8,
            acceptable_tol: 1e-6,
            constr_viol_tol: 1e-8,
            acceptable_constr_viol_tol: 1e-4,
            penalty_init: None,
        }
    }
}

impl SolverOptions {
    /// Sets one option by name. Unknown names and ill-typed values are rejected.
    pub fn set(&mut self, key: &str, value: OptionValue) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidOptionValue {
            key: key.to_string(),
            reason: format!("{reason}, got '{value}'"),
        };

        match key {
            "linear_solver" => {
                self.linear_solver = match as_str(&value).ok_or_else(|| invalid("expected a name"))? {
                    "dense" => LinearSolver::Dense,
                    // Sparse direct solver names map onto the block-banded backend.
                    "banded" | "ma27" | "ma57" | "ma77" | "ma86" | "ma97" | "mumps" => {
                        LinearSolver::Banded
                    }
                    _ => return Err(invalid("expected 'banded' or 'dense'")),
                }
            }
            "print_level" => {
                let level = as_int(&value).ok_or_else(|| invalid("expected an integer"))?;
                if !(0..=12).contains(&level) {
                    return Err(invalid("expected a level in 0..=12"));
                }
                self.print_level = level as u8;
            }
            "sb" => {
                self.suppress_banner = match as_str(&value) {
                    Some("yes") => true,
                    Some("no") => false,
                    _ => return Err(invalid("expected 'yes' or 'no'")),
                }
            }
            "max_iter" => {
                let iterations = as_int(&value).ok_or_else(|| invalid("expected an integer"))?;
                if iterations < 0 {
                    return Err(invalid("expected a non-negative count"));
                }
                self.max_iter = iterations as usize;
            }
            "max_cpu_time" => self.max_cpu_time = positive(&value).ok_or_else(|| invalid("expected a positive number"))?,
            "tol" => self.tol = positive(&value).ok_or_else(|| invalid("expected a positive number"))?,
            "acceptable_tol" => {
                self.acceptable_tol = positive(&value).ok_or_else(|| invalid("expected a positive number"))?
            }
            "constr_viol_tol" => {
                self.constr_viol_tol = positive(&value).ok_or_else(|| invalid("expected a positive number"))?
            }
            "acceptable_constr_viol_tol" => {
                self.acceptable_constr_viol_tol =
                    positive(&value).ok_or_else(|| invalid("expected a positive number"))?
            }
            "penalty_init" => {
                self.penalty_init = Some(positive(&value).ok_or_else(|| invalid("expected a positive number"))?)
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    pub fn apply(&mut self, options: &OptionMap) -> Result<(), ConfigError> {
        for (key, value) in options {
            self.set(key, value.clone())?;
        }
        Ok(())
    }
}

fn as_str(value: &OptionValue) -> Option<&str> {
    match value {
        OptionValue::Str(s) => Some(s.as_str()),
        _ => None,
    }
}

fn as_int(value: &OptionValue) -> Option<i64> {
    match value {
        OptionValue::Int(v) => Some(*v),
        _ => None,
    }
}

fn positive(value: &OptionValue) -> Option<f64> {
    let number = match value {
        OptionValue::Int(v) => *v as f64,
        OptionValue::Num(v) => *v,
        OptionValue::Str(_) => return None,
    };
    (number.is_finite() && number > 0.0).then_some(number)
}
