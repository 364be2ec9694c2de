// stance_core/src/identification/collocation.rs

//! Gain identification by direct collocation: states and gains are solved for together.

use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::models::ClosedLoopModel;
use crate::nlp::{OptionMap, SolveInfo};
use crate::scaling::{extract_gains, to_scaled};
use crate::trajectory::TrajectoryProblem;
use crate::types::{flatten_states, GainMatrix, Signal, StateTrajectory, NUM_GAINS};

/// Gain part of an initial guess, in scaled units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum GainGuess {
    #[default]
    Zeros,
    /// Uniform in `[0, 1)` per entry.
    Random { seed: u64 },
    /// Physical gains, scaled with the problem's factors.
    Known(GainMatrix),
}

/// State part of an initial guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateGuess {
    #[default]
    Zeros,
    /// Start the trajectory at the measurements.
    Measured,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InitialGuess {
    pub gains: GainGuess,
    pub states: StateGuess,
}

impl InitialGuess {
    /// Builds a decision vector of length `4N + 8` for `problem`.
    pub fn build(&self, problem: &TrajectoryProblem) -> DVector<f64> {
        let mut z = DVector::zeros(problem.num_free());
        if self.states == StateGuess::Measured {
            let states = flatten_states(problem.measured_states());
            z.rows_mut(0, states.len()).copy_from(&states);
        }
        let scaled = match self.gains {
            GainGuess::Zeros => GainMatrix::zeros(),
            GainGuess::Random { seed } => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                GainMatrix::from_fn(|_, _| rng.gen::<f64>())
            }
            GainGuess::Known(gains) => to_scaled(&gains, &problem.scale_factors()),
        };
        problem.collocation().set_scaled_gains(&mut z, &scaled);
        z
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollocationOutcome {
    /// Physical gains.
    pub gains: GainMatrix,
    pub scaled_gains: GainMatrix,
    pub solution: DVector<f64>,
    pub info: SolveInfo,
}

impl CollocationOutcome {
    pub fn is_success(&self) -> bool {
        self.info.is_success()
    }

    /// `(row, col)` of every gain that ended on one of its bounds.
    pub fn boundary_active_gains(&self) -> Vec<(usize, usize)> {
        let offset = self.solution.len() - NUM_GAINS;
        self.info
            .active_bounds
            .iter()
            .filter(|&&i| i >= offset)
            .map(|&i| ((i - offset) / 4, (i - offset) % 4))
            .collect()
    }
}

/// Builds the problem for one data set, then identifies with [`identify_with_problem`].
pub fn identify(
    num_nodes: usize,
    interval: f64,
    measured_states: &StateTrajectory,
    exogenous: &Signal,
    model: &(dyn ClosedLoopModel + 'static),
    solver_options: &OptionMap,
    initial_guess: Option<&DVector<f64>>,
) -> Result<(GainMatrix, CollocationOutcome), ConfigError> {
    let mut problem = TrajectoryProblem::build(num_nodes, interval, measured_states, exogenous, model)?;
    identify_with_problem(&mut problem, solver_options, initial_guess)
}

/// Solves an existing problem once, e.g. after [`TrajectoryProblem::retarget`].
///
/// Options are applied verbatim. A guess of `None` means all zeros. A solve that does
/// not converge is returned with its status, never retried.
pub fn identify_with_problem(
    problem: &mut TrajectoryProblem,
    solver_options: &OptionMap,
    initial_guess: Option<&DVector<f64>>,
) -> Result<(GainMatrix, CollocationOutcome), ConfigError> {
    problem.apply_options(solver_options)?;
    let initial_guess = initial_guess
        .cloned()
        .unwrap_or_else(|| DVector::zeros(problem.num_free()));

    let (solution, info) = problem.solve(&initial_guess)?;
    if info.is_success() {
        info!(
            status = info.status_code(),
            iterations = info.iterations,
            elapsed = ?info.elapsed,
            "collocation identification converged"
        );
    } else {
        warn!(
            status = info.status_code(),
            iterations = info.iterations,
            "collocation identification did not converge: {}",
            info.message
        );
    }

    let scale_factors = problem.scale_factors();
    let gains = extract_gains(&solution, &scale_factors)?;
    let outcome = CollocationOutcome {
        gains,
        scaled_gains: to_scaled(&gains, &scale_factors),
        solution,
        info,
    };
    Ok((gains, outcome))
}
