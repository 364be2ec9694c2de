// stance_core/src/nlp/mod.rs

//! Sparse nonlinear programming for direct collocation problems.

mod augmented_lagrangian;
pub mod collocation;
pub mod linalg;
pub mod options;
pub mod status;

pub use collocation::{
    CollocationSetup, DirectCollocation, GradientFn, IntegrationMethod, IntervalBlocks, ObjectiveFn,
};
pub use options::{LinearSolver, OptionMap, OptionValue, SolverOptions};
pub use status::{SolveInfo, SolverStatus};
