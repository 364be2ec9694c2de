// stance_core/src/prelude.rs

// --- Core Abstractions ---
pub use crate::models::ClosedLoopModel;
pub use crate::utils::integrators::{Integrator, IntegratorKind};

// --- Core Data Structures ---
pub use crate::error::{ConfigError, IdentificationError, IntegrationError};
pub use crate::types::{GainMatrix, Signal, State, StateTrajectory, Symbol, NUM_GAINS, NUM_STATES};

// --- Models ---
pub use crate::models::closed_loop::ClosedLoopOde;
pub use crate::models::quiet_standing::{BodyParameters, QuietStandingModel};

// --- Identification ---
pub use crate::identification::collocation::{CollocationOutcome, GainGuess, InitialGuess, StateGuess};
pub use crate::identification::direct::{DirectIdentifier, LeastSquaresFit};
pub use crate::identification::shooting::{ShootingIdentifier, ShootingObjective, ShootingOptions, ShootingOutcome};
pub use crate::nlp::{DirectCollocation, IntegrationMethod, OptionMap, OptionValue, SolveInfo, SolverStatus};
pub use crate::optimize::{Method, MinimizeResult};
pub use crate::trajectory::{GainBounds, TrajectoryProblem};
