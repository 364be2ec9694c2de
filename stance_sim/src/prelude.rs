// stance_sim/src/prelude.rs

// Re-export the entire stance_core prelude so binaries get the model and
// identifier types from one place.
pub use stance_core::prelude::*;

// Re-export common simulation-specific types.
pub use crate::cli::Cli;
pub use crate::simulation::config::{IdentifierConfig, ScenarioConfig};
pub use crate::simulation::core::error::SimError;
pub use crate::simulation::core::prng::SimulationRng;
pub use crate::simulation::data_generator::{DataGenerator, Dataset, NoiseLevels};
pub use crate::simulation::report::{Convergence, GainsReport};
pub use crate::simulation::runner::{run_path, run_scenario};
