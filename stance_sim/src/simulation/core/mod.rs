// stance_sim/src/simulation/core/mod.rs

pub mod error;
pub mod logging;
pub mod prng;
