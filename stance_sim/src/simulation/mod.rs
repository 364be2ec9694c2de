// stance_sim/src/simulation/mod.rs

pub mod config;
pub mod core;
pub mod data_generator;
pub mod report;
pub mod runner;
