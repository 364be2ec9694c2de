// stance_core/src/identification/mod.rs

//! The three ways of recovering controller gains from measured sway.

pub mod collocation;
pub mod direct;
pub mod shooting;

#[cfg(test)]
pub(crate) mod fixtures;
