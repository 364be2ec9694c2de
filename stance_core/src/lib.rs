// stance_core/src/lib.rs

pub mod error;
pub mod identification;
pub mod models;
pub mod nlp;
pub mod optimize;
pub mod prelude;
pub mod scaling;
pub mod trajectory;
pub mod types;
pub mod utils;
