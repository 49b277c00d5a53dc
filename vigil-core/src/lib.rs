//! Core shared library for the Vigil policy engine.
//!
//! This crate exposes the reusable primitives the evaluation engine
//! depends on: the canonical error type, configuration loading, database
//! pool and migrations, and logging setup.

pub mod config;
pub mod db;
pub mod errors;
pub mod logging;

pub use errors::{Result as CoreResult, VigilError};
