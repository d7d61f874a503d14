//! Site-blocking policy daemon: rules, schedules and overrides in, a
//! reconciled table of interception directives out.

pub mod api;
pub mod compiler;
pub mod directives;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod model;
pub mod pin;
pub mod schedule;
pub mod store;

pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{PolicyError, Result};
