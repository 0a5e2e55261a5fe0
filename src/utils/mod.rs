//! Shared utilities

pub mod logger;
pub mod timer;
pub mod tracker;

pub use timer::Timer;
pub use tracker::{InFlight, InFlightGuard};
