//! Domain layer - Host-facing model and port definitions
//!
//! This module defines the descriptors exchanged with the host orchestrator
//! and the core traits (ports) that backend families implement.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
