//! Control Plane Module
//!
//! Host-side coordination above a single volume driver. Consistency groups
//! are bookkept here and fanned out to per-volume driver calls.

pub mod groups;

pub use groups::*;
