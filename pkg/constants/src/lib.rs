//! Centralized constants for the KATO gateway.
//!
//! All project-wide constant values live here.
//! Change a value in one place and it applies everywhere.

pub mod annotations;
pub mod network;
pub mod paths;
pub mod state;
