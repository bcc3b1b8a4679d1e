//! Subcommand implementations

pub mod cluster;
pub mod detectors;
pub mod stats;
