//! Anomaly-detection node: HTTP surface and configuration around the lifecycle manager

pub mod api;
pub mod config;
