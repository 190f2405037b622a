//! HTTP handlers

pub mod health;
pub mod shield;
pub mod status;
pub mod telemetry;
