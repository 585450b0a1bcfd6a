//! Acquisition Configuration Module
//!
//! Links, channels, poll/storage intervals and buffer sizes loaded from TOML.
//!
//! ## Loading Order
//!
//! 1. `MODBUS_DAQ_CONFIG` environment variable (path to TOML file)
//! 2. `modbus_daq.toml` in the current working directory
//! 3. Built-in defaults (no links, no channels)
//!
//! The loaded config is passed explicitly to `AcquisitionEngine::new`;
//! there is no process-wide config instance.

mod daq_config;
pub mod defaults;
pub mod validation;

pub use daq_config::*;
