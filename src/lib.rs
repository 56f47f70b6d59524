//! # Hall Probe DAQ
//!
//! Control software for a three-axis Hall probe field-mapping rig: a PM-series
//! (or SCL) stepper controller on one serial line drives x, y and z, and a
//! teslameter is sampled at every scan point.
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings` loaded with figment from TOML plus `HALLPROBE_*`
//!   environment overrides.
//! - **`error`**: the `DaqError` enum and its event tags.
//! - **`hardware`**: serial transport, controller protocol, the `Link`
//!   framing layer, typed `Axis` operations and the `Rig` aggregate, plus a
//!   simulated controller.
//! - **`experiment`**: scan plans, the path planner for raster, boundary,
//!   random, circular and on-the-fly modes, and the `ScanEngine` session
//!   state machine.
//! - **`data`**: record sinks (CSV, in-memory).
//! - **`measurement_types`**: field samples and measurement records.
//! - **`tracing_setup`**: subscriber installation.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod measurement_types;
pub mod tracing_setup;
