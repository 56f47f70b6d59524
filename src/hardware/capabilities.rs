//! Hardware capabilities consumed by the scan engine.
//!
//! The engine does not know which teslameter is attached. It needs one thing
//! from the sensor side: an averaged field reading on demand. That capability
//! is the [`FieldSampler`] trait.
//!
//! Like the other capability traits in this crate it:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! # Example
//!
//! ```rust,ignore
//! struct ConstantProbe;
//!
//! #[async_trait]
//! impl FieldSampler for ConstantProbe {
//!     async fn sample(&self, averages: u32) -> Result<FieldSample> {
//!         Ok(FieldSample::from_values([1.0, 0.0, 0.0, 0.01, 0.01, 0.01, 21.5, 0.1]))
//!     }
//! }
//! ```

use crate::measurement_types::FieldSample;
use anyhow::Result;
use async_trait::async_trait;

/// Capability: averaged magnetic field readings.
///
/// # Contract
/// - `averages` is at least 1; the implementation averages that many readings
/// - Components are returned in the fixed order documented on [`FieldSample`]
/// - No unit conversion is assumed by the caller
/// - Sensors without a thermometer report temperature and its deviation as 0
#[async_trait]
pub trait FieldSampler: Send + Sync {
    /// Take `averages` readings and return their mean and standard deviation.
    async fn sample(&self, averages: u32) -> Result<FieldSample>;

    /// Short sensor description for logs and file headers.
    fn describe(&self) -> String {
        "field sensor".to_string()
    }
}
