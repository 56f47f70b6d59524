//! Measurement data types produced by a scan.
//!
//! A [`FieldSample`] is what the field sensor returns; a [`MeasurementRecord`]
//! ties one sample to the time and place it was taken. Records are immutable
//! once created and are what the record sink persists.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Averaged field reading.
///
/// The documented value order, used by [`FieldSample::from_values`] and
/// [`FieldSample::to_values`], is:
/// `bx, by, bz, std(bx), std(by), std(bz), T, std(T)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSample {
    /// Field components (bx, by, bz)
    pub b: [f64; 3],
    /// Standard deviation of each component
    pub b_std: [f64; 3],
    /// Probe temperature, 0 if the sensor has none
    pub temperature: f64,
    /// Standard deviation of the temperature
    pub temperature_std: f64,
}

impl FieldSample {
    /// Build from the eight values in documented order.
    pub fn from_values(v: [f64; 8]) -> Self {
        Self {
            b: [v[0], v[1], v[2]],
            b_std: [v[3], v[4], v[5]],
            temperature: v[6],
            temperature_std: v[7],
        }
    }

    /// The eight values in documented order.
    pub fn to_values(&self) -> [f64; 8] {
        [
            self.b[0],
            self.b[1],
            self.b[2],
            self.b_std[0],
            self.b_std[1],
            self.b_std[2],
            self.temperature,
            self.temperature_std,
        ]
    }
}

/// One measured point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Local wall-clock time of the sample
    pub timestamp: DateTime<Local>,
    /// Stage position (x, y, z). Read-back for stop-and-measure points,
    /// nominal trigger position for on-the-fly points.
    pub position: [f64; 3],
    /// Angle on the circle for circular scans
    pub theta: Option<f64>,
    /// Field reading
    pub field: FieldSample,
}

impl MeasurementRecord {
    /// Record stamped with the current time.
    pub fn now(position: [f64; 3], theta: Option<f64>, field: FieldSample) -> Self {
        Self {
            timestamp: Local::now(),
            position,
            theta,
            field,
        }
    }

    /// Position formatted for display, 3 decimals.
    pub fn position_text(&self) -> String {
        let [x, y, z] = self.position;
        match self.theta {
            Some(theta) => format!("theta={theta:.4} x={x:.3} y={y:.3} z={z:.3}"),
            None => format!("x={x:.3} y={y:.3} z={z:.3}"),
        }
    }

    /// Field formatted for display.
    pub fn field_text(&self) -> String {
        let [bx, by, bz] = self.field.b;
        format!("bx={bx:.5} by={by:.5} bz={bz:.5} T={:.2}", self.field.temperature)
    }
}
