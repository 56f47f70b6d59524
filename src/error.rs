//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it gives one consistent place for everything that
//! can go wrong, from configuration and serial I/O up to scan-session faults.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment extraction failures and semantic
//!   validation failures of the loaded settings.
//! - **`Io`**: wraps `std::io::Error` from the serial channel and the record sink.
//! - **`Protocol`**: the controller and this process disagree about the exchange
//!   (wrong echo, sustained non-OK status, unparseable reply). Hardware state is
//!   unknown afterwards.
//! - **`OutOfBounds`**, **`HardLimitHit`**, **`MotionTimeout`**, **`PulseTimeout`**,
//!   **`MissedTrigger`**: motion faults. All of them end a scan session.
//! - **`SessionBusy`** / **`ResetRequired`**: the scan engine refuses a new session.
//!
//! Callers branch on [`DaqError::kind`] rather than on message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error on axis {axis}: {detail} (response: {response:?})")]
    Protocol {
        axis: String,
        detail: String,
        response: Vec<String>,
    },

    #[error("Requested range {min:.3}..{max:.3} on axis {axis} is outside soft limits {lower:.3}..{upper:.3}")]
    OutOfBounds {
        axis: String,
        min: f64,
        max: f64,
        lower: f64,
        upper: f64,
    },

    #[error("Axis {axis} is at a hard limit switch")]
    HardLimitHit { axis: String },

    #[error("Timed out after {timeout:?} waiting for axis {axis} to reach {target:.3}")]
    MotionTimeout {
        axis: String,
        target: f64,
        timeout: Duration,
    },

    #[error("Timed out after {timeout:?} waiting for a trigger pulse on axis {axis}, port {port}")]
    PulseTimeout {
        axis: String,
        port: u8,
        timeout: Duration,
    },

    #[error("Missed trigger on axis {axis}: nominal {nominal:.3} already passed (position {position:.3})")]
    MissedTrigger {
        axis: String,
        nominal: f64,
        position: f64,
    },

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Invalid scan plan: {0}")]
    InvalidPlan(String),

    #[error("Unknown axis '{0}'")]
    UnknownAxis(String),

    #[error("A scan session is already active")]
    SessionBusy,

    #[error("Axes must be reset after a fault before starting a new session")]
    ResetRequired,

    #[error("Field sensor error: {0}")]
    Sensor(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serial port not connected")]
    SerialPortNotConnected,

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

/// Tag carried by error events so that callers never match on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    Config,
    Io,
    Protocol,
    OutOfBounds,
    HardLimitHit,
    MotionTimeout,
    PulseTimeout,
    MissedTrigger,
    OutOfRange,
    InvalidPlan,
    UnknownAxis,
    SessionBusy,
    ResetRequired,
    Sensor,
    Storage,
    Serial,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorKind::Config => "config",
            ErrorKind::Io => "io",
            ErrorKind::Protocol => "protocol",
            ErrorKind::OutOfBounds => "out_of_bounds",
            ErrorKind::HardLimitHit => "hard_limit_hit",
            ErrorKind::MotionTimeout => "motion_timeout",
            ErrorKind::PulseTimeout => "pulse_timeout",
            ErrorKind::MissedTrigger => "missed_trigger",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::InvalidPlan => "invalid_plan",
            ErrorKind::UnknownAxis => "unknown_axis",
            ErrorKind::SessionBusy => "session_busy",
            ErrorKind::ResetRequired => "reset_required",
            ErrorKind::Sensor => "sensor",
            ErrorKind::Storage => "storage",
            ErrorKind::Serial => "serial",
        };
        f.write_str(tag)
    }
}

impl DaqError {
    /// Error-kind tag for structured error events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Config(_) | DaqError::Configuration(_) => ErrorKind::Config,
            DaqError::Io(_) => ErrorKind::Io,
            DaqError::Protocol { .. } => ErrorKind::Protocol,
            DaqError::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            DaqError::HardLimitHit { .. } => ErrorKind::HardLimitHit,
            DaqError::MotionTimeout { .. } => ErrorKind::MotionTimeout,
            DaqError::PulseTimeout { .. } => ErrorKind::PulseTimeout,
            DaqError::MissedTrigger { .. } => ErrorKind::MissedTrigger,
            DaqError::OutOfRange(_) => ErrorKind::OutOfRange,
            DaqError::InvalidPlan(_) => ErrorKind::InvalidPlan,
            DaqError::UnknownAxis(_) => ErrorKind::UnknownAxis,
            DaqError::SessionBusy => ErrorKind::SessionBusy,
            DaqError::ResetRequired => ErrorKind::ResetRequired,
            DaqError::Sensor(_) => ErrorKind::Sensor,
            DaqError::Storage(_) => ErrorKind::Storage,
            DaqError::SerialPortNotConnected | DaqError::SerialFeatureDisabled => {
                ErrorKind::Serial
            }
        }
    }

    /// Faults after which the axes must be reset before another session may start.
    ///
    /// A pre-flight `OutOfBounds` issues no motion and therefore does not count.
    pub fn requires_reset(&self) -> bool {
        matches!(
            self,
            DaqError::Protocol { .. }
                | DaqError::HardLimitHit { .. }
                | DaqError::MotionTimeout { .. }
                | DaqError::PulseTimeout { .. }
                | DaqError::MissedTrigger { .. }
        )
    }

    pub(crate) fn protocol(
        axis: impl Into<String>,
        detail: impl Into<String>,
        response: Vec<String>,
    ) -> Self {
        DaqError::Protocol {
            axis: axis.into(),
            detail: detail.into(),
            response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        let err = DaqError::MissedTrigger {
            axis: "x".into(),
            nominal: 1.0,
            position: 1.2,
        };
        assert_eq!(err.kind(), ErrorKind::MissedTrigger);
        assert_eq!(err.kind().to_string(), "missed_trigger");
        assert_eq!(DaqError::SerialFeatureDisabled.kind(), ErrorKind::Serial);
    }

    #[test]
    fn test_requires_reset() {
        assert!(DaqError::HardLimitHit { axis: "z".into() }.requires_reset());
        assert!(DaqError::protocol("x", "bad echo", vec![]).requires_reset());
        let oob = DaqError::OutOfBounds {
            axis: "y".into(),
            min: 0.0,
            max: 500.0,
            lower: -100.0,
            upper: 100.0,
        };
        assert!(!oob.requires_reset());
        assert!(!DaqError::SessionBusy.requires_reset());
    }

    #[test]
    fn test_display_messages() {
        let err = DaqError::MotionTimeout {
            axis: "x".into(),
            target: 12.5,
            timeout: Duration::from_secs(3),
        };
        let msg = err.to_string();
        assert!(msg.contains("axis x"));
        assert!(msg.contains("12.500"));

        let io: DaqError = std::io::Error::new(std::io::ErrorKind::TimedOut, "late").into();
        assert_eq!(io.kind(), ErrorKind::Io);
    }
}
