//! Error types for scan acquisition.
//!
//! This module provides one error type covering every failure mode of the
//! engine: timing negotiation, hardware I/O, continuous-mode rejection and
//! the active-state barrier.

use daq_core::error::{DaqError, DriverError, DriverErrorKind};
use thiserror::Error;

use crate::hal::ChannelKind;

/// Result type alias for scan operations.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Errors that can occur while scanning.
#[derive(Error, Debug, Clone)]
pub enum ScanError {
    /// No legal combination of sample periods was found for a dwell time
    #[error(
        "No legal sample period for dwell time {dwell_time:e} s with {channels} input \
         channel(s) after {attempts} attempt(s)"
    )]
    Negotiation {
        /// Requested dwell time in seconds
        dwell_time: f64,
        /// Simultaneous analog input channels
        channels: usize,
        /// Period combinations tried
        attempts: u32,
    },

    /// Requested period is above what the clock of this channel kind can produce
    #[error("Period {period:e} s exceeds maximum {max:e} s for {kind}")]
    PeriodOutOfRange {
        /// Channel kind whose clock was asked
        kind: ChannelKind,
        /// Requested period in seconds
        period: f64,
        /// Longest period the clock supports in seconds
        max: f64,
    },

    /// The hardware refused to run continuously at the requested rate
    #[error("Continuous acquisition rejected at {rate:.1} Hz: {message}")]
    ContinuousRejected {
        /// Requested position rate in Hz
        rate: f64,
        /// Reason given by the driver
        message: String,
    },

    /// I/O on a task that is already stopped (race with teardown)
    #[error("Task '{task}' is already stopped")]
    TaskStopped {
        /// Task name
        task: String,
    },

    /// Output buffer ran dry before the refill arrived
    #[error("Buffer underrun on task '{task}': data output too slow")]
    BufferUnderrun {
        /// Output task that ran dry
        task: String,
    },

    /// Read or write did not complete in time
    #[error("Timed out after {timeout_ms} ms on task '{task}'")]
    IoTimeout {
        /// Task name
        task: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Hardware error reported by the device
    #[error("Hardware error: {message}")]
    Hardware {
        /// Driver message
        message: String,
    },

    /// The scanning-active lines did not settle in time
    #[error("Active state not reached within {timeout_ms} ms")]
    ActiveStateTimeout {
        /// Barrier timeout that elapsed
        timeout_ms: u64,
    },

    /// Invalid configuration or parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong
        message: String,
    },

    /// A worker thread is gone (terminated or panicked)
    #[error("Worker '{name}' is not running")]
    WorkerGone {
        /// Thread name of the worker
        name: String,
    },
}

impl ScanError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Shorthand for a hardware error.
    pub fn hardware(message: impl Into<String>) -> Self {
        Self::Hardware {
            message: message.into(),
        }
    }

    /// Check if this is I/O on a task that was torn down concurrently.
    pub fn is_already_stopped(&self) -> bool {
        matches!(self, Self::TaskStopped { .. })
    }

    /// Check if this is one of the timeout errors.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::IoTimeout { .. } | Self::ActiveStateTimeout { .. }
        )
    }
}

impl From<ScanError> for DaqError {
    fn from(err: ScanError) -> Self {
        let kind = match &err {
            ScanError::Negotiation { .. }
            | ScanError::PeriodOutOfRange { .. }
            | ScanError::InvalidConfig { .. } => DriverErrorKind::Configuration,
            ScanError::ContinuousRejected { .. }
            | ScanError::BufferUnderrun { .. }
            | ScanError::Hardware { .. } => DriverErrorKind::Hardware,
            ScanError::IoTimeout { .. } | ScanError::ActiveStateTimeout { .. } => {
                DriverErrorKind::Timeout
            }
            ScanError::TaskStopped { .. } | ScanError::WorkerGone { .. } => {
                DriverErrorKind::Shutdown
            }
        };
        DaqError::Driver(DriverError::new("scan", kind, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::Negotiation {
            dwell_time: 1e-7,
            channels: 4,
            attempts: 5,
        };
        assert!(err.to_string().contains("4 input channel"));
        assert!(err.to_string().contains("5 attempt"));
    }

    #[test]
    fn test_timeout_is_distinct_from_hardware() {
        let timeout = ScanError::ActiveStateTimeout { timeout_ms: 1500 };
        assert!(timeout.is_timeout());
        assert!(!ScanError::hardware("boom").is_timeout());

        let daq: DaqError = timeout.into();
        assert_eq!(daq.driver_kind(), Some(DriverErrorKind::Timeout));
        let daq: DaqError = ScanError::hardware("boom").into();
        assert_eq!(daq.driver_kind(), Some(DriverErrorKind::Hardware));
    }

    #[test]
    fn test_already_stopped() {
        let err = ScanError::TaskStopped {
            task: "ai".to_string(),
        };
        assert!(err.is_already_stopped());
    }
}
