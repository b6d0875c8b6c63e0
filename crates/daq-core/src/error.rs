//! Custom error types shared by the scan engine crates.
//!
//! This module defines the primary error type, `DaqError`, for the whole workspace.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors that can occur, from configuration issues to
//! driver-level hardware problems.
//!
//! ## Error Hierarchy
//!
//! `DaqError` is an enum that consolidates various error sources:
//!
//! - **`Configuration`**: Semantic errors in the configuration, such as invalid
//!   values that pass parsing but are logically incorrect (e.g. a negative dwell time).
//! - **`Io`**: Wraps standard `std::io::Error`, covering file I/O issues.
//! - **`Driver`**: Structured errors coming from a hardware driver, tagged with a
//!   [`DriverErrorKind`] so callers can decide on a recovery strategy without
//!   matching on driver-specific enums.
//! - **`Processing`**: Errors that occur while reducing acquired data.
//! - **Size limits**: `FrameDimensionsTooLarge`, `FrameTooLarge`, `SizeOverflow`
//!   guard against unbounded image allocations.
//!
//! By using `#[from]`, `DaqError` can be seamlessly created from underlying error types,
//! simplifying error handling throughout the workspace with the `?` operator.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Shutdown,
    Hardware,
    Timeout,
    Permission,
    InvalidParameter,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Shutdown => "shutdown",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Permission => "permission",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the shared error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type shared across the workspace.
///
/// # Error Categories
///
/// 1. **Configuration Errors** - `Configuration`
///    - Occur during startup or when a setting is changed
///    - Recovery: fix the value and retry
///
/// 2. **Hardware Errors** - `Driver`
///    - Occur during acquisition
///    - The [`DriverErrorKind`] tells whether a retry makes sense
///
/// 3. **Runtime Errors** - `Processing` and the size-limit variants
///    - Occur while reducing or assembling frames
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Occurs when configuration values parse correctly but fail semantic validation
    /// (e.g., zero resolution, inverted voltage range, unknown log level).
    ///
    /// # Example
    ///
    /// ```rust
    /// use daq_core::error::DaqError;
    ///
    /// fn validate_dwell(dwell_s: f64) -> Result<(), DaqError> {
    ///     if dwell_s <= 0.0 {
    ///         return Err(DaqError::Configuration(
    ///             "dwell time must be positive".into()
    ///         ));
    ///     }
    ///     Ok(())
    /// }
    /// ```
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structured driver error with category
    #[error("{0}")]
    Driver(DriverError),

    /// Data processing operation failed.
    ///
    /// Occurs while reducing raw samples into images, for example when a
    /// chunk does not match the geometry it was declared for.
    #[error("Data processing error: {0}")]
    Processing(String),

    #[error("Frame dimensions {width}x{height} exceed maximum {max_dimension} per dimension")]
    FrameDimensionsTooLarge {
        width: u32,
        height: u32,
        max_dimension: u32,
    },

    #[error("Size overflow while computing {context}")]
    SizeOverflow { context: &'static str },

    #[error("Frame size {bytes} bytes exceeds maximum {max_bytes} bytes")]
    FrameTooLarge { bytes: usize, max_bytes: usize },

    /// Shutdown encountered errors.
    ///
    /// Contains every error collected while stopping worker threads and
    /// returning the hardware to a safe state.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Driver error category, if this error came from a driver.
    pub fn driver_kind(&self) -> Option<DriverErrorKind> {
        match self {
            DaqError::Driver(e) => Some(e.kind),
            _ => None,
        }
    }
}
