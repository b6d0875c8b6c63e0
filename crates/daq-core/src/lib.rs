//! `daq-core`
//!
//! Shared types for the scan acquisition workspace.
//!
//! This crate provides the pieces every other crate in the workspace agrees on:
//! the error taxonomy used at crate boundaries and the hard limits that keep
//! image allocations bounded.
//!
//! ## Key Types
//!
//! - [`DaqError`](error::DaqError): workspace-wide error type
//! - [`DriverError`](error::DriverError) / [`DriverErrorKind`](error::DriverErrorKind):
//!   structured hardware errors with a recovery category
//! - [`validate_frame_size`](limits::validate_frame_size): checked image sizing

pub mod error;
pub mod limits;

pub use error::{AppResult, DaqError, DriverError, DriverErrorKind};
