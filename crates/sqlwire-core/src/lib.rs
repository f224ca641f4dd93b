//! Core types for sqlwire.
//!
//! This crate provides the driver-independent pieces shared by the
//! protocol crates:
//!
//! - `Error` and its per-kind payloads
//! - `Row` and `ColumnInfo` for text-protocol result sets

pub mod error;
pub mod row;

pub use error::{Error, Result, ServerError};
pub use row::{ColumnInfo, Row};
