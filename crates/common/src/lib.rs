#![deny(missing_docs)]

//! Shared configuration, error types, cell values, and runtime handles for
//! SFQ crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides the common [`SfqError`] / [`Result`] contracts
//! - hosts the universal [`Cell`] value type every column is made of
//! - owns the process-wide query lock and cancel flag handles

/// The universal cell value and its type tags.
pub mod cell;
/// Shared engine configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Query lock, cancel flag, and segment defaults.
pub mod runtime;

pub use cell::{Cell, CellType, ImageBlob};
pub use config::EngineConfig;
pub use error::{Result, SfqError};
pub use runtime::{CancelFlag, QueryRuntime};
