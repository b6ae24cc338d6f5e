//! The user-facing lazy dataframe API.
//!
//! [`Session`] carries configuration and runtime handles; [`SArray`] and
//! [`SFrame`] wrap plan tips and compose lazily. Materializing calls run
//! the plan through the engine and rewrite the tip in place, so a handle
//! that has been evaluated once reads like stored data afterwards.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sfq_client::{Session, SArray};
//! use sfq_common::{Cell, CellType, EngineConfig};
//!
//! let session = Session::new(EngineConfig::default());
//! let xs = SArray::from_cells(
//!     session.clone(),
//!     (0..100).map(Cell::Integer).collect(),
//!     CellType::Integer,
//! )?;
//! let doubled = xs.apply(
//!     Arc::new(|row: &[Cell]| Ok(Cell::Integer(row[0].as_integer().unwrap() * 2))),
//!     CellType::Integer,
//! )?;
//! assert_eq!(doubled.sum()?, Cell::Integer(9900));
//! # sfq_common::Result::Ok(())
//! ```

mod sarray;
mod session;
mod sframe;

pub use sarray::SArray;
pub use session::{Session, SharedSession};
pub use sframe::SFrame;

pub use sfq_common::{Cell, CellType, EngineConfig, Result, SfqError};
pub use sfq_engine::{
    CountReducer, InProcessLambdaChannel, LambdaChannel, MaterializeOptions, MinReducer,
    ReduceFunction, SumReducer,
};
