//! Definitions shared across modules: the crate error type and well-known names found in
//! lowered code and referenced by generated code.

pub mod consts;
pub mod error;

pub use error::{Error, Result};
