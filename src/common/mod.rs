//! Common utilities and types

pub mod error;

pub use error::{Error, Result};
