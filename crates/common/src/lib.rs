//! Common utilities and types shared across tqbundle crates.

pub mod error;
pub mod hash;

pub use error::{Error, Result};
