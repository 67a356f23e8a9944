//! Shared building blocks for the acroxy gateway crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
