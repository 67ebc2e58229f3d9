//! Shared types for the gradient progressive-delivery controller

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::{Error, Result};
