//! Shared types, error taxonomy, and clock abstraction for the sensitive-data
//! approval workflow engine.

#![deny(unsafe_code)]

pub mod clock;
pub mod error;
pub mod ids;
pub mod model;

pub use error::ApprovalError;
