//! `courier-core` : domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod lifecycle;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use lifecycle::Lifecycle;
