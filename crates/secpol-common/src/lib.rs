//! # secpol-common
//!
//! Shared types for the secpol policy compiler.
//!
//! This crate provides functionality used across all secpol crates:
//! - The error taxonomy of a compilation run
//! - Error categories used to report failures uniformly

#![warn(missing_docs)]

pub mod error;

pub use error::{ErrorCategory, PolicyError, PolicyResult};
