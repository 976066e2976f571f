//! Shared domain types for Switchboard.
//!
//! Everything in this crate is provider-, transport-, and storage-agnostic:
//! the error type, identifier generator, configuration tree, the
//! provider-facing message/tool shapes, and the capability traits the
//! runtime components depend on.

pub mod capability;
pub mod config;
pub mod error;
pub mod ident;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
