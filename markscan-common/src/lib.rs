//! Shared library for the markscan batch classification service
//!
//! Holds the pieces every markscan binary needs: the common error type,
//! configuration loading, and the live-channel event vocabulary.

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
