//! Layered configuration library.
//!
//! This module exports the configuration engine for the `layerconf` binary
//! and for embedding applications.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
