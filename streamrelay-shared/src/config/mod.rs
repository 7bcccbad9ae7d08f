//! # Configuration
//!
//! Runtime configuration for the relay server: file formats, environment
//! overrides and validation.

pub mod server;
