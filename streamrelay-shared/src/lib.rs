#![cfg_attr(not(test), forbid(unsafe_code))]
#![cfg_attr(test, allow(unsafe_code))]

//! Shared configuration and domain models for streamrelay.

pub mod config;
pub mod models;
