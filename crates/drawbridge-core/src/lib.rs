//! Core types, config, errors, and wire protocol for Drawbridge.

pub mod config;
pub mod element;
pub mod error;
pub mod protocol;
