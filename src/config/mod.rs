//! Configuration and shared types
//!
//! Central error enum, result alias, and runner configuration.

pub mod types;
