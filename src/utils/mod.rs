//! Utilities

pub mod fsutil;
