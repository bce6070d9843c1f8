//! Check model
//!
//! Failure taxonomy, check definitions and registry, the per-check
//! author surface, lifecycle hooks, and declarative step bodies.

pub mod context;
pub mod failure;
pub mod hooks;
pub mod registry;
pub mod steps;
