//! Check runner
//!
//! Run root and sandboxes, child execution units, the dependency-ordered
//! scheduler, and the sealed result record.

pub mod launcher;
pub mod result;
pub mod sandbox;
pub mod scheduler;
