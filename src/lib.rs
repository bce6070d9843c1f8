//! gradebox: a dependency-ordered, sandboxed check runner for grading
//! student programming submissions
//!
//! Given a check package (author-written assertions) and a set of
//! submitted files, gradebox executes each check in an isolated
//! filesystem sandbox inside its own OS child process, records
//! pass/fail/skip/error, and emits an ordered list of sealed results.
//!
//! # Architecture
//!
//! ## Check Model ([`check`])
//! - [`check::failure`]: typed failure taxonomy raised by check bodies
//! - [`check::registry`]: check definitions, ordered registry, dependency graph
//! - [`check::context`]: per-check author surface (log, data, run, hidden, ...)
//! - [`check::hooks`]: before-every / after-every lifecycle registries
//! - [`check::steps`]: declarative step bodies and name normalization
//!
//! ## Packages ([`package`])
//! - native packages via the process-global loader table
//! - declarative JSON packages (check name → ordered steps)
//!
//! ## Runner ([`runner`])
//! - [`runner::sandbox`]: run root, submission staging, sandbox cloning
//! - [`runner::launcher`]: fork-style and spawn-style child execution units
//! - [`runner::scheduler`]: dependency-ordered parallel dispatch
//! - [`runner::result`]: the sealed, serializable outcome record
//!
//! ## Configuration & Utilities
//! - [`config::types`]: shared types and the central error enum
//! - [`utils::fsutil`]: recursive sandbox copies, digests
//!
//! # Design Principles
//!
//! 1. **The graph gates execution** - dependents start only after their
//!    dependency passed; everything downstream of a non-pass is skipped
//! 2. **Sandboxes are lineage** - each check's directory is cloned from
//!    its dependency's, never shared, never mutated after sealing
//! 3. **Results are sealed once** - created in the child, immutable in
//!    the parent
//! 4. **Failure is typed** - assertion failures are values a narrow
//!    frame classifies; everything else is a runner fault, not a
//!    student fault

// Check model
pub mod check;

// Configuration & shared types
pub mod config;

// Check packages
pub mod package;

// Execution
pub mod runner;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the gradebox binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use check::failure::{BodyError, BodyResult, Failure};
pub use check::registry::{Body, CheckDef, Registry};
pub use config::types::{GradeboxError, Result, RunnerConfig, StartMethod};
pub use runner::result::{CheckResult, CheckStatus};
pub use runner::scheduler::Runner;
