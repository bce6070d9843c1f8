/// Failure taxonomy raised by check bodies
///
/// A body signals "the check did not verify" by returning a `Failure`,
/// which becomes a Fail result with rationale and help lifted from the
/// value. Everything else a body can go wrong with (internal faults,
/// panics) is classified as Error: a runner/author fault, not a student
/// fault.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A typed assertion failure.
///
/// The specializations carry their structural fields so renderers can
/// format them richly; `Display` gives the canonical one-line rationale.
#[derive(Error, Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// Generic failure with a free-form rationale
    #[error("{rationale}")]
    Generic {
        rationale: String,
        help: Option<String>,
    },

    /// Expected one string, observed another
    #[error("expected \"{expected}\", not \"{actual}\"")]
    Mismatch {
        expected: String,
        actual: String,
        help: Option<String>,
    },

    /// An item was not found within a larger output
    #[error("did not find \"{item}\" in \"{collection}\"")]
    Missing {
        item: String,
        collection: String,
        help: Option<String>,
    },
}

impl Failure {
    pub fn new(rationale: impl Into<String>) -> Self {
        Failure::Generic {
            rationale: rationale.into(),
            help: None,
        }
    }

    pub fn mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Failure::Mismatch {
            expected: expected.into(),
            actual: actual.into(),
            help: None,
        }
    }

    pub fn missing(item: impl Into<String>, collection: impl Into<String>) -> Self {
        Failure::Missing {
            item: item.into(),
            collection: collection.into(),
            help: None,
        }
    }

    /// Attach author-provided help text.
    pub fn with_help(mut self, text: impl Into<String>) -> Self {
        match &mut self {
            Failure::Generic { help, .. }
            | Failure::Mismatch { help, .. }
            | Failure::Missing { help, .. } => *help = Some(text.into()),
        }
        self
    }

    /// Canonical one-line rationale.
    pub fn rationale(&self) -> String {
        self.to_string()
    }

    pub fn help(&self) -> Option<&str> {
        match self {
            Failure::Generic { help, .. }
            | Failure::Mismatch { help, .. }
            | Failure::Missing { help, .. } => help.as_deref(),
        }
    }
}

/// What a body (or a lifecycle hook) can raise.
///
/// `Failure` converts the result to Fail; `Internal` to Error. Panics are
/// caught separately in the child frame and land as Error too.
#[derive(Debug)]
pub enum BodyError {
    Failure(Failure),
    Internal(String),
}

impl From<Failure> for BodyError {
    fn from(f: Failure) -> Self {
        BodyError::Failure(f)
    }
}

/// What a body returns: an optional passthrough value for dependents.
pub type BodyResult = std::result::Result<Option<serde_json::Value>, BodyError>;
