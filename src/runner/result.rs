/// Sealed check results
///
/// A result is created inside the child execution unit, sealed when the
/// body exits or fails, transferred to the runner over the result
/// channel, and immutable afterwards. Serialization follows the external
/// schema: `{name, description, status, rationale, help, log, data,
/// cause_name?}`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CheckStatus {
    Pass,
    Fail,
    Skip,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub description: String,
    pub status: CheckStatus,
    pub rationale: Option<String>,
    pub help: Option<String>,
    pub log: Vec<String>,
    pub data: serde_json::Map<String, Value>,
    /// Name of the causing dependency result when status is Skip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause_name: Option<String>,
    /// Runner-internal forwarding state; not part of the external schema
    #[serde(skip)]
    pub passthrough: Option<Value>,
}

impl CheckResult {
    /// Synthesize a Skip for a dependent of a non-passing check. The log
    /// stays empty; nothing ran.
    pub fn skipped(name: &str, description: &str, cause: &CheckResult) -> Self {
        CheckResult {
            name: name.to_string(),
            description: description.to_string(),
            status: CheckStatus::Skip,
            rationale: Some(format!("can't check until {} passes", cause.name)),
            help: None,
            log: Vec::new(),
            data: serde_json::Map::new(),
            cause_name: Some(cause.name.clone()),
            passthrough: None,
        }
    }
}
