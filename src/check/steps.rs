/// Declarative step bodies
///
/// The simpler, declarative package format maps a check name to an
/// ordered list of steps; each step spawns one command line and chains
/// the recognized assertions onto it. Steps are fully serializable, which
/// also makes them one of the two body forms a dynamic check may register
/// at runtime.
use crate::check::context::CheckContext;
use crate::check::failure::{BodyError, BodyResult};
use crate::config::types::{GradeboxError, Result};
use serde::{Deserialize, Serialize};

/// Stdin payload: a single string, or a sequence joined by newlines.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StdinSpec {
    Line(String),
    Lines(Vec<String>),
}

impl StdinSpec {
    fn joined(&self) -> String {
        match self {
            StdinSpec::Line(s) => s.clone(),
            StdinSpec::Lines(lines) => lines.join("\n"),
        }
    }
}

/// One declarative step.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Command line to spawn
    pub run: String,
    /// Input sent without expecting a prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<StdinSpec>,
    /// Literal (non-regex) substring asserted on standard output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Exact exit code; when absent the step still waits for exit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<i32>,
}

impl Step {
    /// Execute this step inside the check's sandbox.
    pub fn execute(&self, ctx: &mut CheckContext) -> std::result::Result<(), BodyError> {
        let mut program = ctx.run(&self.run)?;
        if let Some(stdin) = &self.stdin {
            program.stdin(ctx, &stdin.joined())?;
        }
        if let Some(needle) = &self.stdout {
            program.stdout_contains(ctx, needle)?;
        }
        // An absent `exit` key still appends an unconditional exit wait.
        program.exit(ctx, self.exit)?;
        Ok(())
    }
}

/// Execute an ordered list of steps as a check body.
pub fn execute_steps(steps: &[Step], ctx: &mut CheckContext) -> BodyResult {
    for step in steps {
        step.execute(ctx)?;
    }
    Ok(None)
}

/// Normalize a declarative check name to the identifier grammar.
///
/// Spaces and hyphens become underscores; a leading digit gains an
/// underscore prefix; anything else outside `[A-Za-z0-9_]` is rejected.
pub fn normalize_check_name(raw: &str) -> Result<String> {
    let mut name: String = raw
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();
    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c == '_' || c.is_ascii_alphanumeric())
        && !name.chars().next().is_some_and(|c| c.is_ascii_digit());
    if !valid {
        return Err(GradeboxError::Package(format!(
            "invalid check name: {raw:?}"
        )));
    }
    Ok(name)
}
