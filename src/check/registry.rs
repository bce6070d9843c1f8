/// Check registry and dependency graph
///
/// The registry is an ordered sequence of check definitions; insertion
/// order is the display order used when results are emitted. Dependency
/// edges point at already-registered checks, so the graph is acyclic by
/// construction; `freeze` re-validates anyway before anything runs.
use crate::check::context::CheckContext;
use crate::check::failure::BodyResult;
use crate::check::steps::Step;
use crate::config::types::{GradeboxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reserved name of the staged-submission directory inside the run root.
/// No check may take this name: sandboxes are siblings of the sentinel.
pub const SUBMISSION_SENTINEL: &str = "_";

pub type NativeBody = dyn Fn(&mut CheckContext) -> BodyResult + Send + Sync;

/// Executable body of a check.
///
/// `Native` closures exist only in the process that registered them and
/// never cross the parent/child boundary. `Steps` and `Named` are the
/// serializable forms; they are the only bodies a dynamic check may
/// register at runtime.
#[derive(Clone)]
pub enum Body {
    Native(Arc<NativeBody>),
    Steps(Vec<Step>),
    Named(String),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Native(_) => f.write_str("Body::Native(..)"),
            Body::Steps(steps) => write!(f, "Body::Steps({} steps)", steps.len()),
            Body::Named(name) => write!(f, "Body::Named({name})"),
        }
    }
}

/// Serializable body form, used on the child/parent wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum WireBody {
    Steps { steps: Vec<Step> },
    Named { name: String },
}

impl From<WireBody> for Body {
    fn from(wire: WireBody) -> Self {
        match wire {
            WireBody::Steps { steps } => Body::Steps(steps),
            WireBody::Named { name } => Body::Named(name),
        }
    }
}

impl TryFrom<&Body> for WireBody {
    type Error = GradeboxError;

    fn try_from(body: &Body) -> Result<WireBody> {
        match body {
            Body::Steps(steps) => Ok(WireBody::Steps {
                steps: steps.clone(),
            }),
            Body::Named(name) => Ok(WireBody::Named { name: name.clone() }),
            Body::Native(_) => Err(GradeboxError::Package(
                "native check bodies cannot cross the process boundary".to_string(),
            )),
        }
    }
}

/// A registration produced at runtime by a dynamic check, carried back to
/// the parent inside the child's report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeRegistration {
    pub name: String,
    pub description: String,
    /// Defaults to the registering dynamic check when absent
    pub dependency: Option<String>,
    pub body: WireBody,
}

/// A named unit of assertion.
#[derive(Clone, Debug)]
pub struct CheckDef {
    /// Unique within the package
    pub name: String,
    /// Human-readable one-liner
    pub description: String,
    pub body: Body,
    /// Must name an already-registered check
    pub dependency: Option<String>,
    /// May this check register further checks at runtime?
    pub dynamic: bool,
    /// Set for checks created by a dynamic check (display grouping)
    pub parent: Option<String>,
}

impl CheckDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>, body: Body) -> Self {
        CheckDef {
            name: name.into(),
            description: description.into(),
            body,
            dependency: None,
            dynamic: false,
            parent: None,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependency = Some(dependency.into());
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    /// Mark this definition as a runtime child of a dynamic check.
    pub fn child_of(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// Ordered collection of checks plus their dependency edges.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    checks: Vec<CheckDef>,
    index: HashMap<String, usize>,
    frozen: bool,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a check at package-load time.
    ///
    /// Duplicate names, unresolved dependencies, and reserved names are
    /// fatal here, before anything runs.
    pub fn register(&mut self, def: CheckDef) -> Result<()> {
        if self.frozen {
            return Err(GradeboxError::Package(format!(
                "cannot register check {} after the registry is frozen",
                def.name
            )));
        }
        self.validate_def(&def)?;
        self.push(def);
        Ok(())
    }

    /// Merge runtime registrations into display order. Used by the runner
    /// once a dynamic check's report arrives: each definition is inserted
    /// after the parent named by its `parent` field and after any siblings
    /// already merged, keeping a dynamic check's children contiguous in
    /// invocation order.
    pub fn merge_runtime(&mut self, defs: Vec<CheckDef>) -> Result<()> {
        for def in defs {
            let parent = def
                .parent
                .clone()
                .ok_or_else(|| {
                    GradeboxError::Package(format!(
                        "runtime check {} carries no parent",
                        def.name
                    ))
                })?;
            let parent_idx = *self.index.get(&parent).ok_or_else(|| {
                GradeboxError::Package(format!("dynamic parent {parent} is not registered"))
            })?;
            self.validate_def(&def)?;
            let mut at = parent_idx + 1;
            while at < self.checks.len()
                && self.checks[at].parent.as_deref() == Some(parent.as_str())
            {
                at += 1;
            }
            self.checks.insert(at, def);
            self.reindex(at);
        }
        Ok(())
    }

    fn validate_def(&self, def: &CheckDef) -> Result<()> {
        if def.name.is_empty() || def.name == SUBMISSION_SENTINEL || def.name.contains('/') {
            return Err(GradeboxError::Package(format!(
                "invalid check name: {:?}",
                def.name
            )));
        }
        if self.index.contains_key(&def.name) {
            return Err(GradeboxError::Package(format!(
                "duplicate check name: {}",
                def.name
            )));
        }
        if let Some(dep) = &def.dependency {
            if !self.index.contains_key(dep) {
                return Err(GradeboxError::Package(format!(
                    "check {} depends on unknown check {dep}",
                    def.name
                )));
            }
        }
        if def.description.is_empty() {
            log::warn!("check {} has an empty description", def.name);
        }
        Ok(())
    }

    fn push(&mut self, def: CheckDef) {
        self.index.insert(def.name.clone(), self.checks.len());
        self.checks.push(def);
    }

    fn reindex(&mut self, from: usize) {
        for (i, check) in self.checks.iter().enumerate().skip(from) {
            self.index.insert(check.name.clone(), i);
        }
    }

    /// Bar further load-time registration and re-validate the graph.
    pub fn freeze(&mut self) -> Result<()> {
        self.scan_for_cycles()?;
        self.frozen = true;
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Acyclicity scan run at freeze time. Registration order makes
    /// cycles unconstructible through `register`, but definitions can be
    /// assembled wholesale in tests and future loaders.
    fn scan_for_cycles(&self) -> Result<()> {
        for start in &self.checks {
            let mut cursor = start.dependency.as_deref();
            let mut steps = 0usize;
            while let Some(dep) = cursor {
                if dep == start.name {
                    return Err(GradeboxError::Package(format!(
                        "dependency cycle involving check {}",
                        start.name
                    )));
                }
                steps += 1;
                if steps > self.checks.len() {
                    return Err(GradeboxError::Package(
                        "dependency cycle detected".to_string(),
                    ));
                }
                cursor = self
                    .index
                    .get(dep)
                    .and_then(|&i| self.checks[i].dependency.as_deref());
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CheckDef> {
        self.index.get(name).map(|&i| &self.checks[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Display order: registration order, dynamic children contiguous
    /// after their parent.
    pub fn display_order(&self) -> Vec<String> {
        self.checks.iter().map(|c| c.name.clone()).collect()
    }

    /// Checks with no dependency.
    pub fn roots(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.dependency.is_none())
            .map(|c| c.name.clone())
            .collect()
    }

    /// Direct-children map, computed (never stored on the check itself).
    pub fn children_map(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for check in &self.checks {
            if let Some(dep) = &check.dependency {
                map.entry(dep.clone()).or_default().push(check.name.clone());
            }
        }
        map
    }

    pub fn iter(&self) -> impl Iterator<Item = &CheckDef> {
        self.checks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps_def(name: &str) -> CheckDef {
        CheckDef::new(name, name, Body::Steps(vec![]))
    }

    #[test]
    fn test_duplicate_name_is_fatal() {
        let mut reg = Registry::new();
        reg.register(steps_def("exists")).unwrap();
        let err = reg.register(steps_def("exists")).unwrap_err();
        assert!(err.to_string().contains("duplicate check name"));
    }

    #[test]
    fn test_dependency_must_already_be_registered() {
        let mut reg = Registry::new();
        let err = reg
            .register(steps_def("a").depends_on("b"))
            .unwrap_err();
        assert!(err.to_string().contains("unknown check b"));
    }

    #[test]
    fn test_sentinel_name_rejected() {
        let mut reg = Registry::new();
        assert!(reg.register(steps_def("_")).is_err());
    }

    #[test]
    fn test_frozen_registry_rejects_registration() {
        let mut reg = Registry::new();
        reg.register(steps_def("a")).unwrap();
        reg.freeze().unwrap();
        assert!(reg.register(steps_def("b")).is_err());
    }

    #[test]
    fn test_children_map_and_roots() {
        let mut reg = Registry::new();
        reg.register(steps_def("a")).unwrap();
        reg.register(steps_def("b").depends_on("a")).unwrap();
        reg.register(steps_def("c").depends_on("a")).unwrap();

        assert_eq!(reg.roots(), vec!["a"]);
        assert_eq!(reg.children_map()["a"], vec!["b", "c"]);
    }

    #[test]
    fn test_merge_runtime_keeps_display_contiguity() {
        let mut reg = Registry::new();
        reg.register(steps_def("foo").dynamic()).unwrap();
        reg.register(steps_def("qux")).unwrap();
        reg.freeze().unwrap();

        reg.merge_runtime(vec![
            steps_def("bar").depends_on("foo").child_of("foo"),
            steps_def("baz").depends_on("foo").child_of("foo"),
        ])
        .unwrap();

        assert_eq!(reg.display_order(), vec!["foo", "bar", "baz", "qux"]);
        assert_eq!(reg.get("qux").unwrap().name, "qux");
    }

    #[test]
    fn test_merge_runtime_rejects_duplicates() {
        let mut reg = Registry::new();
        reg.register(steps_def("foo").dynamic()).unwrap();
        reg.register(steps_def("qux")).unwrap();
        let err = reg
            .merge_runtime(vec![steps_def("qux").child_of("foo")])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate check name"));
    }

    #[test]
    fn test_merge_runtime_requires_a_parent() {
        let mut reg = Registry::new();
        reg.register(steps_def("foo").dynamic()).unwrap();
        let err = reg.merge_runtime(vec![steps_def("bar")]).unwrap_err();
        assert!(err.to_string().contains("no parent"));
    }

    #[test]
    fn test_cycle_scan_catches_assembled_cycle() {
        // Bypass the ordered-registration guard by assembling directly.
        let mut reg = Registry::new();
        reg.push(steps_def("a").depends_on("b"));
        reg.push(steps_def("b").depends_on("a"));
        assert!(reg.freeze().is_err());
    }

    #[test]
    fn test_native_body_refuses_wire_conversion() {
        let body = Body::Native(Arc::new(|_ctx: &mut CheckContext| Ok(None)));
        assert!(WireBody::try_from(&body).is_err());
    }
}
