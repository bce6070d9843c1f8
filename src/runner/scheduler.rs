/// Dependency-ordered, parallel check dispatch
///
/// The runner stages the submission, validates the frozen registry,
/// then drives the graph: every ready check starts in its own child
/// execution unit, results arrive on a crossbeam channel in completion
/// order, skips are synthesized for dependents of non-passing checks,
/// and runtime registrations from dynamic checks are merged and
/// scheduled as they arrive. Emission order is display order (registry
/// insertion order, dynamic children contiguous after their parent) no
/// matter how completion interleaved.
use crate::check::registry::{Body, CheckDef, Registry, RuntimeRegistration, WireBody};
use crate::config::types::{GradeboxError, Result, RunnerConfig};
use crate::package::CheckPackage;
use crate::runner::launcher::{self, ChildHandle, ChildRequest, SealedMessage};
use crate::runner::result::{CheckResult, CheckStatus};
use crate::runner::sandbox::RunRoot;
use crossbeam_channel::{Receiver, Sender};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Runner {
    package: Arc<CheckPackage>,
    config: RunnerConfig,
}

struct RunState {
    registry: Registry,
    children: HashMap<String, Vec<String>>,
    ready: VecDeque<String>,
    in_flight: HashMap<String, ChildHandle>,
    results: HashMap<String, CheckResult>,
    /// Names registered at runtime; their bodies must ride the request
    /// because a reloaded package cannot know them
    runtime_checks: HashSet<String>,
}

impl Runner {
    pub fn new(package: CheckPackage, config: RunnerConfig) -> Self {
        Runner {
            package: Arc::new(package),
            config,
        }
    }

    /// Execute the whole package against the submitted files.
    ///
    /// Returns results in display order. Fatal faults (staging, process
    /// plumbing, invalid runtime registrations) abort the run: in-flight
    /// children are killed, no partial results are emitted, and the run
    /// root is removed either way.
    pub fn run(&self, files: &[PathBuf]) -> Result<Vec<CheckResult>> {
        let registry = self.package.registry();
        if !registry.is_frozen() {
            return Err(GradeboxError::Package(
                "registry must be frozen before running".to_string(),
            ));
        }
        if self.config.max_parallel == Some(0) {
            return Err(GradeboxError::Config(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        let root = RunRoot::create()?;
        root.stage(files)?;
        log::info!(
            "run {} started: {} checks, {:?} start method",
            root.run_id(),
            registry.len(),
            self.config.start_method
        );

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut state = RunState {
            registry: registry.clone(),
            children: registry.children_map(),
            ready: registry.roots().into(),
            in_flight: HashMap::new(),
            results: HashMap::new(),
            runtime_checks: HashSet::new(),
        };

        let outcome = self.drive(&root, &mut state, &tx, &rx);
        if outcome.is_err() {
            for handle in state.in_flight.values() {
                handle.kill();
            }
        }
        outcome?;

        // Display order over the final registry, runtime children included.
        let mut ordered = Vec::with_capacity(state.registry.len());
        for name in state.registry.display_order() {
            let result = state.results.remove(&name).ok_or_else(|| {
                GradeboxError::Process(format!("check {name} produced no result"))
            })?;
            ordered.push(result);
        }
        Ok(ordered)
    }

    fn drive(
        &self,
        root: &RunRoot,
        state: &mut RunState,
        tx: &Sender<SealedMessage>,
        rx: &Receiver<SealedMessage>,
    ) -> Result<()> {
        while !state.ready.is_empty() || !state.in_flight.is_empty() {
            while self.may_launch(state.in_flight.len()) {
                let Some(name) = state.ready.pop_front() else {
                    break;
                };
                self.start_check(root, state, tx, name)?;
            }

            let message = rx
                .recv()
                .map_err(|e| GradeboxError::Channel(format!("result channel closed: {e}")))?;
            state.in_flight.remove(&message.check);
            self.seal(state, message)?;
        }
        Ok(())
    }

    fn may_launch(&self, in_flight: usize) -> bool {
        self.config.max_parallel.map_or(true, |limit| in_flight < limit)
    }

    fn start_check(
        &self,
        root: &RunRoot,
        state: &mut RunState,
        tx: &Sender<SealedMessage>,
        name: String,
    ) -> Result<()> {
        let def = state
            .registry
            .get(&name)
            .cloned()
            .ok_or_else(|| GradeboxError::Process(format!("unknown ready check {name}")))?;

        let sandbox = root.sandbox_for(&name, def.dependency.as_deref())?;
        let passthrough = def
            .dependency
            .as_deref()
            .and_then(|dep| state.results.get(dep))
            .and_then(|result| result.passthrough.clone());
        let body_override = if state.runtime_checks.contains(&name) {
            Some(WireBody::try_from(&def.body)?)
        } else {
            None
        };

        let request = ChildRequest {
            check: name.clone(),
            dynamic: def.dynamic,
            sandbox,
            passthrough,
            body_override,
            source: self.package.source().clone(),
        };
        log::debug!("starting check {name}");
        let handle = launcher::launch(self.config.start_method, &self.package, request, tx)?;
        state.in_flight.insert(name, handle);
        Ok(())
    }

    /// Record one completed check: merge its runtime registrations, seal
    /// its result, then gate its children.
    fn seal(&self, state: &mut RunState, message: SealedMessage) -> Result<()> {
        let def = state
            .registry
            .get(&message.check)
            .cloned()
            .ok_or_else(|| {
                GradeboxError::Process(format!("result for unknown check {}", message.check))
            })?;

        let result = match message.report {
            Ok(report) => {
                self.merge_registrations(state, &def.name, report.registered.clone())?;
                CheckResult {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    status: report.status,
                    rationale: report.rationale,
                    help: report.help,
                    log: report.log,
                    data: report.data,
                    cause_name: None,
                    passthrough: report.passthrough,
                }
            }
            Err(plumbing) => {
                log::error!("check {} died without a report: {plumbing}", def.name);
                CheckResult {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    status: CheckStatus::Error,
                    rationale: Some(plumbing.clone()),
                    help: None,
                    log: vec![plumbing],
                    data: serde_json::Map::new(),
                    cause_name: None,
                    passthrough: None,
                }
            }
        };

        let passed = result.status == CheckStatus::Pass;
        state.results.insert(def.name.clone(), result);

        let dependents = state.children.get(&def.name).cloned().unwrap_or_default();
        if passed {
            state.ready.extend(dependents);
        } else {
            for dependent in dependents {
                synthesize_skips(state, &dependent, &def.name);
            }
        }
        Ok(())
    }

    /// Merge checks a dynamic check registered at runtime. Duplicate
    /// names and unresolved dependencies are fatal, matching the
    /// load-time rules.
    fn merge_registrations(
        &self,
        state: &mut RunState,
        parent: &str,
        registered: Vec<RuntimeRegistration>,
    ) -> Result<()> {
        if registered.is_empty() {
            return Ok(());
        }
        let mut defs = Vec::with_capacity(registered.len());
        for registration in registered {
            let dependency = registration
                .dependency
                .unwrap_or_else(|| parent.to_string());
            state.runtime_checks.insert(registration.name.clone());
            defs.push(CheckDef {
                name: registration.name,
                description: registration.description,
                body: Body::from(registration.body),
                dependency: Some(dependency),
                dynamic: false,
                parent: Some(parent.to_string()),
            });
        }
        state.registry.merge_runtime(defs)?;
        state.children = state.registry.children_map();
        Ok(())
    }
}

/// Recursively record Skip results for the dependents of a non-passing
/// check. The cause is always the direct dependency's result.
fn synthesize_skips(state: &mut RunState, name: &str, cause: &str) {
    let Some(def) = state.registry.get(name) else {
        return;
    };
    let Some(cause_result) = state.results.get(cause) else {
        return;
    };
    let skip = CheckResult::skipped(&def.name, &def.description, cause_result);
    state.results.insert(name.to_string(), skip);

    for dependent in state.children.get(name).cloned().unwrap_or_default() {
        synthesize_skips(state, &dependent, name);
    }
}
