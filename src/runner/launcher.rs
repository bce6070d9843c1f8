/// Child execution units
///
/// Every check runs in its own OS child process. Fork-style children
/// inherit the loaded package and write their report to a pipe;
/// spawn-style children re-exec the current binary with a hidden
/// internal role, rebuild the package from its source, and exchange
/// request/report JSON over stdin/stdout. Either way the parent sees one
/// sealed message per check on the result channel.
use crate::check::context::CheckContext;
use crate::check::failure::{BodyError, BodyResult};
use crate::check::registry::{Body, RuntimeRegistration, WireBody};
use crate::check::steps::execute_steps;
use crate::config::types::{GradeboxError, Result, StartMethod};
use crate::package::{CheckPackage, PackageSource};
use crate::runner::result::CheckStatus;
use crossbeam_channel::Sender;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

/// Everything a child needs to run one check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildRequest {
    pub check: String,
    pub dynamic: bool,
    pub sandbox: PathBuf,
    pub passthrough: Option<Value>,
    /// Body for runtime-registered checks, which a reloaded package
    /// cannot know about
    pub body_override: Option<WireBody>,
    pub source: PackageSource,
}

/// The sealed outcome a child sends back. Name and description are added
/// by the parent, which already knows them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChildReport {
    pub status: CheckStatus,
    pub rationale: Option<String>,
    pub help: Option<String>,
    pub log: Vec<String>,
    pub data: serde_json::Map<String, Value>,
    pub passthrough: Option<Value>,
    pub registered: Vec<RuntimeRegistration>,
}

impl ChildReport {
    fn error(message: String) -> Self {
        ChildReport {
            status: CheckStatus::Error,
            rationale: Some(message.clone()),
            help: None,
            log: vec![message],
            data: serde_json::Map::new(),
            passthrough: None,
            registered: Vec::new(),
        }
    }
}

/// One message on the parent's result channel. The inner error covers
/// plumbing faults: a child that died without producing a report.
pub struct SealedMessage {
    pub check: String,
    pub report: std::result::Result<ChildReport, String>,
}

/// A launched child, kept only so an aborted run can kill it.
pub enum ChildHandle {
    Forked(Pid),
    Spawned(u32),
}

impl ChildHandle {
    pub fn kill(&self) {
        let pid = match self {
            ChildHandle::Forked(pid) => *pid,
            ChildHandle::Spawned(id) => Pid::from_raw(*id as i32),
        };
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                log::warn!("failed to kill child {pid}: {e}");
            }
        }
    }
}

/// Start a child for `request` with the configured start method. The
/// report arrives on `tx` from a per-child reader thread.
pub fn launch(
    method: StartMethod,
    package: &Arc<CheckPackage>,
    request: ChildRequest,
    tx: &Sender<SealedMessage>,
) -> Result<ChildHandle> {
    match method {
        StartMethod::Fork => fork_check(package, request, tx).map(ChildHandle::Forked),
        StartMethod::Spawn => spawn_check(request, tx).map(ChildHandle::Spawned),
    }
}

fn fork_check(
    package: &Arc<CheckPackage>,
    request: ChildRequest,
    tx: &Sender<SealedMessage>,
) -> Result<Pid> {
    use nix::unistd::{fork, ForkResult};

    let (read_fd, write_fd) = nix::unistd::pipe()
        .map_err(|e| GradeboxError::Process(format!("failed to create result pipe: {e}")))?;

    // The child touches only its own request and exits; it never returns
    // into the scheduler.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(read_fd);
            let report = match std::env::set_current_dir(&request.sandbox) {
                Ok(()) => execute_check(package, &request),
                Err(e) => ChildReport::error(format!(
                    "failed to enter sandbox {}: {e}",
                    request.sandbox.display()
                )),
            };
            let mut file = std::fs::File::from(write_fd);
            let code = match serde_json::to_writer(&mut file, &report) {
                Ok(()) => 0,
                Err(_) => 70,
            };
            std::process::exit(code);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(write_fd);
            let tx = tx.clone();
            let check = request.check;
            let mut file = std::fs::File::from(read_fd);
            std::thread::spawn(move || {
                use std::io::Read;

                let mut raw = Vec::new();
                let read = file.read_to_end(&mut raw);
                let _ = nix::sys::wait::waitpid(child, None);
                let report = match read {
                    Ok(_) => serde_json::from_slice::<ChildReport>(&raw)
                        .map_err(|e| format!("check process produced no valid report: {e}")),
                    Err(e) => Err(format!("failed to read check report: {e}")),
                };
                let _ = tx.send(SealedMessage { check, report });
            });
            Ok(child)
        }
        Err(e) => Err(GradeboxError::Process(format!("fork failed: {e}"))),
    }
}

fn spawn_check(request: ChildRequest, tx: &Sender<SealedMessage>) -> Result<u32> {
    let exe = std::env::current_exe()
        .map_err(|e| GradeboxError::Process(format!("cannot locate own binary: {e}")))?;
    let mut child = Command::new(exe)
        .arg("--internal-role")
        .arg("check")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| GradeboxError::Process(format!("failed to spawn check process: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| GradeboxError::Process("child stdin unavailable".to_string()))?;
    serde_json::to_writer(&mut stdin, &request)
        .map_err(|e| GradeboxError::Process(format!("failed to send child request: {e}")))?;
    drop(stdin);

    let pid = child.id();
    let tx = tx.clone();
    let check = request.check;
    std::thread::spawn(move || {
        let report = match child.wait_with_output() {
            Ok(output) => serde_json::from_slice::<ChildReport>(&output.stdout)
                .map_err(|e| format!("check process produced no valid report: {e}")),
            Err(e) => Err(format!("failed to wait for check process: {e}")),
        };
        let _ = tx.send(SealedMessage { check, report });
    });
    Ok(pid)
}

/// Entry point for the hidden `--internal-role check` path: the
/// spawn-style child. Reads the request from stdin, rebuilds the package
/// (package load must be idempotent), and writes the report to stdout.
pub fn child_role_main() -> Result<()> {
    let request: ChildRequest = serde_json::from_reader(std::io::stdin().lock())
        .map_err(|e| GradeboxError::Process(format!("malformed child request: {e}")))?;

    let report = match crate::package::reload(&request.source) {
        Ok(package) => match std::env::set_current_dir(&request.sandbox) {
            Ok(()) => execute_check(&package, &request),
            Err(e) => ChildReport::error(format!(
                "failed to enter sandbox {}: {e}",
                request.sandbox.display()
            )),
        },
        Err(e) => ChildReport::error(format!("failed to reload check package: {e}")),
    };

    serde_json::to_writer(std::io::stdout().lock(), &report)
        .map_err(|e| GradeboxError::Process(format!("failed to write report: {e}")))
}

/// The child frame: hooks around the body, panic containment, outcome
/// classification, report sealing.
pub fn execute_check(package: &CheckPackage, request: &ChildRequest) -> ChildReport {
    let mut ctx = CheckContext::new(
        &request.check,
        request.dynamic,
        request.sandbox.clone(),
        package.resources().map(|p| p.to_path_buf()),
        request.passthrough.clone(),
    );

    let body = match resolve_body(package, request) {
        Ok(body) => body,
        Err(message) => return ChildReport::error(message),
    };

    let started = Instant::now();
    let outcome = run_framed(package, &body, &mut ctx);

    // after_check hooks are drained even when the body failed; resources
    // acquired by the body still need releasing. A hook error can only
    // downgrade a Pass, never mask an existing Fail or Error.
    let mut after_check_error = None;
    while let Some(hook) = ctx.pop_after_check() {
        if let Err(e) = hook() {
            after_check_error = Some(e);
            break;
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    let outcome = match (outcome, after_check_error) {
        (Ok(value), None) => Ok(value),
        (Ok(_), Some(hook_error)) => Err(hook_error),
        (failed, _) => failed,
    };

    let (status, rationale, help, passthrough) = match outcome {
        Ok(value) => {
            ctx.data("time", (elapsed * 1000.0).round() / 1000.0);
            (CheckStatus::Pass, None, None, value)
        }
        Err(BodyError::Failure(f)) => (
            CheckStatus::Fail,
            Some(f.rationale()),
            f.help().map(str::to_string),
            None,
        ),
        Err(BodyError::Internal(message)) => {
            ctx.log(&message);
            (CheckStatus::Error, Some(message), None, None)
        }
    };

    ChildReport {
        status,
        rationale,
        help,
        log: ctx.take_log(),
        data: ctx.take_data(),
        passthrough,
        registered: ctx.take_registrations(),
    }
}

fn resolve_body(package: &CheckPackage, request: &ChildRequest) -> std::result::Result<Body, String> {
    if let Some(wire) = &request.body_override {
        return Ok(Body::from(wire.clone()));
    }
    package
        .registry()
        .get(&request.check)
        .map(|def| def.body.clone())
        .ok_or_else(|| format!("check {} is not in the package registry", request.check))
}

/// before_every hooks, then the body, then after_every hooks; the
/// after hooks are skipped when anything before them raised.
fn run_framed(package: &CheckPackage, body: &Body, ctx: &mut CheckContext) -> BodyResult {
    package.hooks().run_before()?;
    let value = call_body(package, body, ctx)?;
    package.hooks().run_after()?;
    Ok(value)
}

fn call_body(package: &CheckPackage, body: &Body, ctx: &mut CheckContext) -> BodyResult {
    let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| match body {
        Body::Native(f) => f(ctx),
        Body::Steps(steps) => execute_steps(steps, ctx),
        Body::Named(name) => match package.body(name) {
            Some(f) => f(ctx),
            None => Err(BodyError::Internal(format!(
                "package has no body named {name}"
            ))),
        },
    }));
    match invoked {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            Err(BodyError::Internal(format!("check panicked: {message}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::failure::Failure;
    use crate::check::registry::{CheckDef, RuntimeRegistration};
    use crate::package::PackageBuilder;

    fn build_package(defs: Vec<CheckDef>) -> CheckPackage {
        let mut builder = PackageBuilder::new();
        for def in defs {
            builder.check(def).unwrap();
        }
        builder.build("test").unwrap()
    }

    fn request_for(name: &str, dynamic: bool, sandbox: &std::path::Path) -> ChildRequest {
        ChildRequest {
            check: name.to_string(),
            dynamic,
            sandbox: sandbox.to_path_buf(),
            passthrough: None,
            body_override: None,
            source: PackageSource::Loader {
                name: "test".to_string(),
            },
        }
    }

    #[test]
    fn test_pass_records_timing_and_passthrough() {
        let sandbox = tempfile::tempdir().unwrap();
        let package = build_package(vec![CheckDef::new(
            "a",
            "a",
            Body::Native(Arc::new(|_ctx| Ok(Some(Value::from(42))))),
        )]);

        let report = execute_check(&package, &request_for("a", false, sandbox.path()));
        assert_eq!(report.status, CheckStatus::Pass);
        assert_eq!(report.passthrough, Some(Value::from(42)));
        assert!(report.data.contains_key("time"));
    }

    #[test]
    fn test_failure_lifts_rationale_and_help() {
        let sandbox = tempfile::tempdir().unwrap();
        let package = build_package(vec![CheckDef::new(
            "a",
            "a",
            Body::Native(Arc::new(|_ctx| {
                Err(Failure::new("nope").with_help("try again").into())
            })),
        )]);

        let report = execute_check(&package, &request_for("a", false, sandbox.path()));
        assert_eq!(report.status, CheckStatus::Fail);
        assert_eq!(report.rationale.as_deref(), Some("nope"));
        assert_eq!(report.help.as_deref(), Some("try again"));
    }

    #[test]
    fn test_panic_becomes_error_with_logged_payload() {
        let sandbox = tempfile::tempdir().unwrap();
        let package = build_package(vec![CheckDef::new(
            "a",
            "a",
            Body::Native(Arc::new(|_ctx| panic!("index out of bounds"))),
        )]);

        let report = execute_check(&package, &request_for("a", false, sandbox.path()));
        assert_eq!(report.status, CheckStatus::Error);
        assert!(report.rationale.unwrap().contains("index out of bounds"));
        assert!(report.log.iter().any(|l| l.contains("index out of bounds")));
    }

    #[test]
    fn test_static_registration_yields_fixed_diagnostic() {
        let sandbox = tempfile::tempdir().unwrap();
        let package = build_package(vec![CheckDef::new(
            "s",
            "s",
            Body::Native(Arc::new(|ctx| {
                ctx.register_check(RuntimeRegistration {
                    name: "child".to_string(),
                    description: "child".to_string(),
                    dependency: None,
                    body: WireBody::Steps { steps: vec![] },
                })?;
                Ok(None)
            })),
        )]);

        let report = execute_check(&package, &request_for("s", false, sandbox.path()));
        assert_eq!(report.status, CheckStatus::Error);
        assert_eq!(
            report.rationale.as_deref(),
            Some("static check s cannot create other checks, please mark it as dynamic")
        );
    }

    #[test]
    fn test_dynamic_registrations_ride_the_report() {
        let sandbox = tempfile::tempdir().unwrap();
        let package = build_package(vec![CheckDef::new(
            "foo",
            "foo",
            Body::Native(Arc::new(|ctx| {
                for name in ["bar", "baz"] {
                    ctx.register_check(RuntimeRegistration {
                        name: name.to_string(),
                        description: name.to_string(),
                        dependency: None,
                        body: WireBody::Steps { steps: vec![] },
                    })?;
                }
                Ok(None)
            })),
        )
        .dynamic()]);

        let report = execute_check(&package, &request_for("foo", true, sandbox.path()));
        assert_eq!(report.status, CheckStatus::Pass);
        let names: Vec<_> = report.registered.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "baz"]);
    }

    #[test]
    fn test_body_override_takes_precedence() {
        let sandbox = tempfile::tempdir().unwrap();
        let package = build_package(vec![]);

        let mut request = request_for("runtime_child", false, sandbox.path());
        request.body_override = Some(WireBody::Steps { steps: vec![] });

        let report = execute_check(&package, &request);
        assert_eq!(report.status, CheckStatus::Pass);
    }

    #[test]
    fn test_unknown_check_is_error() {
        let sandbox = tempfile::tempdir().unwrap();
        let package = build_package(vec![]);
        let report = execute_check(&package, &request_for("ghost", false, sandbox.path()));
        assert_eq!(report.status, CheckStatus::Error);
    }
}
