/// Per-check author surface
///
/// A `CheckContext` is constructed fresh inside every child execution
/// unit and never outlives the check it serves; nothing in it is shared
/// across checks. It carries the log, the payload data, the sandbox
/// working directory, the forwarded passthrough state, and the
/// registration surface for dynamic checks and one-shot hooks.
use crate::check::failure::{BodyError, BodyResult, Failure};
use crate::check::registry::RuntimeRegistration;
use crate::utils::fsutil;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Cap on collected program output, applied after collection.
const OUTPUT_LIMIT: usize = 1024 * 1024;

pub type AfterCheckHook = Box<dyn FnOnce() -> std::result::Result<(), BodyError> + Send>;

pub struct CheckContext {
    check_name: String,
    dynamic: bool,
    cwd: PathBuf,
    resources: Option<PathBuf>,
    passthrough: Option<Value>,
    log: Vec<String>,
    data: serde_json::Map<String, Value>,
    registered: Vec<RuntimeRegistration>,
    after_check: VecDeque<AfterCheckHook>,
}

impl CheckContext {
    pub fn new(
        check_name: impl Into<String>,
        dynamic: bool,
        cwd: PathBuf,
        resources: Option<PathBuf>,
        passthrough: Option<Value>,
    ) -> Self {
        CheckContext {
            check_name: check_name.into(),
            dynamic,
            cwd,
            resources,
            passthrough,
            log: Vec::new(),
            data: serde_json::Map::new(),
            registered: Vec::new(),
            after_check: VecDeque::new(),
        }
    }

    pub fn check_name(&self) -> &str {
        &self.check_name
    }

    /// The check's sandbox directory (also the child's working directory).
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Passthrough state returned by the dependency, if any.
    pub fn passthrough(&self) -> Option<&Value> {
        self.passthrough.as_ref()
    }

    /// Append a line to the check's log. Embedded newlines are escaped so
    /// each entry stays one logical line.
    pub fn log(&mut self, line: impl AsRef<str>) {
        let escaped = line.as_ref().replace('\r', "\\r").replace('\n', "\\n");
        self.log.push(escaped);
    }

    /// Merge a key/value fact into the check's payload data.
    pub fn data(&mut self, key: impl Into<String>, value: impl Serialize) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.data.insert(key.into(), v);
            }
            Err(e) => log::warn!("dropping non-serializable data value: {e}"),
        }
    }

    /// Copy paths from the package's resource directory into the sandbox.
    pub fn include(&mut self, paths: &[&str]) -> std::result::Result<(), BodyError> {
        let resources = self.resources.clone().ok_or_else(|| {
            BodyError::Internal("check package has no resources directory".to_string())
        })?;
        for path in paths {
            let src = resources.join(path);
            let file_name = src.file_name().ok_or_else(|| {
                BodyError::Internal(format!("invalid resource path: {path}"))
            })?;
            let dst = self.cwd.join(file_name);
            fsutil::copy_entry(&src, &dst).map_err(|e| {
                BodyError::Internal(format!("failed to include resource {path}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Assert that all paths exist in the sandbox.
    pub fn exists(&self, paths: &[&str]) -> std::result::Result<(), BodyError> {
        for path in paths {
            if std::fs::symlink_metadata(self.cwd.join(path)).is_err() {
                return Err(Failure::new(format!("{path} not found")).into());
            }
        }
        Ok(())
    }

    /// SHA-256 hex digest of a sandbox file.
    pub fn hash(&self, path: &str) -> std::result::Result<String, BodyError> {
        let full = self.cwd.join(path);
        if std::fs::symlink_metadata(&full).is_err() {
            return Err(Failure::new(format!("{path} not found")).into());
        }
        fsutil::sha256_file(&full)
            .map_err(|e| BodyError::Internal(format!("failed to hash {path}: {e}")))
    }

    /// Run a sub-check whose internal signals must not leak to students.
    /// Any Failure inside discards the log gathered so far and substitutes
    /// the given rationale.
    pub fn hidden<F>(&mut self, rationale: &str, f: F) -> BodyResult
    where
        F: FnOnce(&mut CheckContext) -> BodyResult,
    {
        match f(self) {
            Err(BodyError::Failure(_)) => {
                self.log.clear();
                Err(Failure::new(rationale).into())
            }
            other => other,
        }
    }

    /// Register a further check at runtime. Only dynamic checks may do
    /// this; the diagnostic for static checks is fixed and load-bearing
    /// for callers that match on it.
    pub fn register_check(
        &mut self,
        registration: RuntimeRegistration,
    ) -> std::result::Result<(), BodyError> {
        if !self.dynamic {
            return Err(BodyError::Internal(format!(
                "static check {} cannot create other checks, please mark it as dynamic",
                self.check_name
            )));
        }
        self.registered.push(registration);
        Ok(())
    }

    /// Register a one-shot hook drained at the end of this check only.
    pub fn after_check(&mut self, hook: AfterCheckHook) {
        self.after_check.push_back(hook);
    }

    /// Spawn a command line inside the sandbox.
    pub fn run(&mut self, cmdline: &str) -> std::result::Result<Program, BodyError> {
        self.log(format!("running {cmdline}..."));
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmdline)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| BodyError::Internal(format!("failed to run {cmdline}: {e}")))?;
        Ok(Program {
            cmdline: cmdline.to_string(),
            child: Some(child),
            collected: None,
        })
    }

    pub(crate) fn take_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }

    pub(crate) fn take_data(&mut self) -> serde_json::Map<String, Value> {
        std::mem::take(&mut self.data)
    }

    pub(crate) fn take_registrations(&mut self) -> Vec<RuntimeRegistration> {
        std::mem::take(&mut self.registered)
    }

    pub(crate) fn pop_after_check(&mut self) -> Option<AfterCheckHook> {
        self.after_check.pop_front()
    }
}

/// A program spawned by `CheckContext::run`, with assertion helpers the
/// declarative step bodies compile onto.
pub struct Program {
    cmdline: String,
    child: Option<Child>,
    collected: Option<(String, Option<i32>)>,
}

impl Program {
    /// Send input to the program's standard input without expecting a
    /// prompt. A trailing newline is appended when absent.
    pub fn stdin(
        &mut self,
        ctx: &mut CheckContext,
        input: &str,
    ) -> std::result::Result<(), BodyError> {
        use std::io::Write;

        ctx.log(format!("sending input {input}..."));
        let child = self.child.as_mut().ok_or_else(|| {
            BodyError::Internal(format!("{} already finished", self.cmdline))
        })?;
        let mut handle = child.stdin.take().ok_or_else(|| {
            BodyError::Internal(format!("stdin of {} already consumed", self.cmdline))
        })?;
        let mut payload = input.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        // Written off-thread: a program that never reads its input would
        // otherwise block the check once the pipe fills. A dead child
        // gives EPIPE; let the exit assertion report it.
        std::thread::spawn(move || {
            let _ = handle.write_all(payload.as_bytes());
        });
        Ok(())
    }

    /// Assert a literal (non-regex) substring match on standard output.
    pub fn stdout_contains(
        &mut self,
        ctx: &mut CheckContext,
        needle: &str,
    ) -> std::result::Result<(), BodyError> {
        ctx.log(format!("checking for output \"{needle}\"..."));
        let (stdout, _) = self.collect()?;
        if !stdout.contains(needle) {
            return Err(Failure::missing(needle, stdout.trim_end()).into());
        }
        Ok(())
    }

    /// Wait for the program to exit. With `Some(code)`, assert the exact
    /// exit code; with `None`, only wait.
    pub fn exit(
        &mut self,
        ctx: &mut CheckContext,
        expected: Option<i32>,
    ) -> std::result::Result<(), BodyError> {
        if let Some(code) = expected {
            ctx.log(format!("checking that program exited with status {code}..."));
        }
        let (_, actual) = self.collect()?;
        if let Some(code) = expected {
            match actual {
                Some(actual) if actual == code => {}
                Some(actual) => {
                    return Err(
                        Failure::new(format!("expected exit code {code}, not {actual}")).into(),
                    )
                }
                None => {
                    return Err(Failure::new(format!(
                        "expected exit code {code}, but program was terminated by a signal"
                    ))
                    .into())
                }
            }
        }
        Ok(())
    }

    /// Collect output and exit status once; later assertions reuse it.
    fn collect(&mut self) -> std::result::Result<(String, Option<i32>), BodyError> {
        if let Some((stdout, code)) = &self.collected {
            return Ok((stdout.clone(), *code));
        }
        let child = self.child.take().ok_or_else(|| {
            BodyError::Internal(format!("{} already finished", self.cmdline))
        })?;
        let output = child.wait_with_output().map_err(|e| {
            BodyError::Internal(format!("failed to wait for {}: {e}", self.cmdline))
        })?;
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.len() > OUTPUT_LIMIT {
            stdout.truncate(OUTPUT_LIMIT);
        }
        let code = output.status.code();
        self.collected = Some((stdout.clone(), code));
        Ok((stdout, code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_in(dir: &Path) -> CheckContext {
        CheckContext::new("t", false, dir.to_path_buf(), None, None)
    }

    #[test]
    fn test_log_escapes_newlines() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        ctx.log("two\nlines");
        assert_eq!(ctx.take_log(), vec!["two\\nlines"]);
    }

    #[test]
    fn test_exists_failure_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx_in(dir.path());
        match ctx.exists(&["hello.c"]) {
            Err(BodyError::Failure(f)) => assert_eq!(f.rationale(), "hello.c not found"),
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn test_include_copies_resource_into_sandbox() {
        let resources = tempfile::tempdir().unwrap();
        std::fs::write(resources.path().join("input.txt"), b"fixture").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = CheckContext::new(
            "t",
            false,
            dir.path().to_path_buf(),
            Some(resources.path().to_path_buf()),
            None,
        );
        ctx.include(&["input.txt"]).unwrap();
        assert_eq!(std::fs::read(dir.path().join("input.txt")).unwrap(), b"fixture");
    }

    #[test]
    fn test_include_without_resources_is_internal_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        match ctx.include(&["input.txt"]) {
            Err(BodyError::Internal(msg)) => assert!(msg.contains("resources")),
            other => panic!("expected an internal error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_hash_of_known_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let ctx = ctx_in(dir.path());
        assert_eq!(
            ctx.hash("f").unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hidden_discards_log_and_substitutes_rationale() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        let result = ctx.hidden("check failed", |ctx| {
            ctx.log("secret detail");
            Err(Failure::mismatch("a", "b").into())
        });
        match result {
            Err(BodyError::Failure(f)) => assert_eq!(f.rationale(), "check failed"),
            other => panic!("expected a failure, got {:?}", other.is_ok()),
        }
        assert!(ctx.take_log().is_empty());
    }

    #[test]
    fn test_hidden_passes_success_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());
        let result = ctx.hidden("check failed", |ctx| {
            ctx.log("kept");
            Ok(None)
        });
        assert!(result.is_ok());
        assert_eq!(ctx.take_log(), vec!["kept"]);
    }

    #[test]
    fn test_static_check_cannot_register() {
        use crate::check::registry::{RuntimeRegistration, WireBody};

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = CheckContext::new("s", false, dir.path().to_path_buf(), None, None);
        let err = ctx
            .register_check(RuntimeRegistration {
                name: "child".to_string(),
                description: "child".to_string(),
                dependency: None,
                body: WireBody::Steps { steps: vec![] },
            })
            .unwrap_err();
        match err {
            BodyError::Internal(msg) => assert_eq!(
                msg,
                "static check s cannot create other checks, please mark it as dynamic"
            ),
            BodyError::Failure(_) => panic!("must be an internal error"),
        }
    }

    #[test]
    fn test_run_and_assertions() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());

        let mut program = ctx.run("echo hello").unwrap();
        program.stdout_contains(&mut ctx, "hello").unwrap();
        program.exit(&mut ctx, Some(0)).unwrap();

        let log = ctx.take_log();
        assert_eq!(
            log,
            vec![
                "running echo hello...",
                "checking for output \"hello\"...",
                "checking that program exited with status 0...",
            ]
        );
    }

    #[test]
    fn test_stdin_feeds_program() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());

        let mut program = ctx.run("cat").unwrap();
        program.stdin(&mut ctx, "meow").unwrap();
        program.stdout_contains(&mut ctx, "meow").unwrap();
        program.exit(&mut ctx, Some(0)).unwrap();
    }

    #[test]
    fn test_stdin_write_does_not_block_on_full_pipe() {
        use std::time::{Duration, Instant};

        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());

        // Well past the kernel pipe buffer, sent to a program that never
        // reads its input.
        let mut program = ctx.run("sleep 2").unwrap();
        let payload = "x".repeat(1 << 20);
        let started = Instant::now();
        program.stdin(&mut ctx, &payload).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        program.exit(&mut ctx, Some(0)).unwrap();
    }

    #[test]
    fn test_exit_code_mismatch_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(dir.path());

        let mut program = ctx.run("exit 3").unwrap();
        match program.exit(&mut ctx, Some(0)) {
            Err(BodyError::Failure(f)) => {
                assert_eq!(f.rationale(), "expected exit code 0, not 3")
            }
            other => panic!("expected a failure, got {:?}", other.is_ok()),
        }
    }
}
