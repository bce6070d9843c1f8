/// Run root and per-check sandboxes
///
/// One run root per runner invocation, holding the staged submission
/// under the reserved sentinel `_` and one sandbox directory per check,
/// named by the check. Sandboxes are cloned from the dependency's
/// sandbox (or the sentinel for roots), never mutated after their owner
/// terminates, and retained until the run ends so dependents can clone
/// them. Run-root removal is unconditional on every exit path.
use crate::check::registry::SUBMISSION_SENTINEL;
use crate::config::types::{GradeboxError, Result};
use crate::utils::fsutil;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct RunRoot {
    run_id: String,
    dir: PathBuf,
}

impl RunRoot {
    /// Create the run root under the system temp directory.
    pub fn create() -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let dir = std::env::temp_dir().join(format!("gradebox-{run_id}"));
        fs::create_dir_all(&dir).map_err(|e| {
            GradeboxError::Stage(format!(
                "failed to create run root {}: {e}",
                dir.display()
            ))
        })?;
        Ok(RunRoot { run_id, dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn submission_dir(&self) -> PathBuf {
        self.dir.join(SUBMISSION_SENTINEL)
    }

    /// Stage the submitted files under the sentinel directory.
    pub fn stage(&self, files: &[PathBuf]) -> Result<()> {
        let staged = self.submission_dir();
        fs::create_dir_all(&staged).map_err(|e| {
            GradeboxError::Stage(format!("failed to create submission directory: {e}"))
        })?;
        for file in files {
            let name = file.file_name().ok_or_else(|| {
                GradeboxError::Stage(format!("cannot stage {}: no file name", file.display()))
            })?;
            if name == SUBMISSION_SENTINEL {
                return Err(GradeboxError::Stage(format!(
                    "submitted file name collides with the reserved run-root sentinel {SUBMISSION_SENTINEL:?}"
                )));
            }
            fsutil::copy_entry(file, &staged.join(name)).map_err(|e| {
                GradeboxError::Stage(format!("failed to stage {}: {e}", file.display()))
            })?;
        }
        Ok(())
    }

    /// Create the sandbox for a check by cloning its dependency's sandbox,
    /// or the staged submission when the check has no dependency.
    pub fn sandbox_for(&self, check: &str, dependency: Option<&str>) -> Result<PathBuf> {
        let source = match dependency {
            Some(dep) => self.dir.join(dep),
            None => self.submission_dir(),
        };
        let sandbox = self.dir.join(check);
        fsutil::copy_tree(&source, &sandbox).map_err(|e| {
            GradeboxError::Stage(format!(
                "failed to clone sandbox for check {check} from {}: {e}",
                source.display()
            ))
        })?;
        Ok(sandbox)
    }
}

impl Drop for RunRoot {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove run root {}: {e}", self.dir.display());
            }
        }
    }
}
