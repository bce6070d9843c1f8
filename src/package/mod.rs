//! Check packages
//!
//! A package is the loadable unit handed to the runner: a frozen
//! registry, a table of named native bodies, package-level hooks, and an
//! optional resources directory. Two sources exist: native packages
//! registered through the process-global loader table (authors link
//! against this crate), and declarative JSON documents. Loading must be
//! idempotent because spawn-style children rebuild the package from the
//! same source.

use crate::check::hooks::{HookSet, SharedHook};
use crate::check::registry::{Body, CheckDef, NativeBody, Registry};
use crate::check::steps::{normalize_check_name, Step};
use crate::config::types::{GradeboxError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

/// Conventional resources directory name next to a declarative document.
const RESOURCES_DIR: &str = "resources";

/// How a package can be rebuilt in a spawn-style child.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PackageSource {
    Declarative { path: PathBuf },
    Loader { name: String },
}

pub struct CheckPackage {
    name: String,
    registry: Registry,
    body_table: HashMap<String, Arc<NativeBody>>,
    resources: Option<PathBuf>,
    hooks: HookSet,
    source: PackageSource,
}

impl CheckPackage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn body(&self, name: &str) -> Option<Arc<NativeBody>> {
        self.body_table.get(name).cloned()
    }

    pub fn resources(&self) -> Option<&Path> {
        self.resources.as_deref()
    }

    pub fn hooks(&self) -> &HookSet {
        &self.hooks
    }

    pub fn source(&self) -> &PackageSource {
        &self.source
    }
}

/// Builder handed to native package loaders.
#[derive(Default)]
pub struct PackageBuilder {
    registry: Registry,
    body_table: HashMap<String, Arc<NativeBody>>,
    resources: Option<PathBuf>,
    hooks: HookSet,
}

impl PackageBuilder {
    pub fn new() -> Self {
        PackageBuilder::default()
    }

    /// Register a check; the check marker of the native format.
    pub fn check(&mut self, def: CheckDef) -> Result<()> {
        self.registry.register(def)
    }

    /// Install a named body so runtime registrations can reference it by
    /// name across the process boundary.
    pub fn body(&mut self, name: impl Into<String>, body: Arc<NativeBody>) {
        self.body_table.insert(name.into(), body);
    }

    pub fn resources(&mut self, dir: impl Into<PathBuf>) {
        self.resources = Some(dir.into());
    }

    pub fn before_every(&mut self, hook: SharedHook) {
        self.hooks.register_before_every(hook);
    }

    pub fn after_every(&mut self, hook: SharedHook) {
        self.hooks.register_after_every(hook);
    }

    /// Finish the package directly, without going through the loader
    /// table. Spawn-style children reload packages by source, so a
    /// package built this way must be run with the fork start method
    /// unless `name` is also registered as a loader.
    pub fn build(self, name: &str) -> Result<CheckPackage> {
        self.build_with_source(
            name.to_string(),
            PackageSource::Loader {
                name: name.to_string(),
            },
        )
    }

    fn build_with_source(mut self, name: String, source: PackageSource) -> Result<CheckPackage> {
        self.registry.freeze()?;
        Ok(CheckPackage {
            name,
            registry: self.registry,
            body_table: self.body_table,
            resources: self.resources,
            hooks: self.hooks,
            source,
        })
    }
}

pub type LoaderFn = fn(&mut PackageBuilder) -> Result<()>;

static LOADERS: OnceLock<Mutex<HashMap<String, LoaderFn>>> = OnceLock::new();

fn loaders() -> &'static Mutex<HashMap<String, LoaderFn>> {
    LOADERS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a native package loader under a name.
///
/// Re-registering the same function is a no-op so that spawn-style
/// children (which run the same top-level code again) stay idempotent;
/// a different function under a taken name is fatal.
pub fn register_loader(name: &str, loader: LoaderFn) -> Result<()> {
    let mut table = loaders()
        .lock()
        .map_err(|_| GradeboxError::Package("loader table poisoned".to_string()))?;
    if let Some(existing) = table.get(name) {
        if *existing as usize != loader as usize {
            return Err(GradeboxError::Package(format!(
                "package loader {name} is already registered"
            )));
        }
        return Ok(());
    }
    table.insert(name.to_string(), loader);
    Ok(())
}

/// Build a package from a registered loader.
pub fn load_registered(name: &str) -> Result<CheckPackage> {
    let loader = {
        let table = loaders()
            .lock()
            .map_err(|_| GradeboxError::Package("loader table poisoned".to_string()))?;
        table.get(name).copied().ok_or_else(|| {
            GradeboxError::Package(format!("no package loader registered as {name}"))
        })?
    };
    let mut builder = PackageBuilder::new();
    loader(&mut builder)?;
    builder.build_with_source(
        name.to_string(),
        PackageSource::Loader {
            name: name.to_string(),
        },
    )
}

#[derive(Deserialize)]
struct DeclarativeDoc {
    checks: serde_json::Map<String, serde_json::Value>,
}

/// Load a declarative JSON package: a document mapping check name to an
/// ordered list of steps, optionally wrapped under a `checks` key.
pub fn load_declarative(path: &Path) -> Result<CheckPackage> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        GradeboxError::Package(format!("cannot read check package {}: {e}", path.display()))
    })?;
    let value: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        GradeboxError::Package(format!("malformed check package {}: {e}", path.display()))
    })?;

    let checks = match serde_json::from_value::<DeclarativeDoc>(value.clone()) {
        Ok(doc) => doc.checks,
        Err(_) => match value {
            serde_json::Value::Object(map) => map,
            _ => {
                return Err(GradeboxError::Package(format!(
                    "check package {} must be a JSON object",
                    path.display()
                )))
            }
        },
    };

    let mut builder = PackageBuilder::new();
    for (raw_name, raw_steps) in checks {
        let name = normalize_check_name(&raw_name)?;
        let steps: Vec<Step> = serde_json::from_value(raw_steps).map_err(|e| {
            GradeboxError::Package(format!("malformed steps for check {raw_name}: {e}"))
        })?;
        builder.check(CheckDef::new(name, raw_name, Body::Steps(steps)))?;
    }

    let resources = path
        .parent()
        .map(|dir| dir.join(RESOURCES_DIR))
        .filter(|dir| dir.is_dir());
    if let Some(dir) = resources {
        builder.resources(dir);
    }

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("package")
        .to_string();
    builder.build_with_source(name, PackageSource::Declarative { path: path.to_path_buf() })
}

/// Rebuild a package from its source; the spawn-style child entry point.
pub fn reload(source: &PackageSource) -> Result<CheckPackage> {
    match source {
        PackageSource::Declarative { path } => load_declarative(path),
        PackageSource::Loader { name } => load_registered(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declarative_document_order_is_display_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checks.json");
        std::fs::write(
            &path,
            r#"{"checks": {
                "zeta": [{"run": "true"}],
                "alpha": [{"run": "true"}],
                "mid check": [{"run": "true"}]
            }}"#,
        )
        .unwrap();

        let package = load_declarative(&path).unwrap();
        assert_eq!(
            package.registry().display_order(),
            vec!["zeta", "alpha", "mid_check"]
        );
        assert_eq!(package.registry().get("mid_check").unwrap().description, "mid check");
    }

    #[test]
    fn test_declarative_without_wrapper_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checks.json");
        std::fs::write(&path, r#"{"greet": [{"run": "./hello", "stdout": "hello", "exit": 0}]}"#)
            .unwrap();

        let package = load_declarative(&path).unwrap();
        assert_eq!(package.registry().display_order(), vec!["greet"]);
    }

    #[test]
    fn test_declarative_bad_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checks.json");
        std::fs::write(&path, r#"{"checks": {"uh oh!": []}}"#).unwrap();
        assert!(load_declarative(&path).is_err());
    }

    #[test]
    fn test_declarative_resources_dir_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("resources")).unwrap();
        let path = dir.path().join("checks.json");
        std::fs::write(&path, r#"{"checks": {}}"#).unwrap();

        let package = load_declarative(&path).unwrap();
        assert!(package.resources().is_some());
    }

    #[test]
    fn test_loader_registration_is_idempotent() {
        fn sample_loader(builder: &mut PackageBuilder) -> Result<()> {
            builder.check(CheckDef::new("only", "only", Body::Steps(vec![])))
        }

        register_loader("idempotent_sample", sample_loader).unwrap();
        register_loader("idempotent_sample", sample_loader).unwrap();

        let package = load_registered("idempotent_sample").unwrap();
        assert_eq!(package.registry().len(), 1);
        assert!(package.registry().is_frozen());
    }
}
