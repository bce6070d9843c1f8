/// Lifecycle hook registries
///
/// `before_every` and `after_every` are package-level ordered registries
/// run inside the child execution unit around every check body. The
/// third registry, `after_check`, is per-check and one-shot; it lives on
/// the `CheckContext` and is drained by the child frame.
///
/// A hook error is classified exactly like a body error; the remaining
/// hooks of that registry do not run for that check.
use crate::check::failure::BodyError;
use std::sync::Arc;

pub type SharedHook = Arc<dyn Fn() -> std::result::Result<(), BodyError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HookSet {
    before_every: Vec<SharedHook>,
    after_every: Vec<SharedHook>,
}

impl HookSet {
    pub fn new() -> Self {
        HookSet::default()
    }

    pub fn register_before_every(&mut self, hook: SharedHook) {
        self.before_every.push(hook);
    }

    pub fn register_after_every(&mut self, hook: SharedHook) {
        self.after_every.push(hook);
    }

    /// Run before-every hooks in registration order.
    pub fn run_before(&self) -> std::result::Result<(), BodyError> {
        for hook in &self.before_every {
            hook()?;
        }
        Ok(())
    }

    /// Run after-every hooks in registration order. Callers skip this
    /// entirely when the body raised.
    pub fn run_after(&self) -> std::result::Result<(), BodyError> {
        for hook in &self.after_every {
            hook()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.before_every.is_empty() && self.after_every.is_empty()
    }
}
