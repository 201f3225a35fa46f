//! Explicit registry mapping job kinds to runnable factories.

use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::ipc::JobSpec;

use super::{ClockSimulation, FailingJob, NoopJob, Runnable};

/// Builds a fresh runnable for a job.
pub type Factory = Box<dyn Fn(&JobSpec) -> Box<dyn Runnable> + Send + Sync>;

/// Kinds a worker knows how to materialize.
///
/// Passed to the worker at startup; nothing is looked up globally.
#[derive(Default)]
pub struct Registry {
    factories: FxHashMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop`, `clock` and `fail`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("noop", |spec| Box::new(NoopJob::new(&spec.name)));
        registry.register("clock", |spec| Box::new(ClockSimulation::new(&spec.name)));
        registry.register("fail", |spec| Box::new(FailingJob::new(&spec.name)));
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&JobSpec) -> Box<dyn Runnable> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Materialize `spec` and apply its overrides.
    pub fn build(&self, spec: &JobSpec) -> Result<Box<dyn Runnable>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| Error::UnknownKind(spec.kind.clone()))?;
        let mut runnable = factory(spec);
        for replacement in &spec.overrides {
            runnable.apply_override(&replacement.path, &replacement.value)?;
        }
        Ok(runnable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.kinds(), vec!["clock", "fail", "noop"]);
    }

    #[test]
    fn test_unknown_kind() {
        let registry = Registry::new();
        assert!(matches!(
            registry.build(&JobSpec::new("wheat", "w")),
            Err(Error::UnknownKind(kind)) if kind == "wheat"
        ));
    }

    #[test]
    fn test_build_applies_overrides() {
        let registry = Registry::with_builtins();
        let spec = JobSpec::new("clock", "Sim").with_override("[Clock].StartDate", "not-a-date");
        assert!(matches!(registry.build(&spec), Err(Error::Override { .. })));

        let spec = JobSpec::new("noop", "n").with_override("[Clock].StartDate", "2020-01-01");
        assert!(registry.build(&spec).is_err());
    }
}
