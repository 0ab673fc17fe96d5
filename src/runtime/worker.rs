//! In-process stage workers
//!
//! Stages that name a `function` instead of an `entry` run as threads inside
//! the node. Their code is looked up in a [`WorkerRegistry`] passed to the
//! node explicitly.

use std::sync::Arc;

use dashmap::DashMap;

use super::endpoint::StageEndpoint;

/// Worker body. `Ok` exits with code 0; `Err` or a panic exits with code 1.
pub type WorkerFn = Arc<dyn Fn(&mut StageEndpoint) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerFn>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `passthrough`, which forwards every frame
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register("passthrough", |endpoint: &mut StageEndpoint| {
            endpoint.serve(|frame| Ok(Some(frame)))
        });
        registry
    }

    /// Register `f` under `name`, replacing any previous worker
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&mut StageEndpoint) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.workers.insert(name.into(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<WorkerFn> {
        self.workers.get(name).map(|w| w.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("workers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = WorkerRegistry::new();
        registry.register("noop", |_: &mut StageEndpoint| Ok(()));
        assert!(registry.contains("noop"));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_builtins() {
        let registry = WorkerRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["passthrough".to_string()]);
    }
}
