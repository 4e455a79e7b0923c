//! Registry for task bodies
//!
//! Process workers look their task up by name after re-executing the worker
//! program, so every task a batch can run must be registered under a stable
//! name.

use std::collections::HashMap;
use std::sync::Arc;

use super::{builtin, TaskBody};
use crate::core::errors::{FanOutError, Result};

#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn TaskBody>>,
}

impl TaskRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in tasks
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a task under its own name
    pub fn register(&mut self, task: Arc<dyn TaskBody>) -> Result<()> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(FanOutError::TaskAlreadyRegistered { name });
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TaskBody>> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| FanOutError::TaskNotFound {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{task_fn, TaskOutput};

    #[test]
    fn test_register_and_get() {
        let mut registry = TaskRegistry::new();
        registry
            .register(task_fn("seven", |_| Ok(TaskOutput::Int(7))))
            .unwrap();

        assert!(registry.contains("seven"));
        assert_eq!(registry.get("seven").unwrap().name(), "seven");
        assert!(matches!(
            registry.get("eight"),
            Err(FanOutError::TaskNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register(task_fn("dup", |_| Ok(TaskOutput::Int(1)))).unwrap();
        let err = registry
            .register(task_fn("dup", |_| Ok(TaskOutput::Int(2))))
            .unwrap_err();
        assert!(matches!(err, FanOutError::TaskAlreadyRegistered { .. }));
    }

    #[test]
    fn test_builtins_present() {
        let registry = TaskRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["count", "delay", "echo", "max", "product"]
        );
    }
}
