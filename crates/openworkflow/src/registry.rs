//! The process-local map of `{name or name@version} -> workflow function`.
//!
//! Unlike the source implementation's process-wide registry, this one is
//! never a global/static: it is owned by a [`crate::client::Client`]
//! (`Arc<WorkflowRegistry>`), and a worker holds a clone of that `Arc`.

use std::collections::HashMap;

use crate::engine::WorkflowFn;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow {0} is not registered")]
    UnknownWorkflowType(String),

    #[error("workflow {0} is already registered")]
    DuplicateRegistration(String),
}

/// `name` alone if `version` is `None`, else `name@version`. Lookups are
/// always exact; there is no prefix or fuzzy matching.
pub fn registry_key(name: &str, version: Option<&str>) -> String {
    match version {
        Some(v) => format!("{name}@{v}"),
        None => name.to_string(),
    }
}

#[derive(Default)]
pub struct WorkflowRegistry {
    entries: HashMap<String, WorkflowFn>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        version: Option<&str>,
        workflow_fn: WorkflowFn,
    ) -> Result<(), RegistryError> {
        let key = registry_key(name, version);
        if self.entries.contains_key(&key) {
            return Err(RegistryError::DuplicateRegistration(key));
        }
        self.entries.insert(key, workflow_fn);
        Ok(())
    }

    pub fn lookup(&self, name: &str, version: Option<&str>) -> Result<WorkflowFn, RegistryError> {
        let key = registry_key(name, version);
        self.entries
            .get(&key)
            .cloned()
            .ok_or(RegistryError::UnknownWorkflowType(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::WorkflowContext;
    use std::sync::Arc;

    fn noop_fn() -> WorkflowFn {
        Arc::new(|ctx: WorkflowContext| Box::pin(async move { Ok(ctx.input) }))
    }

    #[test]
    fn key_includes_version_only_when_present() {
        assert_eq!(registry_key("greet", None), "greet");
        assert_eq!(registry_key("greet", Some("v2")), "greet@v2");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = WorkflowRegistry::new();
        registry.register("greet", None, noop_fn()).unwrap();
        let err = registry.register("greet", None, noop_fn()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateRegistration(_)));
    }

    #[test]
    fn unregistered_lookup_fails() {
        let registry = WorkflowRegistry::new();
        let err = registry.lookup("missing", None).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownWorkflowType(_)));
    }
}
