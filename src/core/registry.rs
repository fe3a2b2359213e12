//! Typed registration table for workflow programs.
//!
//! Passed to the orchestrator at construction; workflow types are resolved by
//! name from this table only.

use std::collections::HashMap;
use std::sync::Arc;

use super::executor::Workflow;

/// Maps workflow type names to their programs
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its own type name (builder style)
    pub fn with(mut self, workflow: impl Workflow + 'static) -> Self {
        self.register(workflow);
        self
    }

    /// Register a workflow, replacing any previous one with the same name
    pub fn register(&mut self, workflow: impl Workflow + 'static) {
        let workflow: Arc<dyn Workflow> = Arc::new(workflow);
        self.workflows
            .insert(workflow.workflow_type().to_string(), workflow);
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(workflow_type).cloned()
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("types", &self.types())
            .finish()
    }
}
