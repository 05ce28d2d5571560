//! Registry of workflow definitions, indexed by id and by trigger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use pingflow_types::workflow::TriggerConfig;

use super::definition::WorkflowDefinition;
use super::scheduler::{CronSchedule, ScheduleError};

/// Errors raised while registering definitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow definition '{0}' is already registered")]
    DuplicateDefinition(String),

    #[error("workflow '{definition}' declares step '{step}' more than once")]
    DuplicateStep { definition: String, step: String },

    #[error("workflow '{0}' has no steps")]
    EmptySteps(String),

    #[error("workflow '{definition}' has an invalid cron trigger: {source}")]
    InvalidSchedule {
        definition: String,
        #[source]
        source: ScheduleError,
    },
}

/// A cron-triggered definition with its parsed schedule.
#[derive(Debug)]
pub struct CronEntry {
    pub definition_id: String,
    pub schedule: CronSchedule,
}

/// All known definitions. Built once, then shared read-only.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    /// event name -> definition ids, in registration order
    by_event: HashMap<String, Vec<String>>,
    cron: Vec<CronEntry>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a definition.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        if self.definitions.contains_key(&definition.id) {
            return Err(RegistryError::DuplicateDefinition(definition.id));
        }
        if definition.steps.is_empty() {
            return Err(RegistryError::EmptySteps(definition.id));
        }
        let mut seen = HashSet::new();
        for name in definition.step_names() {
            if !seen.insert(name) {
                return Err(RegistryError::DuplicateStep {
                    definition: definition.id.clone(),
                    step: name.to_string(),
                });
            }
        }

        match &definition.trigger {
            TriggerConfig::Event { name } => {
                self.by_event
                    .entry(name.clone())
                    .or_default()
                    .push(definition.id.clone());
            }
            TriggerConfig::Cron { schedule, timezone } => {
                let schedule = CronSchedule::parse(schedule, timezone.as_deref()).map_err(|source| {
                    RegistryError::InvalidSchedule {
                        definition: definition.id.clone(),
                        source,
                    }
                })?;
                self.cron.push(CronEntry {
                    definition_id: definition.id.clone(),
                    schedule,
                });
            }
        }

        tracing::debug!(
            definition_id = definition.id.as_str(),
            steps = definition.steps.len(),
            "workflow registered"
        );
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, definition_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions.get(definition_id).cloned()
    }

    /// Definitions triggered by `event_name`, in registration order.
    pub fn matching_event(&self, event_name: &str) -> Vec<Arc<WorkflowDefinition>> {
        self.by_event
            .get(event_name)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn cron_entries(&self) -> &[CronEntry] {
        &self.cron
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
