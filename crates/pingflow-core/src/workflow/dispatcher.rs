//! Event dispatcher: creates one run per definition matching an event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use pingflow_types::error::RepositoryError;
use pingflow_types::event::Event;
use pingflow_types::workflow::{RunTrigger, WorkflowRun};
use uuid::Uuid;

use super::deterministic_run_id;
use super::registry::WorkflowRegistry;
use crate::repository::run_store::RunStore;

pub struct EventDispatcher<S: RunStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
}

impl<S: RunStore> EventDispatcher<S> {
    pub fn new(store: Arc<S>, registry: Arc<WorkflowRegistry>) -> Self {
        Self { store, registry }
    }

    /// Create a `Pending` run for each definition whose trigger name equals
    /// `event.name`, in registration order.
    ///
    /// Keyed events get deterministic run ids; a redelivery returns the
    /// existing ids and writes nothing. An event nobody listens to is a
    /// no-op.
    pub async fn dispatch(&self, event: &Event, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let definitions = self.registry.matching_event(&event.name);
        if definitions.is_empty() {
            tracing::debug!(event = event.name.as_str(), "no workflow listens to event");
            return Ok(Vec::new());
        }

        let mut run_ids = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let run_id = match &event.idempotency_key {
                Some(key) => deterministic_run_id(&definition.id, key),
                None => Uuid::now_v7(),
            };
            let run = WorkflowRun::new(run_id, definition.id.as_str(), RunTrigger::Event(event.clone()), now);

            if self.store.create_run(&run).await? {
                tracing::info!(
                    %run_id,
                    definition_id = definition.id.as_str(),
                    event = event.name.as_str(),
                    "run created"
                );
            } else {
                tracing::debug!(
                    %run_id,
                    definition_id = definition.id.as_str(),
                    "duplicate delivery resolved to existing run"
                );
            }
            run_ids.push(run_id);
        }

        Ok(run_ids)
    }
}
