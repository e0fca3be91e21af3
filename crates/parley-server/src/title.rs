//! Deferred title generation.
//!
//! A run re-reads the conversation, re-checks the persisted
//! `title_generated` flag, asks the agent engine for a title and records it
//! with a conditional update, so concurrent or repeated triggers produce one
//! title change. Failures are logged and leave the flag unset; later
//! conversation activity triggers a new attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use parley_core::agent::AgentEngine;
use parley_core::events::ConversationEvent;
use parley_core::ids::ConversationId;
use parley_store::ConversationStore;

use crate::groups::ConnectionGroups;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TitleOutcome {
    Generated(String),
    /// Another run already recorded a title.
    AlreadyGenerated,
    /// Renamed, or no assistant reply yet.
    NotEligible,
    Missing,
    Failed,
}

#[derive(Clone)]
pub struct TitleWorkflow {
    store: Arc<dyn ConversationStore>,
    groups: Arc<ConnectionGroups>,
    tracker: TaskTracker,
}

impl TitleWorkflow {
    pub fn new(store: Arc<dyn ConversationStore>, groups: Arc<ConnectionGroups>) -> Self {
        Self {
            store,
            groups,
            tracker: TaskTracker::new(),
        }
    }

    /// Run out of band. The caller does not wait for the result.
    pub fn schedule(&self, engine: Arc<dyn AgentEngine>, id: ConversationId) {
        let workflow = self.clone();
        debug!(conversation_id = %id, "scheduling title generation");
        self.tracker.spawn(async move {
            workflow.run(engine.as_ref(), &id).await;
        });
    }

    #[instrument(skip(self, engine), fields(conversation_id = %id))]
    pub async fn run(&self, engine: &dyn AgentEngine, id: &ConversationId) -> TitleOutcome {
        let conversation = match self.store.get(id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                debug!("conversation gone before title generation");
                return TitleOutcome::Missing;
            }
            Err(e) => {
                error!(error = %e, "failed to load conversation for title generation");
                return TitleOutcome::Failed;
            }
        };

        if conversation.title_generated() {
            debug!("title already generated");
            return TitleOutcome::AlreadyGenerated;
        }
        if !conversation.needs_title() {
            return TitleOutcome::NotEligible;
        }

        let title = match engine.generate_title(&conversation).await {
            Ok(title) => title,
            Err(e) => {
                error!(error = %e, kind = e.error_kind(), "title generation failed");
                return TitleOutcome::Failed;
            }
        };

        match self.store.record_generated_title(id, &title).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("title recorded by another run");
                return TitleOutcome::AlreadyGenerated;
            }
            Err(e) => {
                error!(error = %e, "failed to persist generated title");
                return TitleOutcome::Failed;
            }
        }

        match self.store.get(id).await {
            Ok(Some(updated)) => {
                let report = self
                    .groups
                    .broadcast(&ConversationEvent::title_update(updated))
                    .await;
                info!(title = %title, delivered = report.delivered, "title generated");
            }
            Ok(None) => warn!("conversation deleted after title was recorded"),
            Err(e) => error!(error = %e, "failed to reload conversation after title update"),
        }
        TitleOutcome::Generated(title)
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Close the tracker and wait for in-flight runs.
    /// Returns `false` if the wait timed out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }
}
