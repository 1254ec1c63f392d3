//! Indexer client contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::clause::Clause;
use crate::error::IndexerError;
use crate::model::{Entity, PendingUpdate};

/// Channel a live subscription pushes raw updates into.
pub type UpdateSink = mpsc::UnboundedSender<PendingUpdate>;

/// A live remote subscription.
pub trait SubscriptionHandle: Send + Sync {
    /// Stop further notifications. Updates already delivered are not recalled.
    fn cancel(&self);
}

pub type BoxedSubscription = Box<dyn SubscriptionHandle>;

/// One-shot fetch request.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// `None` fetches everything.
    pub clause: Option<Clause>,
    /// Models to return; empty returns all.
    pub models: Vec<String>,
    pub limit: u32,
    /// Opaque cursor from the previous page.
    pub cursor: Option<String>,
    pub historical: bool,
}

impl Query {
    pub fn new(clause: Option<Clause>, models: Vec<String>, limit: u32) -> Self {
        Self {
            clause,
            models,
            limit,
            cursor: None,
            historical: false,
        }
    }
}

/// One page of fetch results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Entity>,
    pub next_cursor: Option<String>,
}

/// Remote indexer.
#[async_trait]
pub trait IndexerClient: Send + Sync {
    /// Live entity updates matching `clause` (`None` = every entity).
    async fn subscribe_entities(
        &self,
        clause: Option<Clause>,
        sink: UpdateSink,
    ) -> Result<BoxedSubscription, IndexerError>;

    /// Live event-message updates matching `clause`.
    async fn subscribe_event_messages(
        &self,
        clause: Option<Clause>,
        sink: UpdateSink,
    ) -> Result<BoxedSubscription, IndexerError>;

    async fn fetch_entities(&self, query: &Query) -> Result<Page, IndexerError>;

    async fn fetch_event_messages(&self, query: &Query) -> Result<Page, IndexerError>;
}

/// Several subscriptions cancelled together.
pub struct CombinedSubscription {
    parts: Vec<BoxedSubscription>,
}

impl CombinedSubscription {
    pub fn new(parts: Vec<BoxedSubscription>) -> Self {
        Self { parts }
    }
}

impl SubscriptionHandle for CombinedSubscription {
    fn cancel(&self) {
        for part in &self.parts {
            part.cancel();
        }
    }
}

/// Subscribe to entity and event-message updates behind one handle.
pub async fn subscribe_entities_and_events(
    client: &dyn IndexerClient,
    clause: Option<Clause>,
    sink: UpdateSink,
) -> Result<BoxedSubscription, IndexerError> {
    let entities = client.subscribe_entities(clause.clone(), sink.clone()).await?;
    let events = match client.subscribe_event_messages(clause, sink).await {
        Ok(events) => events,
        Err(e) => {
            entities.cancel();
            return Err(e);
        }
    };
    Ok(Box::new(CombinedSubscription::new(vec![entities, events])))
}
