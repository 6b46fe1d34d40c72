//! Event store capability consumed by the router and its decorators.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use nostr_sdk::{Event, EventId, Filter, PublicKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::filter;

/// Lazy, order-preserving stream of query results. An `Err` item ends the stream.
pub type EventStream = BoxStream<'static, Result<Event>>;

/// Who is asking, and the token that abandons the request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Authenticated pubkey, `None` for anonymous requesters.
    pub requester: Option<PublicKey>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(pubkey: PublicKey) -> Self {
        Self {
            requester: Some(pubkey),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Read/write capability of a storage backend.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Stream stored events matching `filter`, newest first.
    async fn query(&self, ctx: &RequestContext, filter: Filter) -> Result<EventStream>;

    async fn save(&self, event: &Event) -> Result<()>;

    async fn delete(&self, event: &Event) -> Result<()>;

    async fn count(&self, ctx: &RequestContext, filter: Filter) -> Result<usize>;
}

#[async_trait]
impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    async fn query(&self, ctx: &RequestContext, filter: Filter) -> Result<EventStream> {
        (**self).query(ctx, filter).await
    }

    async fn save(&self, event: &Event) -> Result<()> {
        (**self).save(event).await
    }

    async fn delete(&self, event: &Event) -> Result<()> {
        (**self).delete(event).await
    }

    async fn count(&self, ctx: &RequestContext, filter: Filter) -> Result<usize> {
        (**self).count(ctx, filter).await
    }
}

/// In-memory store, used by tests and as a scratch backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    events: Arc<RwLock<HashMap<EventId, Event>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    fn matching(&self, filter: &Filter) -> Vec<Event> {
        let mut found: Vec<Event> = self
            .events
            .read()
            .values()
            .filter(|event| filter::matches(filter, event))
            .cloned()
            .collect();
        // newest first, ties broken by id for a stable order
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        found
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn query(&self, _ctx: &RequestContext, filter: Filter) -> Result<EventStream> {
        let found = self.matching(&filter);
        Ok(stream::iter(found.into_iter().map(Ok)).boxed())
    }

    async fn save(&self, event: &Event) -> Result<()> {
        self.events.write().insert(event.id, event.clone());
        Ok(())
    }

    async fn delete(&self, event: &Event) -> Result<()> {
        self.events.write().remove(&event.id);
        Ok(())
    }

    async fn count(&self, _ctx: &RequestContext, filter: Filter) -> Result<usize> {
        Ok(self.matching(&filter).len())
    }
}
