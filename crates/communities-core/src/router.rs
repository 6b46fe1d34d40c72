//! Content-addressed routing of subscriptions and submissions across backends.
//!
//! One client session interleaves community traffic and public traffic, so the
//! backend is chosen from what is asked for or published, not from the
//! connection. Bindings are tried in registration order; the fallback given
//! to [`ContentRouter::new`] is the catch-all at the end.

use nostr_sdk::{Alphabet, Event, Filter, SingleLetterTag};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

use crate::admission::Admission;
use crate::store::EventStore;
use crate::tiers::group_refs;

/// Community metadata kinds a subscription may ask for.
pub const COMMUNITY_METADATA_QUERY_KINDS: RangeInclusive<u16> = 39000..=39002;

/// Kinds that always belong to the community backend when published.
pub const COMMUNITY_EVENT_KINDS: [RangeInclusive<u16>; 3] = [
    // moderation actions
    9000..=9021,
    // group metadata
    39000..=39010,
    // chat, threads, join and leave
    9..=12,
];

pub type FilterPredicate = Box<dyn Fn(&Filter) -> bool + Send + Sync>;
pub type EventPredicate = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// A storage backend together with the admission policy for events sent to it.
pub struct Backend {
    name: String,
    store: Arc<dyn EventStore>,
    admission: Admission,
}

impl Backend {
    pub fn new(name: impl Into<String>, store: Arc<dyn EventStore>) -> Self {
        Self {
            name: name.into(),
            store,
            admission: Admission::default(),
        }
    }

    pub fn with_admission(mut self, admission: Admission) -> Self {
        self.admission = admission;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("guards", &self.admission.len())
            .finish()
    }
}

struct Route {
    req: FilterPredicate,
    event: EventPredicate,
    backend: Arc<Backend>,
}

pub struct ContentRouter {
    routes: Vec<Route>,
    fallback: Arc<Backend>,
}

impl ContentRouter {
    /// Router whose only binding is the catch-all `fallback`.
    pub fn new(fallback: Backend) -> Self {
        Self {
            routes: Vec::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// Add a binding, tried after every binding registered before it.
    pub fn route(
        mut self,
        req: impl Fn(&Filter) -> bool + Send + Sync + 'static,
        event: impl Fn(&Event) -> bool + Send + Sync + 'static,
        backend: Backend,
    ) -> Self {
        self.routes.push(Route {
            req: Box::new(req),
            event: Box::new(event),
            backend: Arc::new(backend),
        });
        self
    }

    /// Community traffic to `community`, everything else to `public`.
    pub fn communities(community: Backend, public: Backend) -> Self {
        Self::new(public).route(is_community_filter, is_community_event, community)
    }

    pub fn for_filter(&self, filter: &Filter) -> &Arc<Backend> {
        let backend = self
            .routes
            .iter()
            .find(|route| (route.req)(filter))
            .map(|route| &route.backend)
            .unwrap_or(&self.fallback);
        debug!(backend = backend.name(), kinds = ?filter.kinds, "routed REQ");
        backend
    }

    pub fn for_event(&self, event: &Event) -> &Arc<Backend> {
        let backend = self
            .routes
            .iter()
            .find(|route| (route.event)(event))
            .map(|route| &route.backend)
            .unwrap_or(&self.fallback);
        debug!(backend = backend.name(), kind = event.kind.as_u16(), event_id = %event.id, "routed EVENT");
        backend
    }

    /// All backends, bindings first and the fallback last.
    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.routes
            .iter()
            .map(|route| &route.backend)
            .chain(std::iter::once(&self.fallback))
    }
}

/// Subscriptions that constrain by group or ask for group metadata.
pub fn is_community_filter(filter: &Filter) -> bool {
    if filter
        .generic_tags
        .contains_key(&SingleLetterTag::lowercase(Alphabet::H))
    {
        return true;
    }
    filter.kinds.as_ref().is_some_and(|kinds| {
        kinds
            .iter()
            .any(|kind| COMMUNITY_METADATA_QUERY_KINDS.contains(&kind.as_u16()))
    })
}

/// Submissions in a community kind range or referencing a group.
pub fn is_community_event(event: &Event) -> bool {
    let kind = event.kind.as_u16();
    COMMUNITY_EVENT_KINDS.iter().any(|range| range.contains(&kind))
        || group_refs(event).next().is_some()
}
