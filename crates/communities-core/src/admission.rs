//! Pre-admission checks run before a backend accepts an event.
//!
//! Every registered guard is consulted; the event is rejected if any guard
//! rejects it, and the reasons of all rejecting guards are reported together.

use nostr_sdk::{Event, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::groups::{GroupDirectory, KIND_CREATE_GROUP};
use crate::store::RequestContext;
use crate::tiers::group_refs;

pub const GROUP_ALREADY_EXISTS: &str = "group already exists";

/// Moderation actions other than group creation need admin rights.
const MODERATION_KINDS: std::ops::RangeInclusive<u16> = 9000..=9020;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

pub trait AdmissionGuard: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &RequestContext, event: &Event) -> Verdict;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", .reasons.join("; "))]
pub struct Rejected {
    pub reasons: Vec<String>,
}

/// Ordered set of guards for one backend.
#[derive(Clone, Default)]
pub struct Admission {
    guards: Vec<Arc<dyn AdmissionGuard>>,
}

impl Admission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(mut self, guard: impl AdmissionGuard + 'static) -> Self {
        self.guards.push(Arc::new(guard));
        self
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn evaluate(&self, ctx: &RequestContext, event: &Event) -> Result<(), Rejected> {
        let reasons: Vec<String> = self
            .guards
            .iter()
            .filter_map(|guard| match guard.check(ctx, event) {
                Verdict::Accept => None,
                Verdict::Reject(reason) => {
                    debug!(guard = guard.name(), event_id = %event.id, %reason, "event rejected");
                    Some(reason)
                }
            })
            .collect();

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(Rejected { reasons })
        }
    }
}

/// Rejects group creation for a group id that is already taken.
pub struct DuplicateGroupGuard {
    directory: Arc<dyn GroupDirectory>,
}

impl DuplicateGroupGuard {
    pub fn new(directory: Arc<dyn GroupDirectory>) -> Self {
        Self { directory }
    }
}

impl AdmissionGuard for DuplicateGroupGuard {
    fn name(&self) -> &'static str {
        "duplicate-group"
    }

    fn check(&self, _ctx: &RequestContext, event: &Event) -> Verdict {
        if event.kind.as_u16() != KIND_CREATE_GROUP {
            return Verdict::Accept;
        }
        match group_refs(event).next() {
            Some(group_id) if self.directory.exists(group_id) => {
                Verdict::Reject(GROUP_ALREADY_EXISTS.to_string())
            }
            _ => Verdict::Accept,
        }
    }
}

/// Rejects events whose `created_at` is too far from the relay's clock.
pub struct TimestampWindowGuard {
    max_past: Duration,
    max_future: Duration,
}

impl TimestampWindowGuard {
    pub fn new(max_past: Duration, max_future: Duration) -> Self {
        Self { max_past, max_future }
    }

    fn check_at(&self, event: &Event, now: u64) -> Verdict {
        let created = event.created_at.as_u64();
        if created.saturating_add(self.max_past.as_secs()) < now {
            Verdict::Reject("invalid: event too old".to_string())
        } else if created > now.saturating_add(self.max_future.as_secs()) {
            Verdict::Reject("invalid: event too far in the future".to_string())
        } else {
            Verdict::Accept
        }
    }
}

impl Default for TimestampWindowGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(30))
    }
}

impl AdmissionGuard for TimestampWindowGuard {
    fn name(&self) -> &'static str {
        "timestamp-window"
    }

    fn check(&self, _ctx: &RequestContext, event: &Event) -> Verdict {
        self.check_at(event, Timestamp::now().as_u64())
    }
}

/// Moderation actions must come from an admin of the referenced group.
pub struct ModerationGuard {
    directory: Arc<dyn GroupDirectory>,
}

impl ModerationGuard {
    pub fn new(directory: Arc<dyn GroupDirectory>) -> Self {
        Self { directory }
    }
}

impl AdmissionGuard for ModerationGuard {
    fn name(&self) -> &'static str {
        "moderation"
    }

    fn check(&self, _ctx: &RequestContext, event: &Event) -> Verdict {
        let kind = event.kind.as_u16();
        if kind == KIND_CREATE_GROUP || !MODERATION_KINDS.contains(&kind) {
            return Verdict::Accept;
        }
        match group_refs(event).next() {
            None => Verdict::Reject("invalid: missing group reference".to_string()),
            Some(group_id) if self.directory.is_admin(group_id, &event.pubkey) => Verdict::Accept,
            Some(_) => Verdict::Reject("restricted: not a group admin".to_string()),
        }
    }
}
