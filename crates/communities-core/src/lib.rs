//! Access control and routing policy for a NIP-29 communities relay.
//!
//! This crate decides which backend a subscription or submission goes to,
//! which stored events a requester may see (tiered content, previews and
//! group membership), and which submissions are admitted. Storage, group
//! state and the wire protocol are consumed through the traits in
//! [`store`], [`groups`] and [`admission`].

pub mod access;
pub mod admission;
pub mod filter;
pub mod groups;
pub mod router;
pub mod store;
pub mod subscription;
pub mod tiers;

// Re-export commonly used types
pub use access::{AccessFilter, AccessPolicy, Decision};
pub use admission::{
    Admission, AdmissionGuard, DuplicateGroupGuard, ModerationGuard, Rejected,
    TimestampWindowGuard, Verdict, GROUP_ALREADY_EXISTS,
};
pub use groups::{Group, GroupDirectory, GroupProjection, GroupState, MembershipResolver};
pub use router::{is_community_event, is_community_filter, Backend, ContentRouter};
pub use store::{EventStore, EventStream, MemoryStore, RequestContext};
pub use subscription::{DrainOutcome, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use tiers::{is_paid, is_preview, tiers};

// Re-export nostr-sdk for convenience
pub use nostr_sdk;
