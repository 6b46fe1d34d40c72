//! Group membership capabilities and a reference NIP-29 group-state projection.
//!
//! The access filter and the admission guards only see the two traits below.
//! [`GroupState`] is the in-process implementation the relay binary uses: it
//! follows moderation events as they are stored and answers membership and
//! existence lookups from the current state, never from a cache.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use nostr_sdk::{Event, Filter, Kind, PublicKey};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::store::{EventStream, EventStore, RequestContext};
use crate::tiers::{group_refs, tag_values};

pub const KIND_PUT_USER: u16 = 9000;
pub const KIND_REMOVE_USER: u16 = 9001;
pub const KIND_CREATE_GROUP: u16 = 9007;
pub const KIND_DELETE_GROUP: u16 = 9008;

/// Maps a requester to the ids of the groups it currently belongs to.
pub trait MembershipResolver: Send + Sync {
    fn resolve(&self, identity: &PublicKey) -> HashSet<String>;
}

/// Existence and authority lookups against the group-state store.
pub trait GroupDirectory: Send + Sync {
    fn exists(&self, group_id: &str) -> bool;

    fn is_admin(&self, group_id: &str, identity: &PublicKey) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub members: HashSet<PublicKey>,
    pub admins: HashSet<PublicKey>,
}

impl Group {
    fn created_by(id: &str, creator: PublicKey) -> Self {
        Self {
            id: id.to_string(),
            members: HashSet::from([creator]),
            admins: HashSet::from([creator]),
        }
    }
}

/// Shared group state, updated from stored moderation events.
#[derive(Debug, Default)]
pub struct GroupState {
    groups: RwLock<HashMap<String, Group>>,
}

impl GroupState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group_id: &str) -> Option<Group> {
        self.groups.read().get(group_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    /// Fold one event into the state. Returns whether anything changed.
    ///
    /// Creating an existing group is a no-op, so concurrent creates of the same
    /// id settle on the first one applied.
    pub fn apply(&self, event: &Event) -> bool {
        let kind = event.kind.as_u16();
        if !is_group_state_kind(kind) {
            return false;
        }
        let Some(group_id) = group_refs(event).next() else {
            return false;
        };

        let mut groups = self.groups.write();
        match kind {
            KIND_CREATE_GROUP => {
                if groups.contains_key(group_id) {
                    return false;
                }
                groups.insert(group_id.to_string(), Group::created_by(group_id, event.pubkey));
                info!(group = group_id, creator = %event.pubkey, "group created");
                true
            }
            KIND_DELETE_GROUP => {
                let removed = groups.remove(group_id).is_some();
                if removed {
                    info!(group = group_id, "group deleted");
                }
                removed
            }
            KIND_PUT_USER | KIND_REMOVE_USER => {
                let Some(group) = groups.get_mut(group_id) else {
                    debug!(group = group_id, kind, "moderation event for unknown group");
                    return false;
                };
                let mut changed = false;
                for hex in tag_values(event, "p") {
                    let Ok(pubkey) = PublicKey::from_hex(hex) else {
                        continue;
                    };
                    changed |= if kind == KIND_PUT_USER {
                        group.members.insert(pubkey)
                    } else {
                        let was_admin = group.admins.remove(&pubkey);
                        group.members.remove(&pubkey) || was_admin
                    };
                }
                changed
            }
            _ => false,
        }
    }

    /// Replace the current state with the one `store` replays to.
    pub async fn rebuild(&self, store: &dyn EventStore) -> Result<()> {
        let fresh = GroupState::new();
        fresh.replay(store).await?;
        let groups = std::mem::take(&mut *fresh.groups.write());
        *self.groups.write() = groups;
        Ok(())
    }

    /// Rebuild state from the moderation events already in `store`, oldest first.
    pub async fn replay(&self, store: &dyn EventStore) -> Result<usize> {
        let filter = Filter::new().kinds([
            Kind::Custom(KIND_PUT_USER),
            Kind::Custom(KIND_REMOVE_USER),
            Kind::Custom(KIND_CREATE_GROUP),
            Kind::Custom(KIND_DELETE_GROUP),
        ]);
        let stream: EventStream = store.query(&RequestContext::anonymous(), filter).await?;
        let mut events = stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<Event>>>()?;
        // same-second events: create before membership changes before delete
        events.sort_by_key(|event| (event.created_at, replay_rank(event.kind.as_u16()), event.id));

        let applied = events.iter().filter(|event| self.apply(event)).count();
        info!(events = events.len(), applied, groups = self.len(), "replayed group state");
        Ok(applied)
    }
}

fn replay_rank(kind: u16) -> u8 {
    match kind {
        KIND_CREATE_GROUP => 0,
        KIND_DELETE_GROUP => 2,
        _ => 1,
    }
}

impl MembershipResolver for GroupState {
    fn resolve(&self, identity: &PublicKey) -> HashSet<String> {
        self.groups
            .read()
            .values()
            .filter(|group| group.members.contains(identity))
            .map(|group| group.id.clone())
            .collect()
    }
}

impl GroupDirectory for GroupState {
    fn exists(&self, group_id: &str) -> bool {
        self.groups.read().contains_key(group_id)
    }

    fn is_admin(&self, group_id: &str, identity: &PublicKey) -> bool {
        self.groups
            .read()
            .get(group_id)
            .is_some_and(|group| group.admins.contains(identity))
    }
}

/// Store decorator that feeds every successfully saved event into a [`GroupState`].
pub struct GroupProjection<S> {
    inner: S,
    groups: Arc<GroupState>,
}

impl<S: EventStore> GroupProjection<S> {
    pub fn new(inner: S, groups: Arc<GroupState>) -> Self {
        Self { inner, groups }
    }
}

#[async_trait]
impl<S: EventStore> EventStore for GroupProjection<S> {
    async fn query(&self, ctx: &RequestContext, filter: Filter) -> Result<EventStream> {
        self.inner.query(ctx, filter).await
    }

    async fn save(&self, event: &Event) -> Result<()> {
        self.inner.save(event).await?;
        self.groups.apply(event);
        Ok(())
    }

    /// Removing a moderation event changes history, so the state is
    /// replayed from what remains. Live state then matches a restart.
    async fn delete(&self, event: &Event) -> Result<()> {
        self.inner.delete(event).await?;
        if is_group_state_kind(event.kind.as_u16()) {
            debug!(event_id = %event.id, "moderation event deleted, rebuilding group state");
            self.groups.rebuild(&self.inner).await?;
        }
        Ok(())
    }

    async fn count(&self, ctx: &RequestContext, filter: Filter) -> Result<usize> {
        self.inner.count(ctx, filter).await
    }
}

fn is_group_state_kind(kind: u16) -> bool {
    matches!(
        kind,
        KIND_PUT_USER | KIND_REMOVE_USER | KIND_CREATE_GROUP | KIND_DELETE_GROUP
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use nostr_sdk::prelude::*;

    fn moderation(keys: &Keys, kind: u16, group: &str, users: &[PublicKey], at: u64) -> Event {
        let mut builder = EventBuilder::new(Kind::Custom(kind), "")
            .tag(Tag::custom(TagKind::custom("h"), vec![group.to_string()]))
            .custom_created_at(Timestamp::from(at));
        for user in users {
            builder = builder.tag(Tag::public_key(*user));
        }
        builder.sign_with_keys(keys).unwrap()
    }

    #[test]
    fn create_then_put_and_remove_users() {
        let admin = Keys::generate();
        let alice = Keys::generate().public_key();
        let state = GroupState::new();

        assert!(state.apply(&moderation(&admin, KIND_CREATE_GROUP, "g1", &[], 1)));
        assert!(state.exists("g1"));
        assert!(state.is_admin("g1", &admin.public_key()));
        assert!(state.resolve(&admin.public_key()).contains("g1"));

        assert!(state.apply(&moderation(&admin, KIND_PUT_USER, "g1", &[alice], 2)));
        assert_eq!(state.resolve(&alice), HashSet::from(["g1".to_string()]));

        assert!(state.apply(&moderation(&admin, KIND_REMOVE_USER, "g1", &[alice], 3)));
        assert!(state.resolve(&alice).is_empty());
    }

    #[test]
    fn second_create_does_not_replace_group() {
        let first = Keys::generate();
        let second = Keys::generate();
        let state = GroupState::new();

        assert!(state.apply(&moderation(&first, KIND_CREATE_GROUP, "g1", &[], 1)));
        assert!(!state.apply(&moderation(&second, KIND_CREATE_GROUP, "g1", &[], 2)));
        assert!(!state.is_admin("g1", &second.public_key()));
    }

    #[test]
    fn unknown_group_and_missing_reference_are_ignored() {
        let admin = Keys::generate();
        let alice = Keys::generate().public_key();
        let state = GroupState::new();

        assert!(!state.apply(&moderation(&admin, KIND_PUT_USER, "nope", &[alice], 1)));
        let no_ref = EventBuilder::new(Kind::Custom(KIND_CREATE_GROUP), "")
            .sign_with_keys(&admin)
            .unwrap();
        assert!(!state.apply(&no_ref));
        assert!(state.is_empty());
    }

    #[test]
    fn delete_group_drops_memberships() {
        let admin = Keys::generate();
        let state = GroupState::new();
        state.apply(&moderation(&admin, KIND_CREATE_GROUP, "g1", &[], 1));
        assert!(state.apply(&moderation(&admin, KIND_DELETE_GROUP, "g1", &[], 2)));
        assert!(!state.exists("g1"));
        assert!(state.resolve(&admin.public_key()).is_empty());
    }

    #[tokio::test]
    async fn replay_applies_in_chronological_order() {
        let admin = Keys::generate();
        let alice = Keys::generate().public_key();
        let store = MemoryStore::new();
        // removal is newer than the put, so alice must end up outside
        store.save(&moderation(&admin, KIND_REMOVE_USER, "g1", &[alice], 30)).await.unwrap();
        store.save(&moderation(&admin, KIND_PUT_USER, "g1", &[alice], 20)).await.unwrap();
        store.save(&moderation(&admin, KIND_CREATE_GROUP, "g1", &[], 10)).await.unwrap();

        let state = GroupState::new();
        state.replay(&store).await.unwrap();
        assert!(state.exists("g1"));
        assert!(state.resolve(&alice).is_empty());
    }

    #[tokio::test]
    async fn replay_creates_before_same_second_puts() {
        let admin = Keys::generate();
        let store = MemoryStore::new();
        let users: Vec<PublicKey> = (0..8).map(|_| Keys::generate().public_key()).collect();
        for user in &users {
            store.save(&moderation(&admin, KIND_PUT_USER, "g1", &[*user], 10)).await.unwrap();
        }
        store.save(&moderation(&admin, KIND_CREATE_GROUP, "g1", &[], 10)).await.unwrap();

        let state = GroupState::new();
        state.replay(&store).await.unwrap();
        for user in &users {
            assert!(state.resolve(user).contains("g1"));
        }
    }

    #[tokio::test]
    async fn deleting_moderation_events_matches_a_fresh_replay() {
        let admin = Keys::generate();
        let alice = Keys::generate().public_key();
        let groups = Arc::new(GroupState::new());
        let store = GroupProjection::new(MemoryStore::new(), groups.clone());

        let create = moderation(&admin, KIND_CREATE_GROUP, "g1", &[], 1);
        let put = moderation(&admin, KIND_PUT_USER, "g1", &[alice], 2);
        store.save(&create).await.unwrap();
        store.save(&put).await.unwrap();
        assert!(groups.resolve(&alice).contains("g1"));

        store.delete(&put).await.unwrap();
        assert!(groups.resolve(&alice).is_empty());
        assert!(groups.exists("g1"));

        store.delete(&create).await.unwrap();
        assert!(!groups.exists("g1"));

        let replayed = GroupState::new();
        replayed.replay(&store).await.unwrap();
        assert_eq!(replayed.len(), groups.len());
    }

    #[tokio::test]
    async fn projection_applies_saved_events() {
        let admin = Keys::generate();
        let groups = Arc::new(GroupState::new());
        let store = GroupProjection::new(MemoryStore::new(), groups.clone());

        store.save(&moderation(&admin, KIND_CREATE_GROUP, "g1", &[], 1)).await.unwrap();
        assert!(groups.exists("g1"));
    }
}
