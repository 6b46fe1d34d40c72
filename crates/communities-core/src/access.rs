//! Per-event visibility decisions over a backend's query stream.
//!
//! A query stream mixes unrestricted, tiered and teaser events, so every item
//! is judged on its own as it arrives; nothing is buffered and the relative
//! order of the emitted events is the order the backend produced them in.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{future, StreamExt};
use nostr_sdk::{Event, Filter, PublicKey};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::groups::MembershipResolver;
use crate::store::{EventStore, EventStream, RequestContext};
use crate::tiers::{group_refs, is_paid, is_preview, tiers};

/// Why an event was emitted, or that it was not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Gated content shown to a member of one of its groups.
    Member,
    /// Preview shown to someone outside the referenced groups.
    Teaser,
    /// Content without tiers, or carrying the free tier.
    Unrestricted,
    Denied,
}

impl Decision {
    pub fn is_emitted(self) -> bool {
        self != Decision::Denied
    }
}

/// Visibility rules for one request, with memberships resolved up front.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    groups: HashSet<String>,
}

impl AccessPolicy {
    pub fn new(groups: HashSet<String>) -> Self {
        Self { groups }
    }

    /// Resolve the requester's memberships. Anonymous requesters belong to no group.
    pub fn resolve(resolver: &dyn MembershipResolver, requester: Option<&PublicKey>) -> Self {
        let groups = requester
            .map(|pubkey| resolver.resolve(pubkey))
            .unwrap_or_default();
        if let Some(pubkey) = requester {
            debug!(requester = %pubkey, ?groups, "resolved group memberships");
        }
        Self { groups }
    }

    pub fn groups(&self) -> &HashSet<String> {
        &self.groups
    }

    /// First matching rule wins: member of a tagged group viewing tiered
    /// content, then teaser for outsiders, then free non-preview content.
    /// An event tiered `free` is free whatever other tiers it carries.
    pub fn decide(&self, event: &Event) -> Decision {
        let tiers = tiers(event);
        let preview = is_preview(event);
        let member = group_refs(event).any(|group| self.groups.contains(group));

        let decision = if member && !tiers.is_empty() {
            Decision::Member
        } else if preview && !member {
            Decision::Teaser
        } else if !is_paid(event) && !preview {
            Decision::Unrestricted
        } else {
            Decision::Denied
        };

        trace!(event_id = %event.id, ?tiers, preview, member, ?decision, "access decision");
        decision
    }

    pub fn admits(&self, event: &Event) -> bool {
        self.decide(event).is_emitted()
    }

    /// Lazily drop the events this requester may not see. Errors pass through
    /// so the consumer still observes the failure and stops.
    pub fn apply(self, stream: EventStream) -> EventStream {
        stream
            .filter(move |item| {
                let keep = match item {
                    Ok(event) => self.admits(event),
                    Err(_) => true,
                };
                future::ready(keep)
            })
            .boxed()
    }
}

/// Gates an inner store's query results by tier and group membership.
pub struct AccessFilter<S> {
    inner: S,
    resolver: Arc<dyn MembershipResolver>,
}

impl<S: EventStore> AccessFilter<S> {
    pub fn new(inner: S, resolver: Arc<dyn MembershipResolver>) -> Self {
        Self { inner, resolver }
    }

    /// Memberships are looked up again for every request.
    pub fn policy_for(&self, ctx: &RequestContext) -> AccessPolicy {
        AccessPolicy::resolve(self.resolver.as_ref(), ctx.requester.as_ref())
    }
}

#[async_trait]
impl<S: EventStore> EventStore for AccessFilter<S> {
    async fn query(&self, ctx: &RequestContext, filter: Filter) -> Result<EventStream> {
        let policy = self.policy_for(ctx);
        let stream = self.inner.query(ctx, filter).await?;
        Ok(policy.apply(stream))
    }

    async fn save(&self, event: &Event) -> Result<()> {
        self.inner.save(event).await
    }

    async fn delete(&self, event: &Event) -> Result<()> {
        self.inner.delete(event).await
    }

    /// Counts only what the requester could query, so totals never reveal gated events.
    async fn count(&self, ctx: &RequestContext, mut filter: Filter) -> Result<usize> {
        filter.limit = None;
        let mut stream = self.query(ctx, filter).await?;
        let mut visible = 0;
        while let Some(item) = stream.next().await {
            item?;
            visible += 1;
        }
        Ok(visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures_util::stream;
    use nostr_sdk::prelude::*;
    use std::collections::HashMap;

    struct FixedMemberships(HashMap<PublicKey, HashSet<String>>);

    impl MembershipResolver for FixedMemberships {
        fn resolve(&self, identity: &PublicKey) -> HashSet<String> {
            self.0.get(identity).cloned().unwrap_or_default()
        }
    }

    fn event(tags: &[&[&str]]) -> Event {
        let keys = Keys::generate();
        let tags = tags.iter().map(|parts| {
            let values: Vec<String> = parts[1..].iter().map(|v| v.to_string()).collect();
            Tag::custom(TagKind::custom(parts[0]), values)
        });
        EventBuilder::new(Kind::Custom(30023), "article")
            .tags(tags)
            .sign_with_keys(&keys)
            .unwrap()
    }

    fn member_of(groups: &[&str]) -> AccessPolicy {
        AccessPolicy::new(groups.iter().map(|g| g.to_string()).collect())
    }

    #[test]
    fn untiered_events_reach_everyone() {
        let open = event(&[&["t", "news"]]);
        assert_eq!(AccessPolicy::default().decide(&open), Decision::Unrestricted);
        assert_eq!(member_of(&["g1"]).decide(&open), Decision::Unrestricted);
    }

    #[test]
    fn tiered_event_hidden_from_anonymous_unless_teaser() {
        let gated = event(&[&["f", "gold"]]);
        assert_eq!(AccessPolicy::default().decide(&gated), Decision::Denied);

        let teaser = event(&[&["f", "gold"], &["full", ""]]);
        assert_eq!(AccessPolicy::default().decide(&teaser), Decision::Teaser);
    }

    #[test]
    fn membership_in_any_tagged_group_is_enough() {
        let gated = event(&[&["h", "g1"], &["h", "g2"], &["f", "gold"]]);
        assert_eq!(member_of(&["g2"]).decide(&gated), Decision::Member);
        assert_eq!(member_of(&["g3"]).decide(&gated), Decision::Denied);

        let teaser = event(&[&["h", "g1"], &["h", "g2"], &["f", "gold"], &["full", ""]]);
        assert_eq!(member_of(&["g3"]).decide(&teaser), Decision::Teaser);
    }

    #[test]
    fn member_rule_wins_over_teaser_rule() {
        let both = event(&[&["h", "g1"], &["f", "gold"], &["full", ""]]);
        assert_eq!(member_of(&["g1"]).decide(&both), Decision::Member);
    }

    #[test]
    fn members_do_not_see_previews_of_untiered_content() {
        let preview = event(&[&["h", "g1"], &["full", ""]]);
        assert_eq!(member_of(&["g1"]).decide(&preview), Decision::Denied);
        assert_eq!(AccessPolicy::default().decide(&preview), Decision::Teaser);
    }

    #[test]
    fn free_tier_reaches_outsiders() {
        let free = event(&[&["f", "free"]]);
        assert_eq!(AccessPolicy::default().decide(&free), Decision::Unrestricted);

        let free_and_gold = event(&[&["f", "free"], &["f", "gold"]]);
        assert_eq!(AccessPolicy::default().decide(&free_and_gold), Decision::Unrestricted);
        assert_eq!(member_of(&["g3"]).decide(&free_and_gold), Decision::Unrestricted);

        // members of a referenced group still match the member rule first
        let grouped = event(&[&["h", "g1"], &["f", "free"]]);
        assert_eq!(member_of(&["g1"]).decide(&grouped), Decision::Member);

        let free_preview = event(&[&["f", "free"], &["full", ""]]);
        assert_eq!(member_of(&["g1"]).decide(&free_preview), Decision::Teaser);
    }

    #[test]
    fn malformed_group_tag_grants_nothing() {
        let gated = event(&[&["h"], &["f", "gold"]]);
        assert_eq!(member_of(&["g1"]).decide(&gated), Decision::Denied);
    }

    #[tokio::test]
    async fn apply_keeps_source_order() {
        let events = vec![
            event(&[&["t", "a"]]),
            event(&[&["f", "gold"]]),
            event(&[&["h", "g1"], &["f", "gold"]]),
            event(&[&["f", "gold"], &["full", ""]]),
            event(&[]),
        ];
        let expected: Vec<EventId> = vec![events[0].id, events[2].id, events[4].id];

        let input: EventStream = stream::iter(events.clone().into_iter().map(Ok)).boxed();
        let out: Vec<EventId> = member_of(&["g1"])
            .apply(input)
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn apply_passes_errors_through_in_place() {
        let ok = event(&[]);
        let hidden = event(&[&["f", "gold"]]);
        let input: EventStream = stream::iter(vec![
            Ok(hidden),
            Ok(ok.clone()),
            Err(anyhow::anyhow!("backend went away")),
        ])
        .boxed();

        let out: Vec<anyhow::Result<Event>> = AccessPolicy::default().apply(input).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap().id, ok.id);
        assert!(out[1].is_err());
    }

    #[tokio::test]
    async fn apply_works_on_unbounded_streams() {
        let open = event(&[]);
        let gated = event(&[&["f", "gold"]]);
        let input: EventStream = stream::iter([gated, open.clone()].into_iter().cycle().map(Ok)).boxed();

        let first: Vec<EventId> = AccessPolicy::default()
            .apply(input)
            .take(3)
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(first, vec![open.id; 3]);
    }

    #[tokio::test]
    async fn filter_resolves_memberships_per_request() {
        let alice = Keys::generate().public_key();
        let resolver = Arc::new(FixedMemberships(HashMap::from([(
            alice,
            HashSet::from(["g1".to_string()]),
        )])));

        let store = MemoryStore::new();
        let gated = event(&[&["h", "g1"], &["f", "gold"]]);
        let open = event(&[]);
        store.save(&gated).await.unwrap();
        store.save(&open).await.unwrap();

        let filter = AccessFilter::new(store, resolver);

        let anon: Vec<EventId> = filter
            .query(&RequestContext::anonymous(), Filter::new())
            .await
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect()
            .await;
        assert_eq!(anon, vec![open.id]);

        let ctx = RequestContext::authenticated(alice);
        assert_eq!(filter.count(&ctx, Filter::new()).await.unwrap(), 2);
        assert_eq!(
            filter.count(&RequestContext::anonymous(), Filter::new()).await.unwrap(),
            1
        );
    }
}
