//! Tier labels and the tag conventions the relay assigns meaning to.
//!
//! Tags that carry a tracked key but no value (e.g. `["f"]`) are ignored.

use nostr_sdk::Event;
use std::collections::BTreeSet;
use tracing::debug;

/// Tier label tag: `["f", "<tier>"]`.
pub const TIER_TAG: &str = "f";
/// Group reference tag: `["h", "<group id>"]`.
pub const GROUP_TAG: &str = "h";
/// Preview marker: presence of the key alone is enough.
pub const PREVIEW_TAG: &str = "full";
/// Tier that makes an event free regardless of the other tiers present.
pub const FREE_TIER: &str = "free";

/// Second element of every well-formed tag with the given key, in tag order.
pub fn tag_values<'a>(event: &'a Event, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    event.tags.iter().filter_map(move |tag| match tag.as_slice() {
        [k, value, ..] if k.as_str() == key => Some(value.as_str()),
        _ => None,
    })
}

/// Whether any tag uses the given key, regardless of its length.
pub fn has_tag(event: &Event, key: &str) -> bool {
    event
        .tags
        .iter()
        .any(|tag| tag.as_slice().first().map(|k| k.as_str()) == Some(key))
}

/// Tier labels attached to the event. Empty means unrestricted.
pub fn tiers(event: &Event) -> BTreeSet<&str> {
    tag_values(event, TIER_TAG).collect()
}

/// Does this event require a paid membership to view?
pub fn is_paid(event: &Event) -> bool {
    let tiers = tiers(event);
    if tiers.is_empty() {
        return false;
    }

    let has_free_tier = tiers.contains(FREE_TIER);
    debug!(event_id = %event.id, ?tiers, has_free_tier, "classified event tiers");
    !has_free_tier
}

/// Whether the event is a teaser standing in for gated full content.
pub fn is_preview(event: &Event) -> bool {
    has_tag(event, PREVIEW_TAG)
}

/// Group ids referenced by the event's `h` tags.
pub fn group_refs(event: &Event) -> impl Iterator<Item = &str> {
    tag_values(event, GROUP_TAG)
}
