//! NIP-01 filter matching for stores that evaluate filters in process.

use nostr_sdk::{Event, Filter};

/// Does `event` satisfy every condition of `filter`? `limit` is not considered.
pub fn matches(filter: &Filter, event: &Event) -> bool {
    if let Some(ids) = &filter.ids {
        if !ids.contains(&event.id) {
            return false;
        }
    }
    if let Some(authors) = &filter.authors {
        if !authors.contains(&event.pubkey) {
            return false;
        }
    }
    if let Some(kinds) = &filter.kinds {
        let kind = event.kind.as_u16();
        if !kinds.iter().any(|k| k.as_u16() == kind) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if event.created_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if event.created_at > until {
            return false;
        }
    }

    filter.generic_tags.iter().all(|(letter, values)| {
        let key = letter.as_char().to_string();
        event.tags.iter().any(|tag| match tag.as_slice() {
            [k, value, ..] => *k == key && values.contains(value),
            _ => false,
        })
    })
}
