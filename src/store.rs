//! SQLite-backed event store.
//!
//! Writes go through one shared connection guarded by a `parking_lot::Mutex`.
//! Every query opens its own read connection on a blocking thread and feeds
//! rows through a bounded channel, so results stream lazily and a dropped
//! stream stops the scan.

use anyhow::{Context, Result};
use async_trait::async_trait;
use communities_core::filter;
use communities_core::tiers::tag_values;
use communities_core::{EventStore, EventStream, RequestContext};
use futures_util::StreamExt;
use nostr_sdk::{Event, Filter};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, types::ToSql, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Rows buffered between the blocking reader and the async consumer.
const READ_AHEAD: usize = 64;

pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<SyncMutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create storage dir: {}", dir.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open event DB: {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id         TEXT PRIMARY KEY,
                pubkey     TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind       INTEGER NOT NULL,
                d_tag      TEXT,
                raw        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);",
        )?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(SyncMutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Visit stored events matching `filter`, newest first, until `visit`
    /// returns false or `filter.limit` events were visited.
    fn scan(path: &Path, filter: &Filter, mut visit: impl FnMut(Event) -> bool) -> Result<()> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open event DB: {}", path.display()))?;

        let (sql, values) = select_sql(filter);
        let mut stmt = conn.prepare(&sql)?;
        let params_ref: Vec<&dyn ToSql> = values.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(params_ref.as_slice())?;

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut visited = 0;
        while visited < limit {
            let Some(row) = rows.next()? else {
                break;
            };
            let raw: String = row.get(0)?;
            let event: Event = match serde_json::from_str(&raw) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping unreadable stored event: {}", e);
                    continue;
                }
            };
            // tag constraints are not expressed in SQL
            if !filter::matches(filter, &event) {
                continue;
            }
            visited += 1;
            if !visit(event) {
                break;
            }
        }
        Ok(())
    }
}

fn select_sql(filter: &Filter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut sql = String::from("SELECT raw FROM events WHERE 1=1");
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    let mut push_in = |sql: &mut String, column: &str, items: Vec<Box<dyn ToSql>>| {
        if items.is_empty() {
            sql.push_str(" AND 0");
            return;
        }
        let start = values.len();
        let placeholders: Vec<String> = (0..items.len()).map(|i| format!("?{}", start + i + 1)).collect();
        sql.push_str(&format!(" AND {} IN ({})", column, placeholders.join(", ")));
        values.extend(items);
    };

    if let Some(ids) = &filter.ids {
        push_in(&mut sql, "id", ids.iter().map(|id| Box::new(id.to_hex()) as Box<dyn ToSql>).collect());
    }
    if let Some(authors) = &filter.authors {
        push_in(&mut sql, "pubkey", authors.iter().map(|pk| Box::new(pk.to_hex()) as Box<dyn ToSql>).collect());
    }
    if let Some(kinds) = &filter.kinds {
        push_in(&mut sql, "kind", kinds.iter().map(|k| Box::new(k.as_u16() as i64) as Box<dyn ToSql>).collect());
    }
    if let Some(since) = filter.since {
        sql.push_str(&format!(" AND created_at >= ?{}", values.len() + 1));
        values.push(Box::new(since.as_u64() as i64));
    }
    if let Some(until) = filter.until {
        sql.push_str(&format!(" AND created_at <= ?{}", values.len() + 1));
        values.push(Box::new(until.as_u64() as i64));
    }
    sql.push_str(" ORDER BY created_at DESC, id ASC");

    (sql, values)
}

/// NIP-01 replaceable (one per author and kind) and addressable (one per
/// author, kind and `d` tag) kinds.
fn replaceable_key(event: &Event) -> Option<Option<String>> {
    let kind = event.kind.as_u16();
    if kind == 0 || kind == 3 || (10000..20000).contains(&kind) {
        Some(None)
    } else if (30000..40000).contains(&kind) {
        Some(Some(tag_values(event, "d").next().unwrap_or_default().to_string()))
    } else {
        None
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn query(&self, ctx: &RequestContext, filter: Filter) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(READ_AHEAD);
        let path = self.path.clone();
        let cancel = ctx.cancel.clone();

        tokio::task::spawn_blocking(move || {
            let result = Self::scan(&path, &filter, |event| {
                !cancel.is_cancelled() && tx.blocking_send(Ok(event)).is_ok()
            });
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn save(&self, event: &Event) -> Result<()> {
        let raw = serde_json::to_string(event)?;
        let id = event.id.to_hex();
        let pubkey = event.pubkey.to_hex();
        let created_at = event.created_at.as_u64() as i64;
        let kind = event.kind.as_u16() as i64;
        let replaceable = replaceable_key(event);

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(d_tag) = &replaceable {
            let newer: i64 = tx.query_row(
                "SELECT COUNT(*) FROM events
                 WHERE pubkey = ?1 AND kind = ?2 AND IFNULL(d_tag, '') = IFNULL(?3, '')
                   AND (created_at > ?4 OR (created_at = ?4 AND id < ?5))",
                params![pubkey, kind, d_tag, created_at, id],
                |row| row.get(0),
            )?;
            if newer > 0 {
                debug!("Ignoring superseded replaceable event {}", &id[..8]);
                return Ok(());
            }
            tx.execute(
                "DELETE FROM events WHERE pubkey = ?1 AND kind = ?2 AND IFNULL(d_tag, '') = IFNULL(?3, '')",
                params![pubkey, kind, d_tag],
            )?;
        }
        tx.execute(
            "INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, d_tag, raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, pubkey, created_at, kind, replaceable.flatten(), raw],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn delete(&self, event: &Event) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM events WHERE id = ?1", params![event.id.to_hex()])?;
        Ok(())
    }

    async fn count(&self, _ctx: &RequestContext, mut filter: Filter) -> Result<usize> {
        filter.limit = None;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut count = 0;
            Self::scan(&path, &filter, |_| {
                count += 1;
                true
            })?;
            Ok::<_, anyhow::Error>(count)
        })
        .await
        .context("count task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::prelude::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested/events.db")).unwrap();
        (dir, store)
    }

    fn event(keys: &Keys, kind: u16, at: u64, tags: Vec<Tag>) -> Event {
        EventBuilder::new(Kind::Custom(kind), format!("at {at}"))
            .tags(tags)
            .custom_created_at(Timestamp::from(at))
            .sign_with_keys(keys)
            .unwrap()
    }

    async fn ids(store: &SqliteStore, filter: serde_json::Value) -> Vec<EventId> {
        let filter: Filter = serde_json::from_value(filter).unwrap();
        store
            .query(&RequestContext::anonymous(), filter)
            .await
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect()
            .await
    }

    #[tokio::test]
    async fn saves_and_queries_newest_first() {
        let (_dir, store) = store();
        let keys = Keys::generate();
        let old = event(&keys, 1, 100, vec![]);
        let new = event(&keys, 1, 200, vec![]);
        let other_kind = event(&keys, 7, 300, vec![]);
        for e in [&old, &new, &other_kind] {
            store.save(e).await.unwrap();
        }
        // saving twice is harmless
        store.save(&old).await.unwrap();

        assert_eq!(ids(&store, json!({"kinds": [1]})).await, vec![new.id, old.id]);
        assert_eq!(ids(&store, json!({"kinds": [1], "limit": 1})).await, vec![new.id]);
        assert_eq!(ids(&store, json!({"since": 150, "until": 250})).await, vec![new.id]);
        assert_eq!(
            ids(&store, json!({"authors": [keys.public_key().to_hex()]})).await.len(),
            3
        );
        assert_eq!(ids(&store, json!({"ids": [old.id.to_hex()]})).await, vec![old.id]);
    }

    #[tokio::test]
    async fn tag_constraints_apply_before_limit() {
        let (_dir, store) = store();
        let keys = Keys::generate();
        let h = |g: &str| Tag::custom(TagKind::custom("h"), vec![g.to_string()]);
        let in_g1 = event(&keys, 9, 100, vec![h("g1")]);
        let in_g2 = event(&keys, 9, 200, vec![h("g2")]);
        store.save(&in_g1).await.unwrap();
        store.save(&in_g2).await.unwrap();

        assert_eq!(ids(&store, json!({"#h": ["g1"], "limit": 1})).await, vec![in_g1.id]);
        let count = store
            .count(
                &RequestContext::anonymous(),
                serde_json::from_value(json!({"#h": ["g1", "g2"]})).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn delete_removes_event() {
        let (_dir, store) = store();
        let keys = Keys::generate();
        let e = event(&keys, 1, 100, vec![]);
        store.save(&e).await.unwrap();
        store.delete(&e).await.unwrap();
        assert!(ids(&store, json!({})).await.is_empty());
    }

    #[tokio::test]
    async fn replaceable_events_keep_only_the_newest() {
        let (_dir, store) = store();
        let keys = Keys::generate();
        let d = |v: &str| Tag::identifier(v);

        let first = event(&keys, 30023, 100, vec![d("post")]);
        let second = event(&keys, 30023, 200, vec![d("post")]);
        let other = event(&keys, 30023, 150, vec![d("other")]);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();
        store.save(&other).await.unwrap();
        // an older version arriving late does not resurrect
        store.save(&first).await.unwrap();

        assert_eq!(ids(&store, json!({"kinds": [30023]})).await, vec![second.id, other.id]);

        let profile_old = event(&keys, 0, 100, vec![]);
        let profile_new = event(&keys, 0, 200, vec![]);
        store.save(&profile_old).await.unwrap();
        store.save(&profile_new).await.unwrap();
        assert_eq!(ids(&store, json!({"kinds": [0]})).await, vec![profile_new.id]);
    }

    #[tokio::test]
    async fn cancelled_request_stops_the_scan() {
        let (_dir, store) = store();
        let keys = Keys::generate();
        for at in 0..10 {
            store.save(&event(&keys, 1, 1_000 + at, vec![])).await.unwrap();
        }
        let ctx = RequestContext::anonymous();
        ctx.cancel.cancel();
        let got: Vec<_> = store.query(&ctx, Filter::new()).await.unwrap().collect().await;
        assert!(got.is_empty());
    }
}
