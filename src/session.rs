//! One client connection: NIP-01 messages plus NIP-42 AUTH and NIP-45 COUNT.
//!
//! Frames arrive as JSON arrays and are dispatched on their first element.
//! Everything the relay says goes through the connection's outbound queue;
//! REQ results are produced by one task per subscription so a slow query
//! never blocks the next frame.

use anyhow::{anyhow, Context, Result};
use communities_core::tiers::tag_values;
use communities_core::{Backend, DrainOutcome, RequestContext, Subscription};
use futures_util::StreamExt;
use nostr_sdk::{Event, EventId, Filter, PublicKey, Timestamp};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::relay::RelayState;

pub const KIND_AUTH: u16 = 22242;
pub const KIND_DELETION: u16 = 5;

/// Maximum distance between an AUTH event's `created_at` and the relay clock.
const AUTH_WINDOW_SECS: u64 = 600;

pub struct Session {
    relay: Arc<RelayState>,
    outbound: mpsc::Sender<String>,
    challenge: String,
    authed: Option<PublicKey>,
    /// Parent of every subscription token; cancelled when the session ends.
    cancel: CancellationToken,
    subscriptions: HashMap<String, CancellationToken>,
}

impl Session {
    pub fn new(relay: Arc<RelayState>, outbound: mpsc::Sender<String>) -> Self {
        Self {
            relay,
            outbound,
            challenge: Uuid::new_v4().to_string(),
            authed: None,
            cancel: CancellationToken::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }

    pub fn authed(&self) -> Option<&PublicKey> {
        self.authed.as_ref()
    }

    /// Send the NIP-42 challenge. Called once right after the upgrade.
    pub async fn greet(&self) -> Result<()> {
        self.send(json!(["AUTH", self.challenge])).await
    }

    /// Handle one client frame. An error means the connection is gone.
    pub async fn handle(&mut self, text: &str) -> Result<()> {
        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => return self.notice(&format!("error: invalid JSON: {e}")).await,
        };
        let Some(items) = message.as_array() else {
            return self.notice("error: expected a JSON array").await;
        };

        match items.first().and_then(Value::as_str) {
            Some("EVENT") => self.on_event(items).await,
            Some("REQ") => self.on_req(items).await,
            Some("CLOSE") => self.on_close(items),
            Some("COUNT") => self.on_count(items).await,
            Some("AUTH") => self.on_auth(items).await,
            Some(other) => {
                self.notice(&format!("error: unknown message type: {other}"))
                    .await
            }
            None => self.notice("error: missing message type").await,
        }
    }

    /// Cancel every running subscription.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.subscriptions.clear();
    }

    fn context(&self, cancel: CancellationToken) -> RequestContext {
        match self.authed {
            Some(pubkey) => RequestContext::authenticated(pubkey),
            None => RequestContext::anonymous(),
        }
        .with_cancel(cancel)
    }

    async fn on_event(&mut self, items: &[Value]) -> Result<()> {
        let event = match parse_event(items) {
            Ok(event) => event,
            Err(e) => return self.notice(&format!("invalid: {e}")).await,
        };
        let id = event.id.to_hex();

        if event.verify().is_err() {
            return self.ok(&id, false, "invalid: bad signature").await;
        }
        if event.kind.as_u16() == KIND_AUTH {
            return self.ok(&id, false, "invalid: auth events are not stored").await;
        }

        let backend = Arc::clone(self.relay.router.for_event(&event));
        let ctx = self.context(self.cancel.child_token());

        if let Err(rejected) = backend.admission().evaluate(&ctx, &event) {
            info!(event_id = %event.id, backend = backend.name(), %rejected, "event rejected");
            return self.ok(&id, false, &format!("blocked: {rejected}")).await;
        }

        if event.kind.as_u16() == KIND_DELETION {
            match delete_referenced(&backend, &event).await {
                Ok(deleted) => debug!(event_id = %event.id, deleted, "applied deletion request"),
                Err(e) => {
                    warn!(event_id = %event.id, "Deletion failed: {:#}", e);
                    return self.ok(&id, false, &format!("error: {e}")).await;
                }
            }
        }

        match backend.store().save(&event).await {
            Ok(()) => {
                debug!(event_id = %event.id, kind = event.kind.as_u16(), backend = backend.name(), "event stored");
                self.ok(&id, true, "").await
            }
            Err(e) => {
                warn!(event_id = %event.id, "Failed to store event: {:#}", e);
                self.ok(&id, false, &format!("error: {e}")).await
            }
        }
    }

    async fn on_req(&mut self, items: &[Value]) -> Result<()> {
        let Some(sub_id) = items.get(1).and_then(Value::as_str).map(str::to_string) else {
            return self.notice("error: REQ without subscription id").await;
        };
        let filters = match parse_filters(&items[2..]) {
            Ok(filters) => filters,
            Err(e) => return self.closed(&sub_id, &format!("error: {e}")).await,
        };

        if let Some(previous) = self.subscriptions.remove(&sub_id) {
            previous.cancel();
        }
        // served subscriptions cancel their own token once they finish
        self.subscriptions.retain(|_, token| !token.is_cancelled());
        let token = self.cancel.child_token();
        self.subscriptions.insert(sub_id.clone(), token.clone());

        let queries: Vec<(Arc<Backend>, Filter)> = filters
            .into_iter()
            .map(|filter| (Arc::clone(self.relay.router.for_filter(&filter)), filter))
            .collect();

        tokio::spawn(serve_subscription(
            sub_id,
            queries,
            self.context(token),
            self.outbound.clone(),
            self.relay.config.policy.queue_capacity,
        ));
        Ok(())
    }

    fn on_close(&mut self, items: &[Value]) -> Result<()> {
        if let Some(sub_id) = items.get(1).and_then(Value::as_str) {
            if let Some(token) = self.subscriptions.remove(sub_id) {
                token.cancel();
                debug!(sub_id, "subscription closed by client");
            }
        }
        Ok(())
    }

    async fn on_count(&mut self, items: &[Value]) -> Result<()> {
        let Some(sub_id) = items.get(1).and_then(Value::as_str) else {
            return self.notice("error: COUNT without subscription id").await;
        };
        let filters = match parse_filters(&items[2..]) {
            Ok(filters) => filters,
            Err(e) => return self.closed(sub_id, &format!("error: {e}")).await,
        };

        let ctx = self.context(self.cancel.child_token());
        let mut count = 0;
        for filter in filters {
            let backend = Arc::clone(self.relay.router.for_filter(&filter));
            match backend.store().count(&ctx, filter).await {
                Ok(n) => count += n,
                Err(e) => {
                    warn!(sub_id, backend = backend.name(), "Count failed: {:#}", e);
                    return self.closed(sub_id, &format!("error: {e}")).await;
                }
            }
        }
        self.send(json!(["COUNT", sub_id, { "count": count }])).await
    }

    async fn on_auth(&mut self, items: &[Value]) -> Result<()> {
        let event = match parse_event(items) {
            Ok(event) => event,
            Err(e) => return self.notice(&format!("invalid: {e}")).await,
        };
        let id = event.id.to_hex();

        match self.check_auth(&event, Timestamp::now().as_u64()) {
            Ok(()) => {
                info!(pubkey = %event.pubkey, "client authenticated");
                self.authed = Some(event.pubkey);
                self.ok(&id, true, "").await
            }
            Err(reason) => {
                debug!(pubkey = %event.pubkey, reason, "auth rejected");
                self.ok(&id, false, reason).await
            }
        }
    }

    fn check_auth(&self, event: &Event, now: u64) -> std::result::Result<(), &'static str> {
        if event.kind.as_u16() != KIND_AUTH {
            return Err("invalid: not an auth event");
        }
        if tag_values(event, "challenge").next() != Some(self.challenge.as_str()) {
            return Err("invalid: challenge mismatch");
        }
        let domain = self.relay.config.relay.domain.as_str();
        if !tag_values(event, "relay").any(|url| url.contains(domain)) {
            return Err("invalid: relay tag does not match");
        }
        if event.created_at.as_u64().abs_diff(now) > AUTH_WINDOW_SECS {
            return Err("invalid: auth event expired");
        }
        if event.verify().is_err() {
            return Err("invalid: bad signature");
        }
        Ok(())
    }

    async fn send(&self, message: Value) -> Result<()> {
        self.outbound
            .send(message.to_string())
            .await
            .map_err(|_| anyhow!("connection closed"))
    }

    async fn ok(&self, id: &str, accepted: bool, message: &str) -> Result<()> {
        self.send(json!(["OK", id, accepted, message])).await
    }

    async fn closed(&self, sub_id: &str, message: &str) -> Result<()> {
        self.send(json!(["CLOSED", sub_id, message])).await
    }

    async fn notice(&self, message: &str) -> Result<()> {
        self.send(json!(["NOTICE", message])).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn parse_event(items: &[Value]) -> Result<Event> {
    let raw = items.get(1).context("missing event")?;
    serde_json::from_value(raw.clone()).context("malformed event")
}

fn parse_filters(items: &[Value]) -> Result<Vec<Filter>> {
    if items.is_empty() {
        anyhow::bail!("no filters");
    }
    items
        .iter()
        .map(|raw| serde_json::from_value(raw.clone()).context("invalid filter"))
        .collect()
}

/// NIP-09: remove the `e`-referenced events written by the deletion's author.
async fn delete_referenced(backend: &Backend, deletion: &Event) -> Result<usize> {
    let ids: Vec<EventId> = tag_values(deletion, "e")
        .filter_map(|hex| EventId::from_hex(hex).ok())
        .collect();
    if ids.is_empty() {
        return Ok(0);
    }

    let filter = Filter::new().ids(ids).author(deletion.pubkey);
    let ctx = RequestContext::authenticated(deletion.pubkey);
    let mut targets = backend.store().query(&ctx, filter).await?;
    let mut deleted = 0;
    while let Some(target) = targets.next().await {
        let target = target?;
        backend.store().delete(&target).await?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Serve the stored events for every filter of one REQ, then EOSE.
async fn serve_subscription(
    sub_id: String,
    queries: Vec<(Arc<Backend>, Filter)>,
    ctx: RequestContext,
    outbound: mpsc::Sender<String>,
    capacity: usize,
) {
    let mut seen: HashSet<EventId> = HashSet::new();

    for (backend, filter) in queries {
        let stream = match backend.store().query(&ctx, filter).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(sub_id = %sub_id, backend = backend.name(), "Query failed: {:#}", e);
                ctx.cancel.cancel();
                let _ = outbound
                    .send(json!(["CLOSED", sub_id, format!("error: {e}")]).to_string())
                    .await;
                return;
            }
        };

        let mut sub = Subscription::spawn(stream, ctx.cancel.clone(), capacity);
        while let Some(event) = sub.recv().await {
            if !seen.insert(event.id) {
                continue;
            }
            let frame = json!(["EVENT", sub_id, event]).to_string();
            if outbound.send(frame).await.is_err() {
                ctx.cancel.cancel();
                sub.finish().await;
                return;
            }
        }

        match sub.finish().await {
            DrainOutcome::Exhausted { sent } => {
                debug!(sub_id = %sub_id, backend = backend.name(), sent, "filter served");
            }
            DrainOutcome::Failed { error, .. } => {
                ctx.cancel.cancel();
                let _ = outbound
                    .send(json!(["CLOSED", sub_id, format!("error: {error}")]).to_string())
                    .await;
                return;
            }
            outcome => {
                debug!(sub_id = %sub_id, ?outcome, "subscription stopped");
                return;
            }
        }
    }

    ctx.cancel.cancel();
    let _ = outbound.send(json!(["EOSE", sub_id]).to_string()).await;
}
