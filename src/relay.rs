use anyhow::Result;
use communities_core::{
    AccessFilter, Admission, Backend, ContentRouter, DuplicateGroupGuard, GroupProjection,
    GroupState, ModerationGuard, TimestampWindowGuard,
};
use nostr_sdk::{Keys, PublicKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::store::SqliteStore;

/// Shared state handed to every connection.
pub struct RelayState {
    pub config: Config,
    pub keys: Keys,
    pub router: ContentRouter,
    pub groups: Arc<GroupState>,
}

impl RelayState {
    /// Open both databases, rebuild group state and wire the routing table.
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        let keys = config.keys()?;

        let community_store = SqliteStore::open(&config.community_db())?;
        let public_store = SqliteStore::open(&config.public_db())?;
        info!(
            community = %community_store.path().display(),
            public = %public_store.path().display(),
            "opened event stores"
        );

        let groups = Arc::new(GroupState::new());
        groups.replay(&community_store).await?;

        Ok(Arc::new(Self::assemble(
            config,
            keys,
            groups,
            community_store,
            public_store,
        )))
    }

    fn assemble(
        config: Config,
        keys: Keys,
        groups: Arc<GroupState>,
        community_store: impl communities_core::EventStore + 'static,
        public_store: impl communities_core::EventStore + 'static,
    ) -> Self {
        let admission = Admission::new()
            .guard(TimestampWindowGuard::new(
                Duration::from_secs(config.policy.max_past_secs),
                Duration::from_secs(config.policy.max_future_secs),
            ))
            .guard(DuplicateGroupGuard::new(groups.clone()))
            .guard(ModerationGuard::new(groups.clone()));

        // group chat can carry tiered posts too, so both backends are gated
        let community = Backend::new(
            "community",
            Arc::new(AccessFilter::new(
                GroupProjection::new(community_store, groups.clone()),
                groups.clone(),
            )),
        )
        .with_admission(admission);
        let public = Backend::new(
            "public",
            Arc::new(AccessFilter::new(public_store, groups.clone())),
        );

        Self {
            router: ContentRouter::communities(community, public),
            config,
            keys,
            groups,
        }
    }

    pub fn pubkey(&self) -> PublicKey {
        self.keys.public_key()
    }

    #[cfg(test)]
    pub(crate) fn in_memory(config: Config) -> Arc<Self> {
        use communities_core::MemoryStore;

        let keys = Keys::generate();
        Arc::new(Self::assemble(
            config,
            keys,
            Arc::new(GroupState::new()),
            MemoryStore::new(),
            MemoryStore::new(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use communities_core::GroupDirectory;
    use nostr_sdk::prelude::*;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::from_toml(r#"
            [relay]
            domain = "relay.example.com"
        "#)
        .unwrap();
        config.relay.secret_key = Some(Keys::generate().secret_key().to_secret_hex());
        config.storage.path = dir.display().to_string();
        config
    }

    #[tokio::test]
    async fn reopening_replays_group_state() {
        let dir = tempfile::tempdir().unwrap();
        let admin = Keys::generate();
        let create = EventBuilder::new(Kind::Custom(9007), "")
            .tag(Tag::custom(TagKind::custom("h"), vec!["g1".to_string()]))
            .sign_with_keys(&admin)
            .unwrap();

        {
            let relay = RelayState::open(config(dir.path())).await.unwrap();
            relay.router.for_event(&create).store().save(&create).await.unwrap();
            assert!(relay.groups.exists("g1"));
        }

        let relay = RelayState::open(config(dir.path())).await.unwrap();
        assert!(relay.groups.exists("g1"));
        assert!(relay.groups.is_admin("g1", &admin.public_key()));
        assert!(dir.path().join("public.db").exists());
    }
}
