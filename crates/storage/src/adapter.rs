use std::{borrow::Borrow, sync::Arc};

use anyhow::{Context, Result};
use shared::domain::{ConversationGroup, User};

use crate::KeyValueStore;

pub const USER_KEY: &str = "user";
pub const GROUPS_KEY: &str = "userGroups";

/// Typed access to the two documents the client persists: the local user and
/// the full group collection.
#[derive(Clone)]
pub struct LocalStoreAdapter {
    store: Arc<dyn KeyValueStore>,
}

impl LocalStoreAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub async fn load_user(&self) -> Result<Option<User>> {
        let Some(value) = self.store.get(USER_KEY).await? else {
            return Ok(None);
        };
        let user = serde_json::from_value(value).context("stored user record is malformed")?;
        Ok(Some(user))
    }

    pub async fn save_user(&self, user: &User) -> Result<()> {
        let value = serde_json::to_value(user)?;
        self.store.set(USER_KEY, value).await
    }

    pub async fn load_groups(&self) -> Result<Option<Vec<ConversationGroup>>> {
        let Some(value) = self.store.get(GROUPS_KEY).await? else {
            return Ok(None);
        };
        let groups =
            serde_json::from_value(value).context("stored group collection is malformed")?;
        Ok(Some(groups))
    }

    /// Writes the whole collection under one key; there is no partial update.
    pub async fn save_groups<G>(&self, groups: &[G]) -> Result<()>
    where
        G: Borrow<ConversationGroup>,
    {
        let groups: Vec<&ConversationGroup> = groups.iter().map(Borrow::borrow).collect();
        let value = serde_json::to_value(groups)?;
        self.store.set(GROUPS_KEY, value).await
    }
}
