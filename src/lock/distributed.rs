//! Single-substrate owner-token lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{Lock, LOCK_KEY_PREFIX};
use crate::domain::ports::{KeyValueStore, ServerScript};
use crate::error::Result;

/// Identifies this process among all clients of the substrate.
static PROCESS_TOKEN: Lazy<String> = Lazy::new(|| Uuid::new_v4().simple().to_string());

/// Distinguishes handles (execution contexts) within this process.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Lock stored at `lock:<name>` whose value is this handle's owner token.
///
/// Each handle carries its own token, so two handles for the same name in
/// the same process still exclude each other.
pub struct DistributedLock {
    store: Arc<dyn KeyValueStore>,
    name: String,
    key: String,
    token: String,
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish()
    }
}

impl DistributedLock {
    /// New handle with a fresh owner token.
    pub fn new(store: Arc<dyn KeyValueStore>, name: impl Into<String>) -> Self {
        let name = name.into();
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        Self {
            store,
            key: format!("{}{}", LOCK_KEY_PREFIX, name),
            token: format!("{}-{}", *PROCESS_TOKEN, handle),
            name,
        }
    }

    /// Substrate key holding the lock.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token written on acquisition.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether the substrate currently records this handle as owner.
    pub async fn is_held(&self) -> Result<bool> {
        Ok(self.store.get(&self.key).await?.as_deref() == Some(self.token.as_str()))
    }
}

#[async_trait]
impl Lock for DistributedLock {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(lock = %self.key))]
    async fn try_acquire(&self, ttl: Duration) -> Result<bool> {
        let acquired = self.store.set_if_absent(&self.key, &self.token, ttl).await?;
        debug!(acquired, "Lock attempt");
        Ok(acquired)
    }

    #[instrument(skip(self), fields(lock = %self.key))]
    async fn release(&self) -> Result<bool> {
        let deleted = self
            .store
            .eval(
                ServerScript::ReleaseLock,
                std::slice::from_ref(&self.key),
                std::slice::from_ref(&self.token),
            )
            .await?;
        if deleted == 0 {
            warn!("Lock no longer held by this owner, release skipped");
        }
        Ok(deleted > 0)
    }
}
