//! Resource store trait and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{ChangeBus, ChangeKind, WatchEvent};
use crate::error::{Error, Result};
use crate::fault::FaultInjector;
use crate::types::{Echo, EchoSpec, EchoStatus, ObjectKey, ObjectMeta, ResourceKind, ResourceVersion};

/// Typed access to Echo objects and their status subresource.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the latest committed state of an Echo.
    ///
    /// Returns `Error::NotFound` if it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Echo>;

    /// Replace the status of `echo`, fenced by `echo.metadata.resource_version`.
    ///
    /// Returns the stored object with its new version, or
    /// `Error::VersionConflict` if the object changed since it was read.
    async fn update_status(&self, echo: &Echo) -> Result<Echo>;

    /// List every Echo.
    async fn list(&self) -> Result<Vec<Echo>>;
}

/// In-memory store with cluster-like versioning and watch notifications.
pub struct InMemoryResourceStore {
    objects: RwLock<HashMap<ObjectKey, Echo>>,
    version: AtomicU64,
    status_writes: AtomicUsize,
    bus: Option<Arc<ChangeBus>>,
    faults: FaultInjector,
}

impl InMemoryResourceStore {
    /// Create a store that publishes nothing.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            status_writes: AtomicUsize::new(0),
            bus: None,
            faults: FaultInjector::new(),
        }
    }

    /// Create a store that publishes every write to `bus`.
    pub fn with_bus(bus: Arc<ChangeBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new()
        }
    }

    /// Fault injection handle.
    pub const fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Number of committed status writes.
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Create an Echo with only its spec populated.
    ///
    /// # Errors
    ///
    /// Returns `Error::Invalid` for a spec outside the schema bounds and
    /// `Error::AlreadyExists` if the identity is taken.
    pub async fn create(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: EchoSpec,
    ) -> Result<Echo> {
        spec.validate()?;
        let key = ObjectKey::new(namespace, name);
        if key.name.is_empty() {
            return Err(Error::invalid("metadata.name", "must not be empty"));
        }

        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(Error::already_exists(ResourceKind::Echo, key));
        }

        let echo = Echo {
            metadata: ObjectMeta {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                uid: Uuid::new_v4(),
                resource_version: self.next_version(),
                generation: 1,
                creation_timestamp: Utc::now(),
            },
            spec,
            status: EchoStatus::default(),
        };
        objects.insert(key.clone(), echo.clone());
        drop(objects);

        debug!(key = %key, uid = %echo.metadata.uid, "Created Echo");
        self.publish(ChangeKind::Created, &echo);
        Ok(echo)
    }

    /// Delete an Echo, returning the removed object.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if it does not exist.
    pub async fn delete(&self, key: &ObjectKey) -> Result<Echo> {
        let removed = self
            .objects
            .write()
            .await
            .remove(key)
            .ok_or_else(|| Error::not_found(ResourceKind::Echo, key.clone()))?;

        debug!(key = %key, uid = %removed.metadata.uid, "Deleted Echo");
        self.publish(ChangeKind::Deleted, &removed);
        Ok(removed)
    }

    /// Overwrite the stored status without fencing, as an external writer
    /// would. Bumps the version and notifies watchers.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the Echo does not exist.
    pub async fn force_status(&self, key: &ObjectKey, status: EchoStatus) -> Result<Echo> {
        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(key)
            .ok_or_else(|| Error::not_found(ResourceKind::Echo, key.clone()))?;
        stored.status = status;
        stored.metadata.resource_version = self.next_version();
        let updated = stored.clone();
        drop(objects);

        self.publish(ChangeKind::StatusChanged, &updated);
        Ok(updated)
    }

    fn next_version(&self) -> ResourceVersion {
        ResourceVersion::new(self.version.fetch_add(1, Ordering::SeqCst).saturating_add(1))
    }

    fn publish(&self, change: ChangeKind, echo: &Echo) {
        if let Some(bus) = &self.bus {
            bus.publish(WatchEvent::echo(change, echo.key(), echo.metadata.uid));
        }
    }
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get(&self, key: &ObjectKey) -> Result<Echo> {
        self.faults.check("get").await?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::Echo, key.clone()))
    }

    async fn update_status(&self, echo: &Echo) -> Result<Echo> {
        self.faults.check("update_status").await?;
        let key = echo.key();

        let mut objects = self.objects.write().await;
        let stored = objects
            .get_mut(&key)
            .ok_or_else(|| Error::not_found(ResourceKind::Echo, key.clone()))?;

        // A delete and re-create under the same name is a different object.
        if stored.metadata.uid != echo.metadata.uid
            || stored.metadata.resource_version != echo.metadata.resource_version
        {
            return Err(Error::VersionConflict {
                key,
                expected: echo.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }

        stored.status = echo.status.clone();
        stored.metadata.resource_version = self.next_version();
        let updated = stored.clone();
        drop(objects);

        self.status_writes.fetch_add(1, Ordering::SeqCst);
        debug!(
            key = %key,
            version = %updated.metadata.resource_version,
            phase = ?updated.status.phase,
            "Updated Echo status"
        );
        self.publish(ChangeKind::StatusChanged, &updated);
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<Echo>> {
        self.faults.check("list").await?;
        let mut items: Vec<Echo> = self.objects.read().await.values().cloned().collect();
        items.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(items)
    }
}
