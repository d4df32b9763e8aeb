use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::error::KernelError;
use crate::process::{KernelHandle, KernelOutput, KernelSpec};

/// Stable identifier of a local kernel
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelId(String);

impl KernelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id, usable as a host label
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `id` can route as the `{id}` label of `{id}.{marker}` hosts:
    /// 1-63 lowercase letters, digits, `-` or `_`, not starting or ending in `-`
    pub fn is_routable(id: &str) -> bool {
        !id.is_empty()
            && id.len() <= 63
            && !id.starts_with('-')
            && !id.ends_with('-')
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KernelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for KernelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle events for managed kernels
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelEvent {
    Started { id: KernelId },
    Exited { id: KernelId, exit_code: Option<i32> },
}

/// Summary of a managed kernel
#[derive(Clone, Debug, Serialize)]
pub struct KernelSummary {
    pub id: KernelId,
    pub command: Option<String>,
    pub started_at: DateTime<Utc>,
}

struct ManagedKernel {
    handle: KernelHandle,
    spec: Option<KernelSpec>,
    started_at: DateTime<Utc>,
}

/// Owner of every local kernel's lifetime.
///
/// Consumers borrow `KernelHandle`s; only `shutdown` terminates a process.
#[derive(Clone)]
pub struct KernelManager {
    kernels: Arc<RwLock<HashMap<KernelId, ManagedKernel>>>,
    event_tx: broadcast::Sender<KernelEvent>,
}

impl Default for KernelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelManager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            kernels: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Launch a kernel process and register it under a fresh id
    pub async fn spawn(&self, spec: KernelSpec) -> Result<KernelId, KernelError> {
        let id = KernelId::generate();
        debug!("Spawning kernel {} with command: {}", id, spec.command);

        let handle = KernelHandle::spawn(&spec)?;
        self.insert(id.clone(), handle, Some(spec)).await?;
        Ok(id)
    }

    /// Register a channel created elsewhere (e.g. an in-memory kernel)
    pub async fn register(&self, id: KernelId, handle: KernelHandle) -> Result<(), KernelError> {
        self.insert(id, handle, None).await
    }

    async fn insert(
        &self,
        id: KernelId,
        handle: KernelHandle,
        spec: Option<KernelSpec>,
    ) -> Result<(), KernelError> {
        if !KernelId::is_routable(id.as_str()) {
            return Err(KernelError::InvalidId(id.to_string()));
        }
        {
            let mut kernels = self.kernels.write().await;
            if kernels.contains_key(&id) {
                return Err(KernelError::AlreadyRegistered(id.to_string()));
            }
            kernels.insert(
                id.clone(),
                ManagedKernel {
                    handle: handle.clone(),
                    spec,
                    started_at: Utc::now(),
                },
            );
        }

        // Forget the kernel once it exits
        let mut output_rx = handle.subscribe();
        let kernels = self.kernels.clone();
        let event_tx = self.event_tx.clone();
        let watch_id = id.clone();
        tokio::spawn(async move {
            loop {
                match output_rx.recv().await {
                    Ok(KernelOutput::Exited { exit_code }) => {
                        kernels.write().await.remove(&watch_id);
                        info!("Kernel {} exited (code {:?})", watch_id, exit_code);
                        let _ = event_tx.send(KernelEvent::Exited {
                            id: watch_id,
                            exit_code,
                        });
                        break;
                    }
                    Ok(KernelOutput::Frame { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let _ = self.event_tx.send(KernelEvent::Started { id });
        Ok(())
    }

    /// Handle to a live kernel's channel
    pub async fn handle(&self, id: &KernelId) -> Option<KernelHandle> {
        self.kernels.read().await.get(id).map(|k| k.handle.clone())
    }

    /// Terminate a kernel and forget it
    pub async fn shutdown(&self, id: &KernelId) -> Result<(), KernelError> {
        let managed = self
            .kernels
            .write()
            .await
            .remove(id)
            .ok_or_else(|| KernelError::NotFound(id.to_string()))?;
        info!("Shutting down kernel {}", id);
        managed.handle.kill(None).await
    }

    /// Terminate every managed kernel
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<(KernelId, ManagedKernel)> =
            self.kernels.write().await.drain().collect();
        let count = drained.len();
        for (id, managed) in drained {
            if let Err(e) = managed.handle.kill(None).await {
                warn!("Failed to stop kernel {} during shutdown: {}", id, e);
            }
        }
        count
    }

    /// Forget a kernel without signalling it
    pub async fn remove(&self, id: &KernelId) -> bool {
        self.kernels.write().await.remove(id).is_some()
    }

    pub async fn list(&self) -> Vec<KernelSummary> {
        let kernels = self.kernels.read().await;
        let mut list: Vec<KernelSummary> = kernels
            .iter()
            .map(|(id, k)| KernelSummary {
                id: id.clone(),
                command: k.spec.as_ref().map(|s| s.command.clone()),
                started_at: k.started_at,
            })
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    pub async fn exists(&self, id: &KernelId) -> bool {
        self.kernels.read().await.contains_key(id)
    }

    /// Subscribe to kernel lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.event_tx.subscribe()
    }
}
