//! Reference-counted sharing of local kernel channels between connections.

use kernel_channel::{KernelId, KernelManager};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::local_adapter::{EventSink, LocalKernelAdapter};
use crate::metrics::BridgeMetrics;

/// One live kernel channel and the number of connections bound to it
struct KernelChannel {
    adapter: Arc<LocalKernelAdapter>,
    ref_count: usize,
}

/// `connection_id -> kernel_id` and `kernel_id -> channel`.
///
/// A channel is present iff its `ref_count > 0`.
#[derive(Default)]
struct ConnectionRegistry {
    connections: HashMap<String, KernelId>,
    channels: HashMap<KernelId, KernelChannel>,
}

/// Result of binding a connection to a kernel
#[derive(Debug, Clone)]
pub struct Acquired {
    pub adapter: Arc<LocalKernelAdapter>,
    /// The channel was already live before this acquire
    pub reused: bool,
}

/// Shares one adapter per kernel among every connection targeting it.
///
/// Kernel processes are borrowed from the `KernelManager` and are never
/// terminated here.
#[derive(Clone)]
pub struct ConnectionMultiplexer {
    kernels: KernelManager,
    registry: Arc<Mutex<ConnectionRegistry>>,
    metrics: Arc<BridgeMetrics>,
}

impl ConnectionMultiplexer {
    pub fn new(kernels: KernelManager, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            kernels,
            registry: Arc::new(Mutex::new(ConnectionRegistry::default())),
            metrics,
        }
    }

    pub fn kernels(&self) -> &KernelManager {
        &self.kernels
    }

    /// Bind a connection to a kernel, creating the kernel's channel if needed
    pub async fn acquire(
        &self,
        kernel_id: &KernelId,
        connection_id: &str,
        sink: EventSink,
    ) -> Result<Acquired> {
        let mut registry = self.registry.lock().await;
        if registry.connections.contains_key(connection_id) {
            return Err(BridgeError::DuplicateConnection(connection_id.to_string()));
        }

        // A channel is only reused while it is live and still bound to the
        // kernel currently registered under this id
        let current = self.kernels.handle(kernel_id).await;
        let live = registry.channels.get_mut(kernel_id).and_then(|channel| {
            let usable = !channel.adapter.is_closed()
                && current
                    .as_ref()
                    .is_some_and(|handle| channel.adapter.handle().same_channel(handle));
            usable.then(|| {
                channel.ref_count += 1;
                channel.adapter.clone()
            })
        });

        let (adapter, reused) = match live {
            Some(adapter) => (adapter, true),
            None => {
                let handle = current.ok_or_else(|| BridgeError::KernelUnavailable {
                    kernel_id: kernel_id.to_string(),
                })?;
                let adapter = Arc::new(LocalKernelAdapter::new(
                    kernel_id.clone(),
                    handle,
                    self.metrics.clone(),
                ));
                match registry.channels.get_mut(kernel_id) {
                    // Connections bound to the dead channel stay counted until released
                    Some(channel) => {
                        channel.adapter.close();
                        channel.adapter = adapter.clone();
                        channel.ref_count += 1;
                        self.metrics.channel_torn_down();
                        info!(kernel_id = %kernel_id, "Replaced closed kernel channel");
                    }
                    None => {
                        registry.channels.insert(
                            kernel_id.clone(),
                            KernelChannel {
                                adapter: adapter.clone(),
                                ref_count: 1,
                            },
                        );
                        info!(kernel_id = %kernel_id, "Kernel channel created");
                    }
                }
                self.metrics.channel_created();
                (adapter, false)
            }
        };

        adapter.attach(connection_id, sink).await;
        registry
            .connections
            .insert(connection_id.to_string(), kernel_id.clone());

        debug!(
            kernel_id = %kernel_id,
            connection_id,
            reused,
            "Connection acquired kernel channel"
        );
        Ok(Acquired { adapter, reused })
    }

    /// Unbind a connection. Unknown ids are ignored.
    ///
    /// Returns whether the connection was bound.
    pub async fn release(&self, connection_id: &str) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(kernel_id) = registry.connections.remove(connection_id) else {
            return false;
        };

        let Some(channel) = registry.channels.get_mut(&kernel_id) else {
            return true;
        };
        channel.adapter.detach(connection_id).await;
        channel.ref_count = channel.ref_count.saturating_sub(1);
        debug!(
            kernel_id = %kernel_id,
            connection_id,
            ref_count = channel.ref_count,
            "Connection released kernel channel"
        );

        if channel.ref_count == 0 {
            if let Some(channel) = registry.channels.remove(&kernel_id) {
                channel.adapter.close();
            }
            self.metrics.channel_torn_down();
            info!(kernel_id = %kernel_id, "Kernel channel torn down");
        }
        true
    }

    /// Forward a client envelope on a bound connection
    pub async fn send(&self, connection_id: &str, envelope: &Envelope) -> Result<()> {
        let adapter = self
            .adapter_for(connection_id)
            .await
            .ok_or_else(|| BridgeError::UnknownConnection(connection_id.to_string()))?;
        adapter.send(connection_id, envelope).await
    }

    pub async fn adapter_for(&self, connection_id: &str) -> Option<Arc<LocalKernelAdapter>> {
        let registry = self.registry.lock().await;
        let kernel_id = registry.connections.get(connection_id)?;
        registry.channels.get(kernel_id).map(|c| c.adapter.clone())
    }

    pub async fn kernel_for(&self, connection_id: &str) -> Option<KernelId> {
        self.registry
            .lock()
            .await
            .connections
            .get(connection_id)
            .cloned()
    }

    pub async fn has_channel(&self, kernel_id: &KernelId) -> bool {
        self.registry.lock().await.channels.contains_key(kernel_id)
    }

    pub async fn ref_count(&self, kernel_id: &KernelId) -> usize {
        self.registry
            .lock()
            .await
            .channels
            .get(kernel_id)
            .map(|c| c.ref_count)
            .unwrap_or(0)
    }

    pub async fn channel_count(&self) -> usize {
        self.registry.lock().await.channels.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.lock().await.connections.len()
    }
}
