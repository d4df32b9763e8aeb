//! Bridge metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Bridge-wide counters
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    // Surfaces
    pub active_surfaces: AtomicU64,
    pub total_surfaces: AtomicU64,

    // Connections
    pub local_connections_opened: AtomicU64,
    pub remote_connections_opened: AtomicU64,
    /// Local connections closed for not keeping up with kernel output
    pub connections_cut_off: AtomicU64,

    // Kernel channels
    pub channels_created: AtomicU64,
    pub channels_torn_down: AtomicU64,

    // Envelopes
    /// Client envelopes written to a kernel
    pub envelopes_to_kernel: AtomicU64,
    /// Kernel envelopes delivered to connections (one per copy)
    pub envelopes_from_kernel: AtomicU64,
    pub malformed_envelopes: AtomicU64,
    pub send_failures: AtomicU64,

    // HTTP
    pub rest_emulations: AtomicU64,
    pub remote_http_requests: AtomicU64,

    start_time: Option<Instant>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn surface_opened(&self) {
        self.active_surfaces.fetch_add(1, Ordering::Relaxed);
        self.total_surfaces.fetch_add(1, Ordering::Relaxed);
    }

    pub fn surface_closed(&self) {
        self.active_surfaces.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn local_connection_opened(&self) {
        self.local_connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_connection_opened(&self) {
        self.remote_connections_opened
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_cut_off(&self) {
        self.connections_cut_off.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_created(&self) {
        self.channels_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_torn_down(&self) {
        self.channels_torn_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelope_to_kernel(&self) {
        self.envelopes_to_kernel.fetch_add(1, Ordering::Relaxed);
    }

    pub fn envelopes_from_kernel(&self, copies: u64) {
        self.envelopes_from_kernel
            .fetch_add(copies, Ordering::Relaxed);
    }

    pub fn malformed_envelope(&self) {
        self.malformed_envelopes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rest_emulation(&self) {
        self.rest_emulations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remote_http_request(&self) {
        self.remote_http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let created = load(&self.channels_created);
        let torn_down = load(&self.channels_torn_down);
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            surfaces: SurfaceMetrics {
                active: load(&self.active_surfaces),
                total: load(&self.total_surfaces),
            },
            connections: ConnectionMetrics {
                local_opened: load(&self.local_connections_opened),
                remote_opened: load(&self.remote_connections_opened),
                cut_off: load(&self.connections_cut_off),
            },
            channels: ChannelMetrics {
                active: created.saturating_sub(torn_down),
                created,
                torn_down,
            },
            envelopes: EnvelopeMetrics {
                to_kernel: load(&self.envelopes_to_kernel),
                from_kernel: load(&self.envelopes_from_kernel),
                malformed: load(&self.malformed_envelopes),
                send_failures: load(&self.send_failures),
            },
            http: HttpMetrics {
                emulated: load(&self.rest_emulations),
                relayed: load(&self.remote_http_requests),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub surfaces: SurfaceMetrics,
    pub connections: ConnectionMetrics,
    pub channels: ChannelMetrics,
    pub envelopes: EnvelopeMetrics,
    pub http: HttpMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub local_opened: u64,
    pub remote_opened: u64,
    pub cut_off: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub active: u64,
    pub created: u64,
    pub torn_down: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeMetrics {
    pub to_kernel: u64,
    pub from_kernel: u64,
    pub malformed: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpMetrics {
    pub emulated: u64,
    pub relayed: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub kernels: u64,
    pub channels: u64,
    pub surfaces: u64,
    pub uptime_secs: u64,
}
