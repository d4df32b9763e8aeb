use anyhow::{Context, Result};
use kernel_channel::KernelSpec;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
//   config.toml:     [bridge]
//                    local_marker = "localkernel"
//
//   env var:         KBRIDGE_BRIDGE__LOCAL_MARKER=localkernel   (double underscore = nesting)

pub const ENV_PREFIX: &str = "KBRIDGE_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub kernel: KernelFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Bridge behavior (lives under `[bridge]` in config.toml).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeFileConfig {
    /// Host suffix reserved for local kernels: `{kernel_id}.{local_marker}`
    #[serde(default = "default_local_marker")]
    pub local_marker: String,
    /// Per-surface outbound event queue
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default = "default_remote_connect_timeout_secs")]
    pub remote_connect_timeout_secs: u64,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            local_marker: default_local_marker(),
            event_channel_capacity: default_event_channel_capacity(),
            remote_connect_timeout_secs: default_remote_connect_timeout_secs(),
        }
    }
}

/// Default launch command for `POST /api/local-kernels` (lives under `[kernel]`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelFileConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8888
}
fn default_local_marker() -> String {
    "localkernel".to_string()
}
fn default_event_channel_capacity() -> usize {
    256
}
fn default_remote_connect_timeout_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → config.toml → KBRIDGE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `KBRIDGE_SERVER__PORT=9000`  →  `server.port = 9000`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// `$XDG_CONFIG_HOME/kernel-bridge` or the platform equivalent
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-bridge")
}

// =============================================================================
// Runtime config (derived from FileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone(),
            port: fc.port,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub local_marker: String,
    pub event_channel_capacity: usize,
    pub remote_connect_timeout: Duration,
    pub default_kernel: Option<KernelSpec>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl BridgeConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            local_marker: fc.bridge.local_marker.clone(),
            // tokio channels reject a zero capacity
            event_channel_capacity: fc.bridge.event_channel_capacity.max(1),
            remote_connect_timeout: Duration::from_secs(fc.bridge.remote_connect_timeout_secs),
            default_kernel: fc.kernel.command.as_ref().map(|command| KernelSpec {
                command: command.clone(),
                args: fc.kernel.args.clone(),
                working_dir: fc.kernel.working_dir.clone(),
                env: vec![],
            }),
        }
    }
}
