//! Classification of target URLs into local-kernel and remote routes.

use kernel_channel::KernelId;
use url::Url;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `{scheme}://{kernel_id}.{local_marker}/...`
    Local { kernel_id: KernelId, url: Url },
    Remote { url: Url },
}

impl Route {
    pub fn url(&self) -> &Url {
        match self {
            Route::Local { url, .. } | Route::Remote { url } => url,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Route::Local { .. })
    }
}

/// Stateless URL classifier
#[derive(Debug, Clone)]
pub struct TransportRouter {
    local_marker: String,
}

impl TransportRouter {
    pub fn new(local_marker: impl Into<String>) -> Self {
        Self {
            local_marker: local_marker.into().trim_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn local_marker(&self) -> &str {
        &self.local_marker
    }

    pub fn classify(&self, target: &str) -> Result<Route> {
        let url = Url::parse(target)
            .map_err(|e| BridgeError::unroutable(target, format!("invalid URL: {}", e)))?;

        match url.scheme() {
            "ws" | "wss" | "http" | "https" => {}
            other => {
                return Err(BridgeError::unroutable(
                    target,
                    format!("unsupported scheme '{}'", other),
                ));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| BridgeError::unroutable(target, "URL has no host"))?
            .to_ascii_lowercase();

        if host == self.local_marker {
            return Err(BridgeError::unroutable(
                target,
                "local kernel URL is missing the kernel id",
            ));
        }

        let suffix = format!(".{}", self.local_marker);
        let Some(label) = host.strip_suffix(&suffix) else {
            return Ok(Route::Remote { url });
        };

        if !KernelId::is_routable(label) {
            return Err(BridgeError::unroutable(
                target,
                format!("'{}' is not a valid kernel id", label),
            ));
        }

        Ok(Route::Local {
            kernel_id: KernelId::new(label),
            url,
        })
    }
}
