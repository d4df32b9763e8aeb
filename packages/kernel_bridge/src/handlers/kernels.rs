use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kernel_channel::{KernelError, KernelId, KernelSpec, KernelSummary};
use serde::{Deserialize, Serialize};

use crate::app::AppState;

pub async fn list_kernels(State(state): State<AppState>) -> Json<Vec<KernelSummary>> {
    Json(state.bridge.kernels().list().await)
}

/// Body of `POST /api/local-kernels`; every field falls back to `[kernel]` config
#[derive(Debug, Default, Deserialize)]
pub struct LaunchKernelRequest {
    command: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    working_dir: Option<String>,
    #[serde(default)]
    env: Vec<(String, String)>,
}

#[derive(Debug, Serialize)]
pub struct LaunchKernelResponse {
    id: KernelId,
    /// Host to target from the notebook client: `{id}.{local_marker}`
    host: String,
}

pub async fn launch_kernel(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<LaunchKernelResponse>), (StatusCode, String)> {
    let req: LaunchKernelRequest = if body.is_empty() {
        LaunchKernelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid request: {}", e)))?
    };

    let spec = resolve_spec(req, state.bridge.config.default_kernel.as_ref()).ok_or((
        StatusCode::BAD_REQUEST,
        "No kernel command given and none configured".to_string(),
    ))?;

    match state.bridge.kernels().spawn(spec).await {
        Ok(id) => {
            let host = format!("{}.{}", id, state.bridge.router.local_marker());
            Ok((StatusCode::CREATED, Json(LaunchKernelResponse { id, host })))
        }
        Err(e) => {
            tracing::error!("Failed to launch kernel: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to launch kernel: {}", e),
            ))
        }
    }
}

fn resolve_spec(req: LaunchKernelRequest, default: Option<&KernelSpec>) -> Option<KernelSpec> {
    match (req.command, default) {
        (Some(command), _) => Some(KernelSpec {
            command,
            args: req.args.unwrap_or_default(),
            working_dir: req.working_dir,
            env: req.env,
        }),
        (None, Some(default)) => Some(KernelSpec {
            command: default.command.clone(),
            args: req.args.unwrap_or_else(|| default.args.clone()),
            working_dir: req.working_dir.or_else(|| default.working_dir.clone()),
            env: req.env,
        }),
        (None, None) => None,
    }
}

pub async fn shutdown_kernel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.bridge.kernels().shutdown(&KernelId::new(id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(KernelError::NotFound(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_spec() -> KernelSpec {
        KernelSpec {
            command: "python3".into(),
            args: vec!["-m".into(), "kernel".into()],
            working_dir: Some("/srv".into()),
            env: vec![],
        }
    }

    #[test]
    fn request_command_wins() {
        let req = LaunchKernelRequest {
            command: Some("julia".into()),
            ..Default::default()
        };
        let spec = resolve_spec(req, Some(&default_spec())).unwrap();
        assert_eq!(spec.command, "julia");
        assert!(spec.args.is_empty());
        assert_eq!(spec.working_dir, None);
    }

    #[test]
    fn config_fills_missing_fields() {
        let req = LaunchKernelRequest {
            working_dir: Some("/tmp".into()),
            ..Default::default()
        };
        let spec = resolve_spec(req, Some(&default_spec())).unwrap();
        assert_eq!(spec.command, "python3");
        assert_eq!(spec.args, vec!["-m", "kernel"]);
        assert_eq!(spec.working_dir.as_deref(), Some("/tmp"));
    }

    #[test]
    fn nothing_to_launch() {
        assert!(resolve_spec(LaunchKernelRequest::default(), None).is_none());
    }

    mod routes {
        use super::*;
        use crate::config::BridgeConfig;
        use crate::metrics::BridgeMetrics;
        use crate::surface::BridgeContext;
        use axum::{
            Router,
            body::Body,
            http::Request,
            routing::{delete, get},
        };
        use kernel_channel::{KernelHandle, KernelManager, KernelPeer};
        use std::sync::Arc;
        use tower::ServiceExt;

        async fn test_router() -> (Router, KernelPeer) {
            let manager = KernelManager::new();
            let (handle, peer) = KernelHandle::in_memory();
            manager.register("k1".into(), handle).await.unwrap();
            let bridge = BridgeContext::new(
                manager,
                BridgeConfig::default(),
                Arc::new(BridgeMetrics::new()),
            );
            let router = Router::new()
                .route("/kernels", get(list_kernels).post(launch_kernel))
                .route("/kernels/{id}", delete(shutdown_kernel))
                .with_state(AppState { bridge });
            (router, peer)
        }

        #[tokio::test]
        async fn test_list_kernels() {
            let (app, _peer) = test_router().await;
            let resp = app
                .oneshot(Request::builder().uri("/kernels").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);

            let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
                .await
                .unwrap();
            let kernels: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(kernels[0]["id"], "k1");
        }

        #[tokio::test]
        async fn test_shutdown_unknown_kernel() {
            let (app, _peer) = test_router().await;
            let resp = app
                .oneshot(
                    Request::builder()
                        .method("DELETE")
                        .uri("/kernels/nope")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn test_launch_rejects_bad_body() {
            let (app, _peer) = test_router().await;
            let resp = app
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/kernels")
                        .body(Body::from("{not json"))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        }
    }
}
