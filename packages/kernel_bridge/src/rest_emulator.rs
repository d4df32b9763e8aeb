//! Canned Jupyter REST responses for local kernels.
//!
//! A notebook client bootstraps through `/api/sessions` and `/api/kernels`
//! before it opens the kernel WebSocket. Local kernels are already running,
//! so these calls only need answers of the right shape. Nothing here has side
//! effects; the session id is the kernel id.

use chrono::Utc;
use serde_json::{Value, json};
use std::collections::BTreeMap;

const DEFAULT_KERNEL_NAME: &str = "python3";
const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatedResponse {
    pub status: u16,
    pub body: Option<Vec<u8>>,
    pub content_type: Option<&'static str>,
}

impl EmulatedResponse {
    fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            body: Some(value.to_string().into_bytes()),
            content_type: Some(JSON_CONTENT_TYPE),
        }
    }

    /// 204 carries neither body nor content type
    fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
            content_type: None,
        }
    }

    pub fn headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        if let Some(content_type) = self.content_type {
            headers.insert("content-type".to_string(), content_type.to_string());
        }
        headers
    }

    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn body_json(&self) -> Option<Value> {
        self.body
            .as_ref()
            .and_then(|b| serde_json::from_slice(b).ok())
    }
}

/// Answer one REST call made against a local kernel host
pub fn emulate(method: &str, path: &str, kernel_id: &str, body: Option<&str>) -> EmulatedResponse {
    let path = strip_query(path);
    let request: Value = body
        .and_then(|b| serde_json::from_str(b).ok())
        .unwrap_or(Value::Null);
    let method = method.to_ascii_uppercase();

    match method.as_str() {
        "POST" if is_exact(path, "/api/sessions") => {
            EmulatedResponse::json(201, &session_model(kernel_id, &request))
        }
        "DELETE" if is_under(path, "/api/sessions") => EmulatedResponse::no_content(),
        "GET" if is_under(path, "/api/sessions") => {
            EmulatedResponse::json(200, &json!([session_model(kernel_id, &Value::Null)]))
        }
        "POST" if is_exact(path, "/api/kernels") => {
            let name = request.get("name").and_then(Value::as_str);
            EmulatedResponse::json(201, &kernel_model(kernel_id, name))
        }
        "GET" if is_exact(path, "/api/kernels") => {
            EmulatedResponse::json(200, &json!([kernel_model(kernel_id, None)]))
        }
        "GET" if is_kernel_resource(path) => {
            EmulatedResponse::json(200, &kernel_model(kernel_id, None))
        }
        _ => EmulatedResponse::json(200, &json!({})),
    }
}

fn kernel_model(kernel_id: &str, name: Option<&str>) -> Value {
    json!({
        "id": kernel_id,
        "name": name.unwrap_or(DEFAULT_KERNEL_NAME),
        "last_activity": Utc::now().to_rfc3339(),
        "execution_state": "idle",
        "connections": 1,
    })
}

fn session_model(kernel_id: &str, request: &Value) -> Value {
    let field = |key: &str| request.get(key).and_then(Value::as_str);
    let kernel_name = request
        .get("kernel")
        .and_then(|k| k.get("name"))
        .and_then(Value::as_str);

    json!({
        "id": kernel_id,
        "path": field("path").unwrap_or(""),
        "name": field("name").unwrap_or(""),
        "type": field("type").unwrap_or("notebook"),
        "kernel": kernel_model(kernel_id, kernel_name),
    })
}

fn strip_query(path: &str) -> &str {
    path.split(['?', '#']).next().unwrap_or(path)
}

fn is_exact(path: &str, endpoint: &str) -> bool {
    path.trim_end_matches('/') == endpoint
}

fn is_under(path: &str, endpoint: &str) -> bool {
    path.starts_with(endpoint)
}

/// `/api/kernels/{id}`, exactly one segment deep
fn is_kernel_resource(path: &str) -> bool {
    path.trim_end_matches('/')
        .strip_prefix("/api/kernels/")
        .is_some_and(|id| !id.is_empty() && !id.contains('/'))
}
