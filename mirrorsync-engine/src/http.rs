//! Blocking HTTP implementation of [`RemoteClient`], run on the blocking pool.
//!
//! Status classification:
//! - 2xx → `Ok` (JSON body, or `null` when empty)
//! - 429 → `RateLimited` (honouring a numeric `Retry-After`)
//! - 408, 5xx, transport failures → `TransientError`
//! - any other 4xx → `PermanentError`
//!
//! Error details carry the status code only; response bodies are never
//! forwarded.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use mirrorsync_core::RemoteTarget;

use crate::remote::{OperationResult, RemoteClient, RemoteOperation};

/// Header carrying the API token resolved from the target's credential handle.
pub const TOKEN_HEADER: &str = "PRIVATE-TOKEN";

pub struct HttpRemoteClient {
    agent: ureq::Agent,
}

impl HttpRemoteClient {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl Default for HttpRemoteClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn invoke(&self, target: &RemoteTarget, operation: &RemoteOperation) -> OperationResult {
        let agent = self.agent.clone();
        let url = format!(
            "{}{}",
            target.base_url.trim_end_matches('/'),
            operation.path()
        );
        let method = operation.method();
        let body = operation.body();
        let token = std::env::var(&target.credential.0).ok();

        let joined = tokio::task::spawn_blocking(move || {
            send(&agent, method, &url, token.as_deref(), body)
        })
        .await;
        match joined {
            Ok(result) => result,
            Err(err) => OperationResult::TransientError(format!("request task failed: {err}")),
        }
    }
}

fn send(
    agent: &ureq::Agent,
    method: &str,
    url: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> OperationResult {
    let mut request = agent.request(method, url).set("Accept", "application/json");
    if let Some(token) = token {
        request = request.set(TOKEN_HEADER, token);
    }
    let response = match body {
        Some(body) => request.send_json(body),
        None => request.call(),
    };

    match response {
        Ok(response) => {
            let next_page = response
                .header("X-Next-Page")
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = match response.into_string() {
                Ok(text) => text,
                Err(err) => {
                    return OperationResult::TransientError(format!("reading response: {}", err.kind()))
                }
            };
            let mut payload = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::Null)
            };
            if let (Some(next), Value::Object(map)) = (next_page, &mut payload) {
                map.entry("next_page").or_insert(Value::from(next));
            }
            OperationResult::Ok(payload)
        }
        Err(ureq::Error::Status(code, response)) => {
            classify_status(code, response.header("Retry-After"))
        }
        Err(ureq::Error::Transport(transport)) => {
            OperationResult::TransientError(format!("transport error: {}", transport.kind()))
        }
    }
}

/// Map a non-2xx status code to an [`OperationResult`].
pub fn classify_status(code: u16, retry_after: Option<&str>) -> OperationResult {
    match code {
        429 => OperationResult::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        408 | 500..=599 => OperationResult::TransientError(format!("HTTP {code}")),
        _ => OperationResult::PermanentError(format!("HTTP {code}")),
    }
}
