// JSON-RPC 2.0 client over HTTP.
//
// Every read the sync layer makes against the node (probe calls, feed
// queries, poll fallbacks) goes through `RpcClient::call`. Transient
// failures are retried with exponential backoff; auth failures and
// JSON-RPC error objects are returned immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::Error;
use crate::transport::TransportConfig;

/// Retry policy for a single RPC call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first. Default: 3.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry. Default: 2s.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2_u32.saturating_pow(retry))
    }
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a P,
}

#[derive(serde::Deserialize)]
struct RpcErrorObject {
    #[serde(default = "default_error_code")]
    code: i64,
    #[serde(default)]
    message: Option<String>,
}

fn default_error_code() -> i64 {
    -32603
}

/// JSON-RPC 2.0 client for a single node endpoint.
///
/// Cheaply cloneable; clones share the HTTP connection pool and the
/// request-id counter.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    url: Url,
    retry: RetryPolicy,
    /// Per-request timeout baked into `http`, when known.
    timeout: Option<Duration>,
    offline: bool,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Build a client for `url` from a `TransportConfig`.
    pub fn new(url: Url, transport: &TransportConfig, retry: RetryPolicy) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self {
            timeout: Some(transport.timeout),
            ..Self::with_client(http, url, retry)
        })
    }

    /// Wrap an existing `reqwest::Client` (caller manages headers).
    pub fn with_client(http: reqwest::Client, url: Url, retry: RetryPolicy) -> Self {
        let offline = url.port() == Some(0);
        Self {
            http,
            url,
            retry,
            timeout: None,
            offline,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mark this client offline: every call fails fast with [`Error::Offline`]
    /// without touching the network.
    pub fn into_offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// The node endpoint this client talks to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    /// Call `method` with `params` and deserialize the `result` field.
    pub async fn call<T, P>(&self, method: &str, params: &P) -> Result<T, Error>
    where
        T: DeserializeOwned,
        P: Serialize + Sync,
    {
        let value = self.call_value(method, params).await?;
        serde_json::from_value(value.clone()).map_err(|e| Error::Deserialization {
            message: format!("{method}: {e}"),
            body: value.to_string(),
        })
    }

    /// Call `method` and return the raw `result` value.
    pub async fn call_value<P>(&self, method: &str, params: &P) -> Result<Value, Error>
    where
        P: Serialize + Sync,
    {
        if self.offline {
            return Err(Error::Offline);
        }

        let mut retry = 0;
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            match self.send_once(id, method, params).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    let delay = self.retry.delay(retry);
                    retry += 1;
                    warn!(
                        method,
                        error = %e,
                        attempt = retry,
                        max_retries = self.retry.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "RPC call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once<P>(&self, id: u64, method: &str, params: &P) -> Result<Value, Error>
    where
        P: Serialize + Sync,
    {
        debug!(method, id, "POST {}", self.url);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let resp = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport_error(e))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Authentication {
                message: format!("HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(Error::Http {
                status: status.as_u16(),
                body: preview(&body),
            });
        }

        trace!(method, id, len = body.len(), "RPC response body");
        parse_response(&body)
    }

    fn transport_error(&self, err: reqwest::Error) -> Error {
        match self.timeout {
            Some(timeout) if err.is_timeout() => Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            _ => Error::Transport(err),
        }
    }
}

/// Unwrap a JSON-RPC 2.0 response body into its `result`.
fn parse_response(body: &str) -> Result<Value, Error> {
    let mut envelope: serde_json::Map<String, Value> =
        serde_json::from_str(body).map_err(|e| Error::Deserialization {
            message: format!("invalid JSON response: {e}"),
            body: body.to_owned(),
        })?;

    if envelope.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(Error::InvalidResponse(format!(
            "missing jsonrpc 2.0 marker: {}",
            preview(body)
        )));
    }

    if let Some(raw) = envelope.remove("error") {
        if !raw.is_null() {
            let err: RpcErrorObject =
                serde_json::from_value(raw).map_err(|e| Error::InvalidResponse(e.to_string()))?;
            return Err(Error::Rpc {
                code: err.code,
                message: err.message.unwrap_or_else(|| "Unknown error".into()),
            });
        }
    }

    envelope
        .remove("result")
        .ok_or_else(|| Error::InvalidResponse("response missing 'result' field".into()))
}

fn preview(body: &str) -> String {
    body.chars().take(200).collect()
}
