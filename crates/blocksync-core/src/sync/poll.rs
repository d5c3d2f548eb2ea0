// ── Poll sources ──
//
// Idempotent, read-only requests the hook issues on an interval (poll
// mode) or once at subscribe time (snapshot bootstrap).

use blocksync_api::RpcClient;
use blocksync_api::feed::Feed;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::CoreError;
use crate::scanner::{DegradeScanner, Predicate, ScanWindow};

/// One read-only JSON fetch.
pub trait PollSource: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'_, Result<Value, CoreError>>;
}

/// Calls a JSON-RPC method with fixed params.
#[derive(Clone)]
pub struct RpcPoll {
    rpc: RpcClient,
    method: String,
    params: Value,
}

impl RpcPoll {
    pub fn new(rpc: RpcClient, method: impl Into<String>, params: Value) -> Self {
        Self {
            rpc,
            method: method.into(),
            params,
        }
    }
}

impl PollSource for RpcPoll {
    fn fetch(&self) -> BoxFuture<'_, Result<Value, CoreError>> {
        Box::pin(async move {
            debug!(method = %self.method, "poll via rpc");
            Ok(self.rpc.call_value(&self.method, &self.params).await?)
        })
    }
}

/// GETs a URL and parses the body as JSON.
#[derive(Clone)]
pub struct HttpPoll {
    http: reqwest::Client,
    url: Url,
}

impl HttpPoll {
    /// `http` should come from `TransportConfig::build_client` so auth and
    /// TLS settings match the RPC client.
    pub fn new(http: reqwest::Client, url: Url) -> Self {
        Self { http, url }
    }
}

impl PollSource for HttpPoll {
    fn fetch(&self) -> BoxFuture<'_, Result<Value, CoreError>> {
        Box::pin(async move {
            debug!(url = %self.url, "poll via http");
            let resp = self
                .http
                .get(self.url.clone())
                .send()
                .await
                .map_err(blocksync_api::Error::from)?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(blocksync_api::Error::Http {
                    status: status.as_u16(),
                    body: body.chars().take(200).collect(),
                }
                .into());
            }
            let body = resp.text().await.map_err(blocksync_api::Error::from)?;
            serde_json::from_str(&body).map_err(|e| {
                blocksync_api::Error::Deserialization {
                    message: e.to_string(),
                    body,
                }
                .into()
            })
        })
    }
}

/// Latest record of a feed matching a predicate, via `DegradeScanner`.
/// Yields `null` when nothing matches.
pub struct LatestRecordPoll<F: Feed> {
    scanner: DegradeScanner,
    feed: F,
    predicate: Predicate<F::Record>,
    window: ScanWindow,
}

impl<F: Feed> LatestRecordPoll<F> {
    pub fn new(
        scanner: DegradeScanner,
        feed: F,
        predicate: Predicate<F::Record>,
        window: ScanWindow,
    ) -> Self {
        Self {
            scanner,
            feed,
            predicate,
            window,
        }
    }
}

impl<F> PollSource for LatestRecordPoll<F>
where
    F: Feed + 'static,
    F::Record: Serialize + 'static,
{
    fn fetch(&self) -> BoxFuture<'_, Result<Value, CoreError>> {
        Box::pin(async move {
            let found = self
                .scanner
                .find_latest(&self.feed, &self.predicate, self.window)
                .await;
            match found {
                Some(record) => serde_json::to_value(record)
                    .map_err(|e| CoreError::Internal(format!("record not serializable: {e}"))),
                None => Ok(Value::Null),
            }
        })
    }
}
