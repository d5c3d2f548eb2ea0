// ── Paginated, time-ordered feeds ──
//
// A feed answers `query({start, end, limit, filter?})` with records in
// ascending order plus a truncation hint. Server-side filtering is
// optional: a feed advertises at most one native filter parameter.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::Error;
use crate::rpc::RpcClient;

/// Server-side filter applied by a feed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    pub param: String,
    pub value: String,
}

/// One page request. Heights are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedQuery {
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub limit: u32,
    pub filter: Option<FeedFilter>,
}

/// One page of ascending records.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage<R> {
    pub records: Vec<R>,
    /// More matching records exist past this page.
    pub truncated: bool,
    /// Where the next page starts, when `truncated`.
    pub next_start: Option<u64>,
}

impl<R> FeedPage<R> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            truncated: false,
            next_start: None,
        }
    }
}

/// A time-ordered external feed.
pub trait Feed: Send + Sync {
    type Record: Send;

    /// Name of the native filter parameter, if the feed has one.
    fn filter_param(&self) -> Option<&str>;

    /// Largest page the feed accepts.
    fn max_limit(&self) -> u32;

    fn query(
        &self,
        query: FeedQuery,
    ) -> impl Future<Output = Result<FeedPage<Self::Record>, Error>> + Send;
}

// ── receipt.audit ────────────────────────────────────────────────────

/// Max receipts per `receipt.audit` page.
pub const RECEIPT_AUDIT_MAX_LIMIT: u32 = 512;

/// One audited receipt. Fields not modelled here land in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub block_height: u64,
    #[serde(default)]
    pub receipt_index: u32,
    /// Market the receipt settles in ("compute", "storage", "energy", "ad", ...).
    #[serde(default)]
    pub receipt_type: String,
    #[serde(default)]
    pub digest_hex: String,
    #[serde(default)]
    pub provider_identity: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReceiptRecord {
    /// Case-insensitive market match.
    pub fn is_market(&self, market: &str) -> bool {
        self.receipt_type.eq_ignore_ascii_case(market)
    }
}

#[derive(Serialize)]
struct AuditParams<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_height: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    market: Option<&'a str>,
}

#[derive(Deserialize)]
struct AuditResponse {
    #[serde(default)]
    receipts: Vec<ReceiptRecord>,
    #[serde(default)]
    truncated: bool,
    #[serde(default)]
    next_start_height: Option<u64>,
}

/// The node's receipt audit trail (`receipt.audit`), filterable by market.
#[derive(Clone)]
pub struct ReceiptFeed {
    rpc: RpcClient,
    provider_id: Option<String>,
}

impl ReceiptFeed {
    pub const FILTER_PARAM: &'static str = "market";

    pub fn new(rpc: RpcClient) -> Self {
        Self {
            rpc,
            provider_id: None,
        }
    }

    /// Restrict every query to one provider.
    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }
}

impl Feed for ReceiptFeed {
    type Record = ReceiptRecord;

    fn filter_param(&self) -> Option<&str> {
        Some(Self::FILTER_PARAM)
    }

    fn max_limit(&self) -> u32 {
        RECEIPT_AUDIT_MAX_LIMIT
    }

    async fn query(&self, query: FeedQuery) -> Result<FeedPage<ReceiptRecord>, Error> {
        let market = match &query.filter {
            Some(filter) if filter.param == Self::FILTER_PARAM => Some(filter.value.as_str()),
            Some(filter) => {
                return Err(Error::FilterUnsupported {
                    param: filter.param.clone(),
                });
            }
            None => None,
        };

        let params = AuditParams {
            limit: query.limit.clamp(1, RECEIPT_AUDIT_MAX_LIMIT),
            start_height: query.start,
            end_height: query.end,
            provider_id: self.provider_id.as_deref(),
            market,
        };
        let resp: AuditResponse = self.rpc.call("receipt.audit", &params).await?;
        debug!(
            count = resp.receipts.len(),
            truncated = resp.truncated,
            filtered = market.is_some(),
            "receipt.audit page"
        );

        Ok(FeedPage {
            records: resp.receipts,
            truncated: resp.truncated,
            next_start: resp.next_start_height,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audit_params_skip_absent_fields() {
        let params = AuditParams {
            limit: 64,
            start_height: Some(10),
            end_height: None,
            provider_id: None,
            market: Some("compute"),
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"limit": 64, "start_height": 10, "market": "compute"})
        );
    }

    #[test]
    fn receipt_keeps_unknown_fields() {
        let record: ReceiptRecord = serde_json::from_value(json!({
            "block_height": 30,
            "receipt_index": 2,
            "receipt_type": "Compute",
            "digest_hex": "ab",
            "amount": 900,
        }))
        .unwrap();
        assert!(record.is_market("compute"));
        assert_eq!(record.extra.get("amount"), Some(&json!(900)));
    }
}
