// ── Built-in probes ──
//
// Read-only health checks against a node's JSON-RPC surface. Each one
// classifies a handful of counters into ok / warn / error and returns the
// numbers it looked at as step data.

use blocksync_api::{ReceiptFeed, ReceiptRecord, RpcClient};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{ProbeBoard, ProbeOutcome, ProbeStatus, board::Probe};
use crate::config::{ProbeConfig, ScannerConfig};
use crate::error::CoreError;
use crate::scanner::{DegradeScanner, Predicate};

/// Digest and size of a file the caller intends to store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHint {
    pub sha256: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Optional hints passed to every probe of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeContext {
    /// Domain for the reachability preflight.
    pub domain: Option<String>,
    /// File for the storage contract preview.
    pub file: Option<FileHint>,
    /// Market to narrow the receipt tail to.
    pub market: Option<String>,
    pub storage_duration_epochs: u32,
}

impl Default for ProbeContext {
    fn default() -> Self {
        Self {
            domain: None,
            file: None,
            market: None,
            storage_duration_epochs: 8,
        }
    }
}

impl ProbeBoard {
    /// The standard battery, in report order: consensus, peers, markets,
    /// scheduler, receipts, storage_probe, domain_probe.
    pub fn builtin(rpc: &RpcClient, config: &ProbeConfig, scanner: &ScannerConfig) -> Self {
        Self::new(config)
            .with_probe(ConsensusProbe::new(rpc.clone()))
            .with_probe(PeersProbe::new(rpc.clone()))
            .with_probe(MarketsProbe::new(rpc.clone()))
            .with_probe(SchedulerProbe::new(rpc.clone()))
            .with_probe(ReceiptsProbe::new(
                ReceiptFeed::new(rpc.clone()),
                DegradeScanner::new(scanner.clone()),
            ))
            .with_probe(StoragePreviewProbe::new(rpc.clone()))
            .with_probe(DomainProbe::new(rpc.clone()))
    }
}

// ── Field helpers ────────────────────────────────────────────────────

/// First of `keys` holding a number, as u64. Negative values read as 0.
fn count(value: &Value, keys: &[&str]) -> u64 {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| {
            v.as_u64()
                .or_else(|| v.as_i64().map(|_| 0))
                .or_else(|| v.as_f64().map(float_to_count))
        })
        .unwrap_or(0)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn float_to_count(f: f64) -> u64 {
    if f.is_finite() && f > 0.0 { f as u64 } else { 0 }
}

/// First of `keys` that is present and not null.
fn field(value: &Value, keys: &[&str]) -> Value {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null)
}

fn tiered(value: u64, ok_below: u64, warn_below: u64) -> ProbeStatus {
    if value < ok_below {
        ProbeStatus::Ok
    } else if value < warn_below {
        ProbeStatus::Warn
    } else {
        ProbeStatus::Error
    }
}

fn at_least(value: u64, ok_from: u64, warn_from: u64) -> ProbeStatus {
    if value >= ok_from {
        ProbeStatus::Ok
    } else if value >= warn_from {
        ProbeStatus::Warn
    } else {
        ProbeStatus::Error
    }
}

fn no_params() -> Value {
    Value::Object(Map::new())
}

// ── consensus ────────────────────────────────────────────────────────

/// Finality lag between the latest header and the finalized height.
pub struct ConsensusProbe {
    rpc: RpcClient,
}

impl ConsensusProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl Probe for ConsensusProbe {
    fn id(&self) -> &str {
        "consensus"
    }

    fn label(&self) -> &str {
        "Finality + block height"
    }

    fn run<'a>(&'a self, _ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>> {
        Box::pin(async move {
            let params = no_params();
            let (header, finality) = tokio::try_join!(
                self.rpc.call_value("light.latest_header", &params),
                self.rpc.call_value("consensus.finality_status", &params),
            )?;

            let height = count(&header, &["number", "block_height"]);
            let finalized = count(&finality, &["finalized_height", "finalized"]);
            let lag = height.saturating_sub(finalized);
            let mut finality_time = field(&finality, &["finality_time"]);
            if finality_time.is_null() {
                finality_time = field(&header, &["finality_time"]);
            }

            Ok(ProbeOutcome::new(
                tiered(lag, 10, 50),
                json!({
                    "block_height": height,
                    "finalized_height": finalized,
                    "lag_blocks": lag,
                    "finality_time": finality_time,
                }),
            ))
        })
    }
}

// ── peers ────────────────────────────────────────────────────────────

/// Peer count plus network latency and bandwidth.
pub struct PeersProbe {
    rpc: RpcClient,
}

impl PeersProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl Probe for PeersProbe {
    fn id(&self) -> &str {
        "peers"
    }

    fn label(&self) -> &str {
        "Peer + latency"
    }

    fn run<'a>(&'a self, _ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>> {
        Box::pin(async move {
            let params = no_params();
            let (peers, stats) = tokio::try_join!(
                self.rpc.call_value("net.peers", &params),
                self.rpc.call_value("net.stats", &params),
            )?;

            let peer_count = peers
                .get("peers")
                .and_then(Value::as_array)
                .or_else(|| peers.as_array())
                .map_or(0, Vec::len);
            let peer_count = u64::try_from(peer_count).unwrap_or(u64::MAX);

            Ok(ProbeOutcome::new(
                at_least(peer_count, 20, 5),
                json!({
                    "peers": peer_count,
                    "avg_latency_ms": count(&stats, &["avg_latency_ms", "latency_ms"]),
                    "bandwidth_in": field(&stats, &["bandwidth_in"]),
                    "bandwidth_out": field(&stats, &["bandwidth_out"]),
                }),
            ))
        })
    }
}

// ── markets ──────────────────────────────────────────────────────────

const MARKETS: [(&str, &str); 4] = [
    ("compute", "compute_market.stats"),
    ("storage", "storage.stats"),
    ("energy", "energy.market_state"),
    ("ad", "ad_market.stats"),
];

/// Health of the four markets. A market is healthy when its stats call
/// succeeds with a non-null body that does not say `"unavailable"`.
pub struct MarketsProbe {
    rpc: RpcClient,
}

impl MarketsProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }

    async fn market(&self, method: &str) -> (bool, Value) {
        match self.rpc.call_value(method, &no_params()).await {
            Ok(Value::Null) => (false, json!({ "status": "idle", "stats": Value::Null })),
            Ok(stats) if stats.get("status").and_then(Value::as_str) == Some("unavailable") => {
                (false, json!({ "status": "error", "stats": stats }))
            }
            Ok(stats) => (true, json!({ "status": "healthy", "stats": stats })),
            Err(e) => (false, json!({ "status": "error", "error": e.to_string() })),
        }
    }
}

impl Probe for MarketsProbe {
    fn id(&self) -> &str {
        "markets"
    }

    fn label(&self) -> &str {
        "Compute/Storage/Energy/Ad health"
    }

    fn run<'a>(&'a self, _ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>> {
        Box::pin(async move {
            let (compute, storage, energy, ad) = tokio::join!(
                self.market(MARKETS[0].1),
                self.market(MARKETS[1].1),
                self.market(MARKETS[2].1),
                self.market(MARKETS[3].1),
            );

            let mut healthy = 0_u64;
            let mut details = Map::new();
            for ((name, _), (is_healthy, detail)) in MARKETS.iter().zip([compute, storage, energy, ad]) {
                healthy += u64::from(is_healthy);
                details.insert((*name).to_owned(), detail);
            }

            Ok(ProbeOutcome::new(
                at_least(healthy, 3, 1),
                json!({
                    "healthy": healthy,
                    "total": MARKETS.len(),
                    "details": details,
                }),
            ))
        })
    }
}

// ── scheduler ────────────────────────────────────────────────────────

/// Scheduler queue depth and throughput.
pub struct SchedulerProbe {
    rpc: RpcClient,
}

impl SchedulerProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl Probe for SchedulerProbe {
    fn id(&self) -> &str {
        "scheduler"
    }

    fn label(&self) -> &str {
        "Queue + throughput"
    }

    fn run<'a>(&'a self, _ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>> {
        Box::pin(async move {
            let stats = self.rpc.call_value("scheduler.stats", &no_params()).await?;
            let queue_depth = count(&stats, &["pending_operations", "queue_depth"]);

            Ok(ProbeOutcome::new(
                tiered(queue_depth, 100, 500),
                json!({
                    "queue_depth": queue_depth,
                    "avg_wait_time_ms": field(&stats, &["avg_wait_time_ms"]),
                    "processed_per_block": field(&stats, &["ops_per_block"]),
                    "throughput": count(&stats, &["ops_per_second", "throughput"]),
                }),
            ))
        })
    }
}

// ── receipts ─────────────────────────────────────────────────────────

/// Latest receipt on the audit feed, narrowed to `ProbeContext::market`
/// when given. An unreadable feed is an error, an empty one a warning.
pub struct ReceiptsProbe {
    feed: ReceiptFeed,
    scanner: DegradeScanner,
}

impl ReceiptsProbe {
    pub fn new(feed: ReceiptFeed, scanner: DegradeScanner) -> Self {
        Self { feed, scanner }
    }
}

impl Probe for ReceiptsProbe {
    fn id(&self) -> &str {
        "receipts"
    }

    fn label(&self) -> &str {
        "Recent receipts tail"
    }

    fn run<'a>(&'a self, ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>> {
        Box::pin(async move {
            let predicate = match ctx.market.clone() {
                Some(market) => {
                    let hint = market.clone();
                    Predicate::new(move |r: &ReceiptRecord| r.is_market(&market)).with_filter(hint)
                }
                None => Predicate::any(),
            };

            let window = self.scanner.default_window();
            let latest = self.scanner.scan(&self.feed, &predicate, window).await?;

            Ok(match latest {
                Some(hit) => ProbeOutcome::ok(json!({
                    "found": true,
                    "market": ctx.market,
                    "count": hit.page_matches,
                    "latest_height": hit.record.block_height,
                    "receipt_type": hit.record.receipt_type,
                    "digest_hex": hit.record.digest_hex,
                })),
                None => ProbeOutcome::warn(json!({
                    "found": false,
                    "market": ctx.market,
                    "count": 0,
                    "latest_height": 0,
                })),
            })
        })
    }
}

// ── storage_probe ────────────────────────────────────────────────────

/// Storage provider availability plus a preview of the contract the
/// file hint would produce. Never submits anything.
pub struct StoragePreviewProbe {
    rpc: RpcClient,
}

impl StoragePreviewProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

/// Contract preview for `file`; `file_id` is the first 16 hex chars of
/// the digest.
pub fn preview_contract(file: &FileHint, duration_epochs: u32) -> Value {
    let file_id: String = file.sha256.chars().take(16).collect();
    json!({
        "file_id": file_id,
        "data_hash": file.sha256,
        "duration_epochs": duration_epochs,
        "preview_only": true,
        "dry_run": true,
        "size_bytes": file.size_bytes,
    })
}

impl Probe for StoragePreviewProbe {
    fn id(&self) -> &str {
        "storage_probe"
    }

    fn label(&self) -> &str {
        "Storage pipeline preview"
    }

    fn run<'a>(&'a self, ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>> {
        Box::pin(async move {
            let stats = self.rpc.call_value("storage.stats", &no_params()).await?;
            let providers = stats
                .get("providers")
                .and_then(Value::as_array)
                .map_or_else(
                    || count(&stats, &["providers", "provider_count"]),
                    |list| u64::try_from(list.len()).unwrap_or(u64::MAX),
                );
            let preview = ctx
                .file
                .as_ref()
                .map(|file| preview_contract(file, ctx.storage_duration_epochs));

            let status = if providers > 0 {
                ProbeStatus::Ok
            } else {
                ProbeStatus::Warn
            };
            Ok(ProbeOutcome::new(
                status,
                json!({
                    "provider_count": providers,
                    "capacity_used": field(&stats, &["capacity_used"]),
                    "preview_contract": preview,
                }),
            ))
        })
    }
}

// ── domain_probe ─────────────────────────────────────────────────────

const BLOCK_TLD: &str = ".block";

/// Gateway DNS preflight for a `.block` domain.
pub struct DomainProbe {
    rpc: RpcClient,
}

impl DomainProbe {
    pub fn new(rpc: RpcClient) -> Self {
        Self { rpc }
    }
}

impl Probe for DomainProbe {
    fn id(&self) -> &str {
        "domain_probe"
    }

    fn label(&self) -> &str {
        ".block reachability preflight"
    }

    fn run<'a>(&'a self, ctx: &'a ProbeContext) -> BoxFuture<'a, Result<ProbeOutcome, CoreError>> {
        Box::pin(async move {
            let domain = ctx.domain.as_deref().map(str::trim).unwrap_or_default();
            if domain.is_empty() {
                return Ok(ProbeOutcome::skipped(json!({ "note": "no domain provided" })));
            }
            if !domain.ends_with(BLOCK_TLD) {
                return Ok(ProbeOutcome::warn(json!({
                    "domain": domain,
                    "note": "not a .block domain",
                })));
            }

            let lookup = self
                .rpc
                .call_value("gateway.dns_lookup", &json!({ "domain": domain }))
                .await;
            let result = match lookup {
                Ok(result) => result,
                Err(e) => {
                    return Ok(ProbeOutcome::error(json!({
                        "domain": domain,
                        "error": e.to_string(),
                    })));
                }
            };

            let verified = result.get("verified").and_then(Value::as_bool).unwrap_or(false);
            let record = field(&result, &["record"]);
            let has_record = match &record {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Object(m) => !m.is_empty(),
                Value::Array(a) => !a.is_empty(),
                _ => true,
            };
            let status = if verified {
                ProbeStatus::Ok
            } else if has_record {
                ProbeStatus::Warn
            } else {
                ProbeStatus::Error
            };

            Ok(ProbeOutcome::new(
                status,
                json!({
                    "domain": domain,
                    "verified": verified,
                    "record": record,
                }),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn count_prefers_first_present_key() {
        let v = json!({"queue_depth": 7, "pending_operations": 3});
        assert_eq!(count(&v, &["pending_operations", "queue_depth"]), 3);
        assert_eq!(count(&json!({"queue_depth": 7}), &["pending_operations", "queue_depth"]), 7);
        assert_eq!(count(&json!({"x": -4}), &["x"]), 0);
        assert_eq!(count(&json!({"x": 12.9}), &["x"]), 12);
        assert_eq!(count(&json!(null), &["x"]), 0);
    }

    #[test]
    fn thresholds() {
        assert_eq!(tiered(9, 10, 50), ProbeStatus::Ok);
        assert_eq!(tiered(10, 10, 50), ProbeStatus::Warn);
        assert_eq!(tiered(50, 10, 50), ProbeStatus::Error);
        assert_eq!(at_least(20, 20, 5), ProbeStatus::Ok);
        assert_eq!(at_least(5, 20, 5), ProbeStatus::Warn);
        assert_eq!(at_least(4, 20, 5), ProbeStatus::Error);
    }

    #[test]
    fn preview_contract_shape() {
        let file = FileHint {
            sha256: "0123456789abcdef0123456789abcdef".into(),
            size_bytes: Some(2048),
        };
        let preview = preview_contract(&file, 8);
        assert_eq!(preview["file_id"], json!("0123456789abcdef"));
        assert_eq!(preview["preview_only"], json!(true));
        assert_eq!(preview["duration_epochs"], json!(8));
        assert_eq!(preview["size_bytes"], json!(2048));
    }

    #[test]
    fn context_defaults_from_partial_json() {
        let ctx: ProbeContext = serde_json::from_value(json!({"domain": "shop.block"}))
            .unwrap_or_default();
        assert_eq!(ctx.domain.as_deref(), Some("shop.block"));
        assert_eq!(ctx.storage_duration_epochs, 8);
    }
}
