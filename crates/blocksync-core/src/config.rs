// ── Runtime configuration ──
//
// These types describe how to reach a node and how the sync layer
// behaves. They never touch disk; blocksync-config builds them from the
// on-disk profile and hands them in.

use std::sync::Arc;
use std::time::Duration;

use blocksync_api::{
    Connector, RetryPolicy, RpcClient, StreamConfig, TransportConfig, TungsteniteConnector,
};
use url::Url;

use crate::error::CoreError;
use crate::probe::ScoreWeights;

/// How to reach a single node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// JSON-RPC endpoint (e.g. `http://localhost:9933`).
    pub rpc_url: Url,
    /// Envelope stream endpoint (e.g. `ws://localhost:9944`).
    pub stream_url: Url,
    /// Short-circuit every RPC call without touching the network.
    pub offline: bool,
    pub transport: TransportConfig,
    pub retry: RetryPolicy,
}

impl NodeConfig {
    /// JSON-RPC client honouring the offline flag.
    pub fn rpc_client(&self) -> Result<RpcClient, CoreError> {
        let client = RpcClient::new(self.rpc_url.clone(), &self.transport, self.retry.clone())?;
        Ok(if self.offline {
            client.into_offline()
        } else {
            client
        })
    }

    /// Stream connector carrying the same bearer token as RPC calls.
    pub fn connector(&self) -> Result<Arc<dyn Connector>, CoreError> {
        Ok(Arc::new(TungsteniteConnector::new(&self.transport)?))
    }
}

/// DegradeScanner tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Page size of the first (filtered) pass. Default: 128.
    pub limit: u32,
    /// The unfiltered fallback pass uses `limit * fallback_multiplier`,
    /// capped by the feed's own maximum. Default: 4.
    pub fallback_multiplier: u32,
    /// Pages followed per pass when the feed reports truncation. Default: 8.
    pub max_pages: u32,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            limit: 128,
            fallback_multiplier: 4,
            max_pages: 8,
        }
    }
}

/// ProbeBoard tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Per-probe deadline. Default: 10s.
    pub timeout: Duration,
    pub weights: ScoreWeights,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            weights: ScoreWeights::default(),
        }
    }
}

/// Everything the sync layer needs besides the node itself.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub stream: StreamConfig,
    /// Poll cadence in poll mode. Default: 5s.
    pub poll_interval: Duration,
    /// Deadline for a single poll request. Default: 10s.
    pub poll_timeout: Duration,
    /// Consecutive poll failures before `connected` goes false. Default: 3.
    pub max_poll_failures: u32,
    /// How long an unused shared connection lingers before closing.
    /// `Duration::ZERO` closes immediately. Default: 5s.
    pub release_grace: Duration,
    pub scanner: ScannerConfig,
    pub probes: ProbeConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            poll_interval: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(10),
            max_poll_failures: 3,
            release_grace: Duration::from_secs(5),
            scanner: ScannerConfig::default(),
            probes: ProbeConfig::default(),
        }
    }
}
