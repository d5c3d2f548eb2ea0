//! Synchronization layer between `blocksync-api` and UI consumers.
//!
//! - **[`SyncHook`]** hands out [`Subscription`]s: one ordered, consistent
//!   [`SyncState`] per consumer, fed by a shared stream connection and
//!   falling back to polling when the stream gives up (`auto` mode).
//!
//! - **[`ConnectionRegistry`]** shares one
//!   [`StreamConnection`](blocksync_api::StreamConnection) per endpoint
//!   across subscriptions, reference-counted through leases.
//!
//! - **[`DegradeScanner`]** finds the latest record matching a predicate
//!   in a paginated feed, retrying unfiltered when the native filter fails.
//!
//! - **[`ProbeBoard`]** runs independent read-only probes concurrently and
//!   reduces them to a scored [`ProofReport`].

pub mod config;
pub mod error;
pub mod probe;
pub mod registry;
pub mod scanner;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{NodeConfig, ProbeConfig, ScannerConfig, SyncConfig};
pub use error::{CoreError, SyncError};
pub use probe::{
    FileHint, Probe, ProbeBoard, ProbeContext, ProbeOutcome, ProbeResult, ProbeStatus,
    ProofReport, ScoreWeights,
};
pub use registry::{ConnectionLease, ConnectionRegistry};
pub use scanner::{DegradeScanner, Predicate, ScanHit, ScanWindow};
pub use sync::{
    PollSource, RequestedMode, SubscribeRequest, Subscription, SyncHook, SyncMode, SyncState,
};
