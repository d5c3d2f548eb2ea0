// ── Subscription state and its reducer ──
//
// `SyncState` is the one value a consumer renders. Only the reducer
// methods below mutate it, and only the subscription's driver task calls
// them.

use std::time::Duration;

use blocksync_api::InboundEnvelope;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::error::SyncError;

/// Where the current data is coming from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncMode {
    Stream,
    Poll,
}

/// What the reducer did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Snapshot replaced the value.
    Replaced,
    /// Update merged into the value.
    Merged,
    /// `seq` was not newer than `last_seq`; dropped.
    Stale,
    /// Error envelope recorded in `last_error`.
    ErrorRecorded,
    /// Heartbeat; nothing to do.
    Ignored,
}

impl Applied {
    /// Whether observers should be notified.
    pub fn changed_state(self) -> bool {
        matches!(self, Self::Replaced | Self::Merged | Self::ErrorRecorded)
    }
}

/// Consumer-visible state of one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub value: Option<Value>,
    pub connected: bool,
    pub mode: SyncMode,
    /// Highest sequence number applied. Never decreases.
    pub last_seq: Option<u64>,
    pub last_error: Option<SyncError>,
    /// When `value` last changed.
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            value: None,
            connected: false,
            mode,
            last_seq: None,
            last_error: None,
            updated_at: None,
        }
    }

    /// Apply one envelope. Sequenced envelopes apply only when strictly
    /// newer than `last_seq`.
    pub fn apply(&mut self, envelope: &InboundEnvelope) -> Applied {
        match envelope {
            InboundEnvelope::Snapshot { data, seq } => {
                if !self.accepts(*seq) {
                    return Applied::Stale;
                }
                self.value = Some(data.clone());
                self.advance(*seq);
                Applied::Replaced
            }
            InboundEnvelope::Update { data, seq } => {
                if !self.accepts(*seq) {
                    return Applied::Stale;
                }
                match &mut self.value {
                    Some(Value::Object(current)) => {
                        for (key, value) in data {
                            current.insert(key.clone(), value.clone());
                        }
                    }
                    // Nothing to merge into: the update becomes the value.
                    _ => self.value = Some(Value::Object(data.clone())),
                }
                self.advance(*seq);
                Applied::Merged
            }
            InboundEnvelope::Error { message } => {
                self.last_error = Some(SyncError::Remote {
                    message: message.clone(),
                });
                Applied::ErrorRecorded
            }
            InboundEnvelope::Heartbeat => Applied::Ignored,
        }
    }

    /// Apply a polled value as a synthesized snapshot, continuing the
    /// sequence from `last_seq + 1`. Returns the seq used.
    pub fn apply_polled(&mut self, value: Value) -> u64 {
        let seq = self.next_seq();
        self.value = Some(value);
        self.advance(seq);
        seq
    }

    /// Seed `value` from an out-of-band snapshot. Only takes effect while
    /// no sequenced envelope has been applied; leaves `last_seq` alone.
    pub fn bootstrap(&mut self, value: Value) -> bool {
        if self.last_seq.is_some() {
            return false;
        }
        self.value = Some(value);
        self.updated_at = Some(Utc::now());
        true
    }

    /// Seq the next polled snapshot would get.
    pub fn next_seq(&self) -> u64 {
        self.last_seq.map_or(1, |seq| seq.saturating_add(1))
    }

    /// No value, or the value is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.is_stale_at(max_age, Utc::now())
    }

    pub fn is_stale_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let Some(updated_at) = self.updated_at else {
            return true;
        };
        match TimeDelta::from_std(max_age) {
            Ok(max_age) => now.signed_duration_since(updated_at) > max_age,
            // Larger than chrono can represent: never stale.
            Err(_) => false,
        }
    }

    /// Deserialize the current value. `Ok(None)` when there is none yet.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.value.as_ref().map(T::deserialize).transpose()
    }

    fn accepts(&self, seq: u64) -> bool {
        self.last_seq.is_none_or(|last| seq > last)
    }

    fn advance(&mut self, seq: u64) {
        self.last_seq = Some(seq);
        self.last_error = None;
        self.updated_at = Some(Utc::now());
    }
}
