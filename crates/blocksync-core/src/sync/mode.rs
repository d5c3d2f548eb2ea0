// Requested vs. effective sync mode.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::state::SyncMode;

/// Mode a consumer asks for.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RequestedMode {
    /// Stream only; never falls back.
    Stream,
    /// Poll only; never opens a stream.
    Poll,
    /// Stream first, poll once the stream gives up.
    #[default]
    Auto,
}

/// Inputs that can move the mode machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeEvent {
    /// The shared connection exhausted its reconnect budget.
    StreamExhausted,
}

/// Explicit state machine for a subscription's effective mode.
///
/// The only transition is `Stream --StreamExhausted--> Poll`, and only
/// under `Auto`. A downgraded subscription stays on polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeMachine {
    requested: RequestedMode,
    current: SyncMode,
}

impl ModeMachine {
    pub fn new(requested: RequestedMode) -> Self {
        let current = match requested {
            RequestedMode::Poll => SyncMode::Poll,
            RequestedMode::Stream | RequestedMode::Auto => SyncMode::Stream,
        };
        Self { requested, current }
    }

    pub fn requested(&self) -> RequestedMode {
        self.requested
    }

    pub fn current(&self) -> SyncMode {
        self.current
    }

    /// Feed an event; returns the new mode if it changed.
    pub fn transition(&mut self, event: ModeEvent) -> Option<SyncMode> {
        match (self.requested, self.current, event) {
            (RequestedMode::Auto, SyncMode::Stream, ModeEvent::StreamExhausted) => {
                self.current = SyncMode::Poll;
                Some(SyncMode::Poll)
            }
            _ => None,
        }
    }
}
