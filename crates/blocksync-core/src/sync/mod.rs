// Dual-mode (stream / poll) subscriptions over a remote value.

pub mod hook;
pub mod mode;
pub mod poll;
pub mod state;

pub use hook::{DataPredicate, SubscribeRequest, Subscription, SyncHook, SyncStream};
pub use mode::{ModeEvent, ModeMachine, RequestedMode};
pub use poll::{HttpPoll, LatestRecordPoll, PollSource, RpcPoll};
pub use state::{Applied, SyncMode, SyncState};
