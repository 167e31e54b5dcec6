pub mod bridge;
pub mod history;
pub mod limiter;
pub mod monitor;
pub mod reply;
pub mod stats;

pub(crate) use bridge::{Bridge, ChatOutcome, INTERNAL_ERROR_REPLY};
pub(crate) use history::HistoryInjector;
pub(crate) use limiter::RateLimiter;
pub(crate) use monitor::Monitor;
pub(crate) use reply::ReplyWaiter;
pub(crate) use stats::{BridgeStats, StatsSnapshot};
