//! tickflow: the realtime core of an automated trading bot.
//!
//! Pipeline: strategy producers submit signals to the orchestrator's
//! priority queue; every dequeued signal is gated through the policy engine;
//! approved decisions are published on the event bus "signals" stream; the
//! paper engine consumes ticks and decisions, simulates fills, and feeds
//! realized PnL back into the policy engine's loss tracking.

pub mod bus;
pub mod logging;
pub mod orchestrator;
pub mod paper;
pub mod policy;
pub mod retry;
pub mod signal;
pub mod state;
pub mod storage;
