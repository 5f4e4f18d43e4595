//! Per-task pub/sub of captured PTY output with bounded live buffering,
//! late-join replay from the persisted stream, and slow-consumer
//! protection. The producer never blocks.

pub mod broker;

pub use broker::{OverlayBroker, OverlayError, Result, SubscribeFrom, Subscription};
