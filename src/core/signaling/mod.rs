//! SignalingChannel: the reconnecting relay connection used to exchange
//! offers, answers and ICE candidates before the data channel exists.

pub mod backoff;
pub mod client;
pub mod message;
pub mod outbox;

pub use client::{SignalingConfig, SignalingEvent, SignalingHandle};
pub use message::SignalMessage;
