//! NegotiationEngine and the peer-connection seams it drives.
pub mod negotiation;
pub mod rtc;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use negotiation::{EngineOutput, NegotiationEngine, NegotiationState};
pub use transport::DataChannel;
pub use types::TransportEvent;
