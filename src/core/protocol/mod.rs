//! Data-channel protocol: frame codec and the receive-side state machine.

pub mod assembly;
pub mod frame;
