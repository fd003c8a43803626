//! Send pipeline: source reader, flow control and the per-transfer pump.

pub mod flow;
pub mod reader;
pub mod stream;
