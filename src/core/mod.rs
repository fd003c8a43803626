pub mod artifacts;
pub mod config;
pub mod connection;
pub mod pipeline;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod session_loop;
pub mod signaling;
pub mod transfer;
