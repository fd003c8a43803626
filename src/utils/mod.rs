pub mod atomic_write;
pub mod log_file;
pub mod sos;
