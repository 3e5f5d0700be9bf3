//! Write-light cache model: a bounded buffer of dirty cache lines in front of
//! non-volatile memory, plus a trace-driven driver for comparing buffer
//! configurations.

pub mod buffer;
pub mod config;
pub mod error;
pub mod nvm;
pub mod sim;
pub mod trace;
pub mod workload;

pub use buffer::{BufferError, BufferStats, DirtyLineBuffer, Sink};
