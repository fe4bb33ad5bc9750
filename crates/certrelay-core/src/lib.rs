//! Foundational low-level utilities shared across certrelay crates.
//!
//! Provides the atomic file-write helpers used by credential persistence and
//! the unix-time helpers used by session status snapshots.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::{write_json_atomic, write_text_atomic};
pub use time_utils::current_unix_timestamp_ms;
