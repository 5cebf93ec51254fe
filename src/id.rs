//! ID generation utilities for cmdsched
//!
//! Command ids are monotonic within a scheduler so they double as the FIFO
//! tie-break when the queue is scanned.

use std::sync::atomic::{AtomicU64, Ordering};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Hands out strictly increasing command ids, starting at 1.
#[derive(Debug)]
pub struct CommandIdGenerator {
    next: AtomicU64,
}

impl CommandIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the id the next call will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for CommandIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate the serial for the `index`th generated null device.
///
/// Format: `null-device-{index}`
pub fn null_device_serial(index: usize) -> String {
    format!("null-device-{}", index)
}
