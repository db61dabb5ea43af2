//! The shared-buffer ledger.
//!
//! A write submitted to the kernel may outlive the caller that produced its
//! buffer: the application thread is free to drop its handle the moment the
//! service call returns. The ledger holds an extra strong reference to each
//! in-flight write buffer until the reactor confirms completion, with a TTL
//! backstop for completions that never arrive. The TTL must exceed the
//! worst-case kernel latency for a write to drain.

use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;

struct LedgerEntry {
    buffer: Bytes,
    ttl: Duration,
}

/// TTL-bounded retention list for in-flight write buffers.
pub struct SharedBufferLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl SharedBufferLedger {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Holds a strong reference to `buffer` for at most `ttl`.
    pub fn retain(&self, buffer: Bytes, ttl: Duration) {
        if buffer.is_empty() {
            return;
        }
        self.entries
            .lock()
            .unwrap()
            .push(LedgerEntry { buffer, ttl });
    }

    /// Drops the retention for `buffer` after its write completed.
    ///
    /// Matching is by buffer identity (shared allocation), not content.
    pub fn release(&self, buffer: &Bytes) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(index) = entries
            .iter()
            .position(|entry| entry.buffer.as_ptr() == buffer.as_ptr())
        {
            entries.swap_remove(index);
        }
    }

    /// One sweeper tick: ages every entry by `resolution` and drops the
    /// expired. Returns the number of live entries remaining.
    pub fn sweep(&self, resolution: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap();
        entries.retain_mut(|entry| match entry.ttl.checked_sub(resolution) {
            Some(remaining) if remaining > Duration::ZERO => {
                entry.ttl = remaining;
                true
            }
            _ => false,
        });
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for SharedBufferLedger {
    fn default() -> Self {
        Self::new()
    }
}
