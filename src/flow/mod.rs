//! Streaming flow control.
//!
//! Long read/write loops must keep servicing protocol responses while the
//! local side is busy pushing data, or a credit-based transport stalls;
//! they must also emit keep-alives when a transfer outlives the server's
//! idle window. Both concerns are batched: servicing every I/O unit would
//! be pure overhead, servicing too rarely lets credits pile up. All state
//! lives in per-call values, never in anything shared across calls.

use std::time::{Duration, Instant};

use log::debug;

use crate::client::ShareClient;

/// Successful I/O units between response drains.
pub const SERVICE_UNITS: u32 = 4;
/// Bytes between response drains, whichever threshold trips first.
pub const SERVICE_BYTES: u64 = 256 * 1024;
/// Idle window after which a keep-alive is due.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Starting write chunk size.
pub const INITIAL_WRITE_CHUNK: u32 = 64 * 1024;
/// Consecutive successful writes before the chunk size doubles.
pub const CHUNK_GROW_AFTER: u32 = 4;

/// Per-call pacing state for one streaming read or write.
pub struct TransferState {
    units: u32,
    bytes: u64,
    last_keepalive: Instant,
}

impl TransferState {
    /// The keep-alive timer starts at transfer start, so short transfers
    /// never emit one.
    pub fn new(now: Instant) -> Self {
        Self {
            units: 0,
            bytes: 0,
            last_keepalive: now,
        }
    }

    /// Records one successful I/O unit of `len` bytes.
    ///
    /// Returns `true` when a drain is due; the counters reset with it.
    pub fn service_due(&mut self, len: u64) -> bool {
        self.units += 1;
        self.bytes += len;
        if self.units >= SERVICE_UNITS || self.bytes >= SERVICE_BYTES {
            self.units = 0;
            self.bytes = 0;
            true
        } else {
            false
        }
    }

    /// Checks the keep-alive window, resetting it when it has elapsed.
    pub fn keepalive_due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last_keepalive) >= KEEPALIVE_INTERVAL {
            self.last_keepalive = now;
            true
        } else {
            false
        }
    }
}

/// Adaptive write chunk sizing.
///
/// Starts at 64 KiB and doubles after every [`CHUNK_GROW_AFTER`]
/// consecutive successful writes, capped at the negotiated maximum. A
/// failed write leaves the size unchanged.
pub struct WriteChunk {
    size: u32,
    streak: u32,
    max: u32,
}

impl WriteChunk {
    pub fn new(max_write_size: u32) -> Self {
        Self {
            size: INITIAL_WRITE_CHUNK.min(max_write_size),
            streak: 0,
            max: max_write_size,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn note_success(&mut self) {
        self.streak += 1;
        if self.streak >= CHUNK_GROW_AFTER {
            self.size = (self.size * 2).min(self.max);
            self.streak = 0;
        }
    }
}

/// Drains pending protocol responses: polls until none remain.
///
/// Each poll is non-blocking. A fault mid-drain ends the drain; the next
/// data call observes the broken session and classifies it there.
pub async fn drain<C: ShareClient + ?Sized>(client: &C) {
    loop {
        match client.service().await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!("service poll failed during drain: {err}");
                break;
            }
        }
    }
}
