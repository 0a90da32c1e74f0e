//! Outbound message queue.
//!
//! Ordered buffer of envelopes not yet transmitted. Entries are created when
//! `send` is called while disconnected, or when a transmit attempt fails, and
//! destroyed when written to the transport or explicitly cleared. The queue
//! is strictly FIFO and unbounded.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use crate::protocol::Envelope;

// ============================================================================
// OutboundQueue
// ============================================================================

/// FIFO buffer of envelopes awaiting transmission.
///
/// Entries are never reordered. Draining is one-at-a-time in insertion order
/// so that flushed wire order equals enqueue order.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    entries: VecDeque<Envelope>,
}

impl OutboundQueue {
    /// Creates an empty queue.
    #[inline]
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends an envelope at the back.
    #[inline]
    pub(crate) fn push(&mut self, envelope: Envelope) {
        self.entries.push_back(envelope);
    }

    /// Removes and returns the oldest entry.
    #[inline]
    pub(crate) fn pop(&mut self) -> Option<Envelope> {
        self.entries.pop_front()
    }

    /// Discards all pending entries.
    #[inline]
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns the number of pending entries.
    #[inline]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are pending.
    #[inline]
    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
