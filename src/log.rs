//! Bounded rewind log.
//!
//! Each topic keeps the most recent `max_rewind` messages together with the
//! handle assigned when they were pushed. Subscribers that reconnect ask for
//! everything after the last handle they saw; older entries are dropped
//! silently and only show up as a failed replay.

use crate::error::{BackplaneError, Result};
use crate::types::{Generation, MessageHandle};
use std::collections::VecDeque;

/// Append-only bounded log of `(message, handle)` pairs.
pub struct MessageLog<T> {
    /// Retained entries, oldest first.
    entries: VecDeque<(T, MessageHandle)>,

    /// Sequence of the most recent push (0 before the first push).
    last_sequence: u64,

    /// Identity of this log incarnation.
    generation: Generation,

    /// Maximum number of retained entries.
    max_rewind: usize,
}

impl<T: Clone> MessageLog<T> {
    /// Create an empty log with a fresh generation.
    pub fn new(max_rewind: usize) -> Self {
        Self::with_generation(max_rewind, Generation::new())
    }

    /// Create an empty log for a known generation.
    pub fn with_generation(max_rewind: usize, generation: Generation) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_rewind.min(1024)),
            last_sequence: 0,
            generation,
            max_rewind: max_rewind.max(1),
        }
    }

    /// Append a message and return its handle. Evicts the oldest entry once
    /// the window is full.
    pub fn push(&mut self, message: T) -> MessageHandle {
        self.last_sequence += 1;
        let handle = MessageHandle::new(self.last_sequence, self.generation);

        self.entries.push_back((message, handle));
        while self.entries.len() > self.max_rewind {
            self.entries.pop_front();
        }

        handle
    }

    /// All retained messages strictly after `handle`, oldest first.
    ///
    /// Returns an empty list when no replay was requested (zero handle), when
    /// the handle belongs to another generation, or when nothing is newer.
    /// Fails with [`BackplaneError::ReplayOutOfRange`] when a message after
    /// `handle` has already been evicted, since the gap cannot be ruled out.
    pub fn since(&self, handle: MessageHandle) -> Result<Vec<(T, MessageHandle)>> {
        if handle.is_zero() || handle.generation != self.generation {
            return Ok(Vec::new());
        }
        if handle.sequence >= self.last_sequence {
            return Ok(Vec::new());
        }

        let oldest = self.oldest_sequence();
        if handle.sequence.saturating_add(1) < oldest {
            return Err(BackplaneError::ReplayOutOfRange {
                requested: handle,
                oldest,
            });
        }

        Ok(self
            .entries
            .iter()
            .filter(|(_, h)| h.sequence > handle.sequence)
            .cloned()
            .collect())
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Handle of the most recent push, or the zero handle if empty.
    pub fn last_handle(&self) -> MessageHandle {
        self.entries
            .back()
            .map(|(_, h)| *h)
            .unwrap_or(MessageHandle::ZERO)
    }

    /// Sequence of the oldest retained entry (the next sequence if empty).
    pub fn oldest_sequence(&self) -> u64 {
        self.entries
            .front()
            .map(|(_, h)| h.sequence)
            .unwrap_or(self.last_sequence + 1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }
}
