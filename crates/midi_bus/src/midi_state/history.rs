//! Provides [`History`], the lossless audit trail of every event the bus has emitted.
//!
//! Unlike the live queue, which evicts its oldest entry when full, the history never drops an
//! event: when it fills it doubles its backing storage, keeping existing entries in their original
//! order.

use crate::event::MusicEvent;
use alloc::{collections::TryReserveError, vec::Vec};

/// A growable, order-preserving record of events. Disabled when constructed with a capacity of
/// zero.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct History {
    events: Vec<MusicEvent>,
    /// Number of events that fit before the next doubling.
    capacity: usize,
}

impl History {
    /// Allocates room for `capacity` events up front. Zero disables the history.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut events = Vec::new();
        let capacity = match events.try_reserve_exact(capacity) {
            Ok(()) => capacity,
            Err(_) => {
                error!(
                    "Could not allocate history for {} events; history disabled",
                    capacity
                );
                0
            }
        };
        Self { events, capacity }
    }

    /// Returns `true` if events are being recorded.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Appends `event`, doubling the capacity first if the history is full. Does nothing if the
    /// history is disabled.
    pub fn push(&mut self, event: MusicEvent) -> Result<(), TryReserveError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.events.len() == self.capacity {
            self.events.try_reserve_exact(self.capacity)?;
            self.capacity *= 2;
            debug!("History grown to {} events", self.capacity);
        }
        self.events.push(event);
        Ok(())
    }

    /// Returns the event recorded at `index`, oldest first.
    pub fn get(&self, index: usize) -> Option<&MusicEvent> {
        self.events.get(index)
    }

    /// Returns an [`Iterator`] over the recorded events, oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MusicEvent> {
        self.events.iter()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of events that fit before the next doubling.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forgets every recorded event. The capacity reached so far is kept.
    pub fn clear(&mut self) {
        self.events.clear();
    }
}
