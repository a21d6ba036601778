// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deduplicating queue of deferred observer events.

use alloc::vec::Vec;
use core::hash::Hash;

use hashbrown::HashSet;

use crate::key::{EventName, PropertyKey};

/// An observer event waiting for the end of the outermost transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct QueuedEvent<S> {
    pub(crate) subject: S,
    pub(crate) key: PropertyKey,
    pub(crate) event: EventName,
}

/// Insertion-ordered set of pending `(subject, event)` pairs.
///
/// The first add of a pair wins; later adds of the same pair while it is
/// still queued are ignored.
#[derive(Debug)]
pub(crate) struct ObserverQueue<S>
where
    S: Copy + Eq + Hash,
{
    entries: Vec<QueuedEvent<S>>,
    added: HashSet<(S, EventName)>,
}

impl<S> Default for ObserverQueue<S>
where
    S: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ObserverQueue<S>
where
    S: Copy + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            added: HashSet::new(),
        }
    }

    /// Queues an event. Returns `false` if the pair was already pending.
    pub(crate) fn add(&mut self, subject: S, key: &PropertyKey, event: EventName) -> bool {
        if !self.added.insert((subject, event.clone())) {
            return false;
        }
        self.entries.push(QueuedEvent {
            subject,
            key: key.clone(),
            event,
        });
        true
    }

    /// Takes every pending entry, leaving the queue empty.
    pub(crate) fn take(&mut self) -> Vec<QueuedEvent<S>> {
        self.added.clear();
        core::mem::take(&mut self.entries)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
