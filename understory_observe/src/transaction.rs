// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Deferral transactions: batching observer notification.

use core::ops::{Deref, DerefMut};

use crate::Subject;
use crate::observatory::Observatory;

/// Nesting depth of open transactions.
///
/// Unbalanced ends are not guarded: the depth may go negative, after which
/// changes dispatch immediately until enough begins restore it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Deferral {
    depth: i32,
}

impl Deferral {
    pub(crate) fn begin(&mut self) {
        self.depth += 1;
    }

    /// Closes one level. Returns `true` if this was the outermost level and
    /// deferred work must be flushed now.
    pub(crate) fn end(&mut self) -> bool {
        self.depth -= 1;
        self.depth <= 0
    }

    #[inline]
    pub(crate) fn is_open(self) -> bool {
        self.depth > 0
    }

    #[inline]
    pub(crate) fn depth(self) -> i32 {
        self.depth
    }
}

/// Scoped transaction over an [`Observatory`].
///
/// Created by [`Observatory::transaction`]. While it lives, observer events are
/// queued. [`commit`](Self::commit) ends the transaction and flushes if it was
/// the outermost.
///
/// Dropping the guard without committing, including while unwinding from a
/// panic, only closes the nesting level. No listener runs from the drop; queued
/// events stay pending until the next outermost end or
/// [`Observatory::flush_observers`].
///
/// The guard dereferences to the observatory, so changes are made through it:
///
/// ```rust
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use understory_observe::Observatory;
///
/// let mut obs = Observatory::<u32>::new();
/// let hits = Rc::new(Cell::new(0));
/// let h = hits.clone();
/// obs.observe(1, "width", move |_, _| h.set(h.get() + 1));
///
/// {
///     let mut tx = obs.transaction();
///     tx.notify_property_change(1, "width");
///     tx.notify_property_change(1, "width");
///     assert_eq!(hits.get(), 0);
///     tx.commit();
/// }
/// assert_eq!(hits.get(), 1);
/// ```
#[must_use = "dropping the transaction ends it without dispatching"]
pub struct Transaction<'a, S: Subject> {
    observatory: &'a mut Observatory<S>,
    open: bool,
}

impl<'a, S: Subject> Transaction<'a, S> {
    pub(crate) fn new(observatory: &'a mut Observatory<S>) -> Self {
        observatory.begin_property_changes();
        Self {
            observatory,
            open: true,
        }
    }

    /// Ends the transaction, dispatching queued events if it was the outermost.
    pub fn commit(mut self) {
        // Closed before flushing so a panicking listener does not end it twice.
        self.open = false;
        self.observatory.end_property_changes();
    }
}

impl<S: Subject> Deref for Transaction<'_, S> {
    type Target = Observatory<S>;

    fn deref(&self) -> &Self::Target {
        self.observatory
    }
}

impl<S: Subject> DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.observatory
    }
}

impl<S: Subject> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.open {
            self.observatory.abandon_property_changes();
        }
    }
}

impl<S: Subject> core::fmt::Debug for Transaction<'_, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.observatory.deferred())
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}
