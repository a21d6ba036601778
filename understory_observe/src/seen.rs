// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Visited set for one top-level propagation pass.

use core::hash::Hash;

use hashbrown::{HashMap, HashSet};

use crate::key::PropertyKey;

/// Records which `(subject, key)` pairs a propagation pass has already reached.
///
/// The first walker to [`enter`](Self::enter) an idle set owns the pass and is
/// the only one allowed to clear it. Nested walkers share the owner's entries,
/// so sibling branches of one pass never re-notify a visited key.
#[derive(Debug)]
pub(crate) struct SeenSet<S>
where
    S: Copy + Eq + Hash,
{
    visited: HashMap<S, HashSet<PropertyKey>>,
    owned: bool,
}

impl<S> Default for SeenSet<S>
where
    S: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SeenSet<S>
where
    S: Copy + Eq + Hash,
{
    pub(crate) fn new() -> Self {
        Self {
            visited: HashMap::new(),
            owned: false,
        }
    }

    /// Enters a pass. Returns `true` if the caller became the owner.
    pub(crate) fn enter(&mut self) -> bool {
        if self.owned {
            false
        } else {
            self.owned = true;
            true
        }
    }

    /// Ends a pass. Only the owner clears the visited entries.
    pub(crate) fn release(&mut self, top: bool) {
        if top {
            self.visited.clear();
            self.owned = false;
        }
    }

    /// Records `(subject, key)`. Returns `false` if it was already visited.
    pub(crate) fn insert(&mut self, subject: S, key: &PropertyKey) -> bool {
        let keys = self.visited.entry(subject).or_default();
        if keys.contains(key) {
            false
        } else {
            keys.insert(key.clone());
            true
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, subject: S, key: &PropertyKey) -> bool {
        self.visited
            .get(&subject)
            .is_some_and(|keys| keys.contains(key))
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.owned
    }

    #[cfg(any(test, feature = "tracing"))]
    pub(crate) fn len(&self) -> usize {
        self.visited.values().map(HashSet::len).sum()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.visited.values().all(HashSet::is_empty)
    }
}
