// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Revision tags: the invalidation side channel.

use core::hash::Hash;

use hashbrown::HashMap;

use crate::key::PropertyKey;

/// Revision-stamped dirty marks per `(subject, key)`.
///
/// Every change that reaches a subject with metadata is stamped here, whether
/// or not anything observes the key. The global revision increments on every
/// mark, so a cache that remembers the revision it was computed at can tell
/// whether any of its inputs changed since.
///
/// Marking is idempotent in effect: re-marking only moves the stamp forward.
///
/// # Example
///
/// ```rust
/// use understory_observe::Observatory;
///
/// let mut obs = Observatory::<u32>::new();
/// obs.watch(1, "width");
///
/// let before = obs.dirty().revision();
/// obs.notify_property_change(1, "width");
///
/// assert!(obs.dirty().is_dirty_since(1, "width", before));
/// assert!(!obs.dirty().is_dirty_since(1, "height", before));
/// ```
#[derive(Debug, Clone)]
pub struct DirtyTags<S>
where
    S: Copy + Eq + Hash,
{
    revision: u64,
    tags: HashMap<S, HashMap<PropertyKey, u64>>,
}

impl<S> Default for DirtyTags<S>
where
    S: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> DirtyTags<S>
where
    S: Copy + Eq + Hash,
{
    /// Creates an empty set of tags at revision 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            revision: 0,
            tags: HashMap::new(),
        }
    }

    /// Returns the current revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Stamps `(subject, key)` with a fresh revision and returns it.
    pub fn mark(&mut self, subject: S, key: &PropertyKey) -> u64 {
        self.revision = self.revision.wrapping_add(1);
        let revision = self.revision;
        let keys = self.tags.entry(subject).or_default();
        match keys.get_mut(key) {
            Some(tag) => *tag = revision,
            None => {
                keys.insert(key.clone(), revision);
            }
        }
        revision
    }

    /// Returns the revision at which `(subject, key)` was last marked.
    #[must_use]
    pub fn tag(&self, subject: S, key: &str) -> Option<u64> {
        self.tags.get(&subject)?.get(key).copied()
    }

    /// Returns `true` if `(subject, key)` was marked after `revision`.
    #[must_use]
    pub fn is_dirty_since(&self, subject: S, key: &str, revision: u64) -> bool {
        self.tag(subject, key).is_some_and(|tag| tag > revision)
    }

    /// Returns the number of `(subject, key)` pairs that carry a tag.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.values().map(HashMap::len).sum()
    }

    /// Returns `true` if nothing has been marked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.values().all(HashMap::is_empty)
    }

    /// Drops every tag belonging to `subject`.
    pub fn remove_subject(&mut self, subject: S) {
        self.tags.remove(&subject);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_advance_the_revision() {
        let mut tags = DirtyTags::<u32>::new();
        let width = PropertyKey::from("width");

        assert_eq!(tags.revision(), 0);
        assert_eq!(tags.mark(1, &width), 1);
        assert_eq!(tags.mark(1, &width), 2);
        assert_eq!(tags.tag(1, "width"), Some(2));
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn dirty_since_compares_against_stamp() {
        let mut tags = DirtyTags::<u32>::new();
        let width = PropertyKey::from("width");
        let height = PropertyKey::from("height");

        tags.mark(1, &width);
        let checkpoint = tags.revision();
        tags.mark(1, &height);

        assert!(!tags.is_dirty_since(1, "width", checkpoint));
        assert!(tags.is_dirty_since(1, "height", checkpoint));
        assert!(!tags.is_dirty_since(2, "height", 0));
    }

    #[test]
    fn remove_subject_drops_its_tags() {
        let mut tags = DirtyTags::<u32>::new();
        tags.mark(1, &PropertyKey::from("a"));
        tags.mark(2, &PropertyKey::from("a"));

        tags.remove_subject(1);
        assert_eq!(tags.tag(1, "a"), None);
        assert!(tags.tag(2, "a").is_some());
    }
}
