// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-subject observation metadata.
//!
//! [`Meta`] is the bookkeeping one subject needs to take part in propagation:
//! watch counts, the dependent-key registry, chain-watcher links, descriptors,
//! lifecycle flags and the optional change reaction. The propagation core only
//! reads it; every mutation goes through an [`Observatory`] registration method.

use alloc::rc::Rc;
use core::fmt;

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::Subject;
use crate::chains::ChainWatchers;
use crate::key::PropertyKey;
use crate::observatory::Observatory;

/// Keys collected while adjusting watch counts.
pub(crate) type KeyList = SmallVec<[PropertyKey; 4]>;

/// Callback invoked with a subject and one of its changed keys.
///
/// Used for descriptor change hooks and subject change reactions. The callback
/// receives the observatory and may notify, observe or register further.
pub type ChangeHook<S> = Rc<dyn Fn(&mut Observatory<S>, S, &PropertyKey)>;

bitflags::bitflags! {
    /// Lifecycle flags of a subject.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MetaFlags: u8 {
        /// The subject is still being constructed; changes are not observable.
        const INITIALIZING = 0b0000_0001;
        /// The subject is a prototype other subjects are set up from.
        const PROTOTYPE    = 0b0000_0010;
        /// The subject is being torn down; propagation from it is suppressed.
        const DESTROYING   = 0b0000_0100;
    }
}

/// A computed-property definition attached to one key of a subject.
///
/// # Example
///
/// ```rust
/// use understory_observe::{Descriptor, Observatory};
///
/// let mut obs = Observatory::<u32>::new();
/// obs.define_descriptor(
///     1,
///     "area",
///     Descriptor::new().on_change(|_obs, subject, key| {
///         assert_eq!((subject, key.as_str()), (1, "area"));
///     }),
/// );
///
/// assert!(obs.meta(1).unwrap().descriptor("area").unwrap().has_change_hook());
/// ```
pub struct Descriptor<S: Subject> {
    did_change: Option<ChangeHook<S>>,
}

impl<S: Subject> Descriptor<S> {
    /// Creates a descriptor without hooks.
    #[must_use]
    pub fn new() -> Self {
        Self { did_change: None }
    }

    /// Sets the hook run when the described key changes.
    ///
    /// The hook runs before dependent keys and observers are notified.
    #[must_use]
    pub fn on_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Observatory<S>, S, &PropertyKey) + 'static,
    {
        self.did_change = Some(Rc::new(hook));
        self
    }

    /// Returns the change hook, if any.
    #[must_use]
    #[inline]
    pub fn did_change(&self) -> Option<&ChangeHook<S>> {
        self.did_change.as_ref()
    }

    /// Returns whether a change hook is set.
    #[must_use]
    #[inline]
    pub fn has_change_hook(&self) -> bool {
        self.did_change.is_some()
    }
}

impl<S: Subject> Default for Descriptor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subject> Clone for Descriptor<S> {
    fn clone(&self) -> Self {
        Self {
            did_change: self.did_change.clone(),
        }
    }
}

// Manual Debug impl since hooks aren't Debug
impl<S: Subject> fmt::Debug for Descriptor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("has_change_hook", &self.did_change.is_some())
            .finish()
    }
}

/// Observation metadata owned by one subject.
///
/// Obtained read-only through [`Observatory::meta`]. Created lazily the first
/// time a registration method touches the subject.
pub struct Meta<S: Subject> {
    flags: MetaFlags,
    /// Direct watchers per key: observers, explicit watches and chain links.
    watchers: HashMap<PropertyKey, usize>,
    /// Keys with a direct watcher plus everything they depend on.
    watched: HashSet<PropertyKey>,
    /// Source key -> keys that depend on it, in registration order.
    deps: HashMap<PropertyKey, KeyList>,
    /// Dependent key -> keys it depends on.
    sources: HashMap<PropertyKey, KeyList>,
    descriptors: HashMap<PropertyKey, Descriptor<S>>,
    chains: ChainWatchers,
    reaction: Option<ChangeHook<S>>,
}

impl<S: Subject> Meta<S> {
    pub(crate) fn new() -> Self {
        Self {
            flags: MetaFlags::empty(),
            watchers: HashMap::new(),
            watched: HashSet::new(),
            deps: HashMap::new(),
            sources: HashMap::new(),
            descriptors: HashMap::new(),
            chains: ChainWatchers::new(),
            reaction: None,
        }
    }

    /// Returns the lifecycle flags.
    #[must_use]
    #[inline]
    pub fn flags(&self) -> MetaFlags {
        self.flags
    }

    /// Returns `true` while the subject is being constructed.
    #[must_use]
    #[inline]
    pub fn is_initializing(&self) -> bool {
        self.flags.contains(MetaFlags::INITIALIZING)
    }

    /// Returns `true` if the subject is a prototype.
    #[must_use]
    #[inline]
    pub fn is_prototype(&self) -> bool {
        self.flags.contains(MetaFlags::PROTOTYPE)
    }

    /// Returns `true` once the subject has started tearing down.
    #[must_use]
    #[inline]
    pub fn is_source_destroying(&self) -> bool {
        self.flags.contains(MetaFlags::DESTROYING)
    }

    /// Returns the number of active watchers of `key`.
    ///
    /// Counts direct watchers plus each watched key that depends on `key`.
    #[must_use]
    pub fn peek_watching(&self, key: &str) -> usize {
        if !self.watched.contains(key) {
            return 0;
        }
        let direct = self.watchers.get(key).copied().unwrap_or(0);
        let derived = self
            .dependents(key)
            .iter()
            .filter(|dependent| self.watched.contains(dependent.as_str()))
            .count();
        direct + derived
    }

    /// Returns `true` if any key depends on `key`.
    #[must_use]
    pub fn has_deps(&self, key: &str) -> bool {
        self.deps.get(key).is_some_and(|deps| !deps.is_empty())
    }

    /// Calls `visitor` for each key that depends on `key`, in registration order.
    pub fn for_each_in_deps(&self, key: &str, mut visitor: impl FnMut(&PropertyKey)) {
        for dependent in self.dependents(key) {
            visitor(dependent);
        }
    }

    /// Returns the keys that depend on `key`, in registration order.
    #[must_use]
    pub fn dependents(&self, key: &str) -> &[PropertyKey] {
        match self.deps.get(key) {
            Some(deps) => deps,
            None => &[],
        }
    }

    /// Returns the keys that `key` depends on, in registration order.
    #[must_use]
    pub fn dependencies(&self, key: &str) -> &[PropertyKey] {
        match self.sources.get(key) {
            Some(sources) => sources,
            None => &[],
        }
    }

    /// Returns the descriptor for `key`, if one is defined.
    #[must_use]
    pub fn descriptor(&self, key: &str) -> Option<&Descriptor<S>> {
        self.descriptors.get(key)
    }

    /// Returns the chain-watcher state, or `None` if no chain passes through
    /// this subject.
    #[must_use]
    pub fn readable_chain_watchers(&self) -> Option<&ChainWatchers> {
        (!self.chains.is_empty()).then_some(&self.chains)
    }

    /// Returns `true` if the subject declared a change reaction.
    #[must_use]
    #[inline]
    pub fn has_change_reaction(&self) -> bool {
        self.reaction.is_some()
    }

    pub(crate) fn set_flag(&mut self, flag: MetaFlags, value: bool) {
        self.flags.set(flag, value);
    }

    pub(crate) fn change_reaction(&self) -> Option<ChangeHook<S>> {
        self.reaction.clone()
    }

    pub(crate) fn set_change_reaction(&mut self, reaction: Option<ChangeHook<S>>) {
        self.reaction = reaction;
    }

    pub(crate) fn set_descriptor(&mut self, key: PropertyKey, descriptor: Descriptor<S>) {
        self.descriptors.insert(key, descriptor);
    }

    pub(crate) fn remove_descriptor(&mut self, key: &str) -> bool {
        self.descriptors.remove(key).is_some()
    }

    pub(crate) fn chain_watchers_mut(&mut self) -> &mut ChainWatchers {
        &mut self.chains
    }

    /// Adds a direct watcher to `key`.
    ///
    /// A key that becomes watched also watches every key it depends on, so
    /// changes to inputs reach observers of derived keys. Every key that was
    /// not watched before is pushed to `newly_watched`, depth first from `key`.
    pub(crate) fn watch(&mut self, key: &PropertyKey, newly_watched: &mut KeyList) {
        *self.watchers.entry(key.clone()).or_insert(0) += 1;
        self.reach_from(key, newly_watched);
    }

    /// Removes a direct watcher from `key`; the inverse of [`Self::watch`].
    ///
    /// Unwatching a key without direct watchers does nothing.
    pub(crate) fn unwatch(&mut self, key: &PropertyKey, released: &mut KeyList) {
        let Some(count) = self.watchers.get_mut(key) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        self.watchers.remove(key);
        self.retract_from(key, released);
    }

    /// Marks `key` and everything it transitively depends on as watched.
    fn reach_from(&mut self, key: &PropertyKey, newly_watched: &mut KeyList) {
        let mut stack = KeyList::new();
        stack.push(key.clone());
        while let Some(key) = stack.pop() {
            if !self.watched.insert(key.clone()) {
                continue;
            }
            if let Some(sources) = self.sources.get(&key) {
                stack.extend(sources.iter().rev().cloned());
            }
            newly_watched.push(key);
        }
    }

    /// Recomputes the watched set after `key` lost a reason to be watched.
    ///
    /// Keys that are no longer reachable from a direct watcher are pushed to
    /// `released`, depth first from `key`. Cycles never keep themselves alive.
    fn retract_from(&mut self, key: &PropertyKey, released: &mut KeyList) {
        let mut still = HashSet::new();
        let mut stack: KeyList = self.watchers.keys().cloned().collect();
        while let Some(key) = stack.pop() {
            if !still.insert(key.clone()) {
                continue;
            }
            if let Some(sources) = self.sources.get(&key) {
                stack.extend(sources.iter().cloned());
            }
        }

        let mut visited = HashSet::new();
        stack.clear();
        stack.push(key.clone());
        while let Some(key) = stack.pop() {
            if still.contains(&key) || !self.watched.contains(&key) {
                continue;
            }
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(sources) = self.sources.get(&key) {
                stack.extend(sources.iter().rev().cloned());
            }
            released.push(key);
        }
        self.watched = still;
    }

    /// Registers `dependent` as depending on `source`.
    ///
    /// Returns `false` if the edge already existed.
    pub(crate) fn add_dependency(
        &mut self,
        dependent: &PropertyKey,
        source: &PropertyKey,
        newly_watched: &mut KeyList,
    ) -> bool {
        let deps = self.deps.entry(source.clone()).or_default();
        if deps.contains(dependent) {
            return false;
        }
        deps.push(dependent.clone());
        self.sources
            .entry(dependent.clone())
            .or_default()
            .push(source.clone());
        if self.watched.contains(dependent) {
            self.reach_from(source, newly_watched);
        }
        true
    }

    /// Removes the edge `dependent` depends on `source`.
    ///
    /// Returns `false` if no such edge existed.
    pub(crate) fn remove_dependency(
        &mut self,
        dependent: &PropertyKey,
        source: &PropertyKey,
        released: &mut KeyList,
    ) -> bool {
        let Some(deps) = self.deps.get_mut(source) else {
            return false;
        };
        let Some(pos) = deps.iter().position(|k| k == dependent) else {
            return false;
        };
        deps.remove(pos);
        if deps.is_empty() {
            self.deps.remove(source);
        }
        if let Some(sources) = self.sources.get_mut(dependent) {
            sources.retain(|k| k != source);
            if sources.is_empty() {
                self.sources.remove(dependent);
            }
        }
        if self.watched.contains(source) {
            self.retract_from(source, released);
        }
        true
    }
}

// Manual Debug impl since hooks aren't Debug
impl<S: Subject> fmt::Debug for Meta<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meta")
            .field("flags", &self.flags)
            .field("watchers", &self.watchers)
            .field("watched", &self.watched)
            .field("deps", &self.deps)
            .field("descriptors", &self.descriptors)
            .field("chains", &self.chains)
            .field("has_change_reaction", &self.reaction.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> PropertyKey {
        PropertyKey::from(name)
    }

    #[test]
    fn fresh_meta_is_empty() {
        let meta = Meta::<u32>::new();
        assert_eq!(meta.flags(), MetaFlags::empty());
        assert_eq!(meta.peek_watching("a"), 0);
        assert!(!meta.has_deps("a"));
        assert!(meta.readable_chain_watchers().is_none());
        assert!(!meta.has_change_reaction());
    }

    #[test]
    fn flags_toggle_independently() {
        let mut meta = Meta::<u32>::new();
        meta.set_flag(MetaFlags::INITIALIZING, true);
        meta.set_flag(MetaFlags::DESTROYING, true);
        assert!(meta.is_initializing());
        assert!(!meta.is_prototype());
        assert!(meta.is_source_destroying());

        meta.set_flag(MetaFlags::INITIALIZING, false);
        assert!(!meta.is_initializing());
        assert!(meta.is_source_destroying());
    }

    #[test]
    fn dependents_keep_registration_order() {
        let mut meta = Meta::<u32>::new();
        let mut newly = KeyList::new();
        assert!(meta.add_dependency(&key("c"), &key("a"), &mut newly));
        assert!(meta.add_dependency(&key("b"), &key("a"), &mut newly));
        assert!(!meta.add_dependency(&key("c"), &key("a"), &mut newly));

        assert_eq!(meta.dependents("a"), ["c", "b"]);
        assert_eq!(meta.dependencies("b"), ["a"]);

        let mut visited = alloc::vec::Vec::new();
        meta.for_each_in_deps("a", |k| visited.push(k.clone()));
        assert_eq!(visited, ["c", "b"]);
        assert!(newly.is_empty(), "nothing was watched");
    }

    #[test]
    fn watching_a_derived_key_watches_its_inputs() {
        let mut meta = Meta::<u32>::new();
        let mut scratch = KeyList::new();
        meta.add_dependency(&key("b"), &key("a"), &mut scratch);
        meta.add_dependency(&key("c"), &key("b"), &mut scratch);

        let mut newly = KeyList::new();
        meta.watch(&key("c"), &mut newly);
        assert_eq!(newly.as_slice(), ["c", "b", "a"]);
        assert_eq!(meta.peek_watching("a"), 1);

        // A second watcher does not cascade again.
        newly.clear();
        meta.watch(&key("c"), &mut newly);
        assert!(newly.is_empty());
        assert_eq!(meta.peek_watching("c"), 2);
        assert_eq!(meta.peek_watching("a"), 1);

        let mut released = KeyList::new();
        meta.unwatch(&key("c"), &mut released);
        assert!(released.is_empty());
        meta.unwatch(&key("c"), &mut released);
        assert_eq!(released.as_slice(), ["c", "b", "a"]);
        assert_eq!(meta.peek_watching("a"), 0);
    }

    #[test]
    fn dependency_added_to_watched_key_watches_source() {
        let mut meta = Meta::<u32>::new();
        let mut newly = KeyList::new();
        meta.watch(&key("full"), &mut newly);

        newly.clear();
        meta.add_dependency(&key("full"), &key("first"), &mut newly);
        assert_eq!(newly.as_slice(), ["first"]);

        let mut released = KeyList::new();
        assert!(meta.remove_dependency(&key("full"), &key("first"), &mut released));
        assert_eq!(released.as_slice(), ["first"]);
        assert!(!meta.has_deps("first"));
        assert!(meta.dependencies("full").is_empty());
    }

    #[test]
    fn cyclic_watch_terminates() {
        let mut meta = Meta::<u32>::new();
        let mut scratch = KeyList::new();
        meta.add_dependency(&key("a"), &key("b"), &mut scratch);
        meta.add_dependency(&key("b"), &key("a"), &mut scratch);

        let mut newly = KeyList::new();
        meta.watch(&key("a"), &mut newly);
        assert_eq!(newly.as_slice(), ["a", "b"]);
    }

    #[test]
    fn cyclic_watch_is_fully_released() {
        let mut meta = Meta::<u32>::new();
        let mut scratch = KeyList::new();
        meta.add_dependency(&key("a"), &key("b"), &mut scratch);
        meta.add_dependency(&key("b"), &key("a"), &mut scratch);

        let mut newly = KeyList::new();
        meta.watch(&key("a"), &mut newly);
        assert_eq!(meta.peek_watching("a"), 2);
        assert_eq!(meta.peek_watching("b"), 1);

        let mut released = KeyList::new();
        meta.unwatch(&key("a"), &mut released);
        assert_eq!(released.as_slice(), ["a", "b"]);
        assert_eq!(meta.peek_watching("a"), 0);
        assert_eq!(meta.peek_watching("b"), 0);
    }

    #[test]
    fn cycle_entered_from_either_side_stays_watched_until_both_release() {
        let mut meta = Meta::<u32>::new();
        let mut scratch = KeyList::new();
        meta.add_dependency(&key("a"), &key("b"), &mut scratch);
        meta.add_dependency(&key("b"), &key("a"), &mut scratch);

        meta.watch(&key("b"), &mut scratch);
        meta.watch(&key("a"), &mut scratch);

        let mut released = KeyList::new();
        meta.unwatch(&key("b"), &mut released);
        assert!(released.is_empty());
        assert!(meta.peek_watching("b") > 0, "a still depends on b");

        meta.unwatch(&key("a"), &mut released);
        assert_eq!(released.as_slice(), ["a", "b"]);
        assert_eq!(meta.peek_watching("b"), 0);
    }

    #[test]
    fn unwatching_unwatched_key_is_a_no_op() {
        let mut meta = Meta::<u32>::new();
        let mut released = KeyList::new();
        meta.unwatch(&key("a"), &mut released);
        assert!(released.is_empty());
        assert_eq!(meta.peek_watching("a"), 0);
    }
}
