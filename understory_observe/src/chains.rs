// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Chain watchers: subscriptions to values reached through a path of keys.
//!
//! A chain for `root` and the path `"person.address.city"` subscribes to
//! `person` on `root`, to `address` on whatever `root.person` currently is, and
//! to `city` on whatever `root.person.address` currently is. Each of those
//! subscriptions is a [`ChainLink`] stored in the [`ChainWatchers`] of the
//! subject it sits on. A change to any linked key is reported to `root` as a
//! change of the whole path key.
//!
//! Intermediate subjects are found with a host-supplied [`PathResolver`].

use alloc::vec::Vec;
use core::fmt;
use core::hash::Hash;

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::key::{PATH_SEPARATOR, PropertyKey};

/// Resolves the subject stored under a key of another subject.
///
/// Chain watchers use this to follow a path one segment at a time. Returning
/// `None` ends the chain at that hop until it is revalidated.
///
/// Any `Fn(S, &PropertyKey) -> Option<S>` closure implements this trait.
pub trait PathResolver<S> {
    /// Returns the subject that `subject.key` currently refers to.
    fn resolve(&self, subject: S, key: &PropertyKey) -> Option<S>;
}

impl<S, F> PathResolver<S> for F
where
    F: Fn(S, &PropertyKey) -> Option<S>,
{
    #[inline]
    fn resolve(&self, subject: S, key: &PropertyKey) -> Option<S> {
        self(subject, key)
    }
}

/// Error returned when a key cannot be watched as a path.
#[derive(Clone, PartialEq, Eq)]
pub enum PathError {
    /// The path was empty.
    Empty,
    /// The path has a single segment; plain keys are watched directly.
    SingleSegment {
        /// The offending path.
        path: PropertyKey,
    },
    /// The path contains an empty segment (`"a..b"`, `".a"`, `"a."`).
    EmptySegment {
        /// The offending path.
        path: PropertyKey,
    },
}

impl fmt::Debug for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("PathError::Empty"),
            Self::SingleSegment { path } => write!(f, "PathError::SingleSegment({path:?})"),
            Self::EmptySegment { path } => write!(f, "PathError::EmptySegment({path:?})"),
        }
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("cannot watch an empty path"),
            Self::SingleSegment { path } => {
                write!(f, "`{path}` has a single segment and is not a path")
            }
            Self::EmptySegment { path } => write!(f, "`{path}` contains an empty segment"),
        }
    }
}

impl core::error::Error for PathError {}

/// Splits a path key into its segments, validating it.
pub(crate) fn parse_path(path: &PropertyKey) -> Result<SmallVec<[PropertyKey; 4]>, PathError> {
    if path.as_str().is_empty() {
        return Err(PathError::Empty);
    }
    let mut segments = SmallVec::new();
    for segment in path.as_str().split(PATH_SEPARATOR) {
        if segment.is_empty() {
            return Err(PathError::EmptySegment { path: path.clone() });
        }
        segments.push(PropertyKey::new(segment));
    }
    if segments.len() < 2 {
        return Err(PathError::SingleSegment { path: path.clone() });
    }
    Ok(segments)
}

/// Handle to a chain created by [`Observatory::watch_path`](crate::Observatory::watch_path).
///
/// Handles carry a generation, so a stale handle never aliases a newer chain
/// that reused its slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainWatchId {
    index: u32,
    generation: u32,
}

/// One segment of a chain, subscribed on the subject it sits on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainLink {
    chain: ChainWatchId,
    depth: usize,
}

impl ChainLink {
    /// Returns the chain this link belongs to.
    #[must_use]
    #[inline]
    pub fn chain(self) -> ChainWatchId {
        self.chain
    }

    /// Returns the segment index of this link within its path (0 = root).
    #[must_use]
    #[inline]
    pub fn depth(self) -> usize {
        self.depth
    }
}

/// Per-subject chain-watcher state: which chain links sit on which key.
#[derive(Debug, Default, Clone)]
pub struct ChainWatchers {
    links: HashMap<PropertyKey, SmallVec<[ChainLink; 2]>>,
}

impl ChainWatchers {
    /// Creates empty chain-watcher state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
        }
    }

    /// Returns `true` if no links are subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Returns the links subscribed to `key`, in subscription order.
    #[must_use]
    pub fn links(&self, key: &str) -> &[ChainLink] {
        match self.links.get(key) {
            Some(links) => links,
            None => &[],
        }
    }

    /// Reports a change of `key` to every link subscribed to it.
    ///
    /// `callback` receives each link together with `is_leaf`, which tells the
    /// caller whether the links downstream of this one must be re-resolved
    /// before the owning chain's root is notified.
    pub fn notify(&self, key: &str, is_leaf: bool, mut callback: impl FnMut(ChainLink, bool)) {
        for link in self.links(key) {
            callback(*link, is_leaf);
        }
    }

    /// Reports every link subscribed to `key` for re-resolution, without
    /// notifying anything.
    pub fn revalidate(&self, key: &str, mut callback: impl FnMut(ChainLink)) {
        for link in self.links(key) {
            callback(*link);
        }
    }

    pub(crate) fn add(&mut self, key: &PropertyKey, link: ChainLink) {
        match self.links.get_mut(key) {
            Some(links) => links.push(link),
            None => {
                let mut links = SmallVec::new();
                links.push(link);
                self.links.insert(key.clone(), links);
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &PropertyKey, link: ChainLink) -> bool {
        let Some(links) = self.links.get_mut(key) else {
            return false;
        };
        let Some(pos) = links.iter().position(|l| *l == link) else {
            return false;
        };
        links.remove(pos);
        if links.is_empty() {
            self.links.remove(key);
        }
        true
    }
}

/// A watched path rooted at one subject.
#[derive(Debug, Clone)]
pub(crate) struct Chain<S> {
    pub(crate) root: S,
    pub(crate) path: PropertyKey,
    pub(crate) segments: SmallVec<[PropertyKey; 4]>,
    /// `hops[i]` is the subject on which `segments[i]` is subscribed.
    pub(crate) hops: SmallVec<[Option<S>; 4]>,
}

impl<S: Copy> Chain<S> {
    /// Creates an unresolved chain; only the root hop is known.
    pub(crate) fn new(root: S, path: PropertyKey, segments: SmallVec<[PropertyKey; 4]>) -> Self {
        let mut hops = SmallVec::with_capacity(segments.len());
        hops.push(Some(root));
        hops.resize(segments.len(), None);
        Self {
            root,
            path,
            segments,
            hops,
        }
    }

    /// Computes the hops from `from` onward against the current values.
    ///
    /// Hops before `from` are kept as they are; the root hop never changes.
    pub(crate) fn resolve_from(
        &self,
        from: usize,
        resolver: Option<&dyn PathResolver<S>>,
    ) -> SmallVec<[Option<S>; 4]> {
        let mut hops = self.hops.clone();
        for depth in from.max(1)..self.segments.len() {
            hops[depth] = match (hops[depth - 1], resolver) {
                (Some(parent), Some(resolver)) => {
                    resolver.resolve(parent, &self.segments[depth - 1])
                }
                _ => None,
            };
        }
        hops
    }
}

#[derive(Debug)]
struct Slot<S> {
    generation: u32,
    chain: Option<Chain<S>>,
}

/// Generational storage for every live chain of an observatory.
#[derive(Debug)]
pub(crate) struct ChainTable<S> {
    slots: Vec<Slot<S>>,
    free: Vec<u32>,
}

impl<S> Default for ChainTable<S> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<S> ChainTable<S>
where
    S: Copy + Eq + Hash,
{
    pub(crate) fn insert(&mut self, chain: Chain<S>) -> ChainWatchId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.chain = Some(chain);
            return ChainWatchId {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).expect("chain table exceeded u32::MAX slots");
        self.slots.push(Slot {
            generation: 0,
            chain: Some(chain),
        });
        ChainWatchId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, id: ChainWatchId) -> Option<&Chain<S>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.chain.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: ChainWatchId) -> Option<&mut Chain<S>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.chain.as_mut()
    }

    pub(crate) fn remove(&mut self, id: ChainWatchId) -> Option<Chain<S>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let chain = slot.chain.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(chain)
    }

    /// Returns the ids of every chain rooted at `root`.
    pub(crate) fn rooted_at(&self, root: S) -> Vec<ChainWatchId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let chain = slot.chain.as_ref()?;
                let index = u32::try_from(index).ok()?;
                (chain.root == root).then_some(ChainWatchId {
                    index,
                    generation: slot.generation,
                })
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.chain.is_some()).count()
    }
}

pub(crate) fn link(chain: ChainWatchId, depth: usize) -> ChainLink {
    ChainLink { chain, depth }
}
