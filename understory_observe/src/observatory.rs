// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The propagation context: change entry point, dependent-key walker, chain
//! bridge, observer dispatch and deferral transactions.

use alloc::rc::Rc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::{HashMap, HashSet};
use smallvec::SmallVec;

use crate::Subject;
use crate::chains::{
    Chain, ChainLink, ChainTable, ChainWatchId, PathError, PathResolver, link, parse_path,
};
use crate::config::ObserveConfig;
use crate::dirty::DirtyTags;
use crate::key::{EventName, PropertyKey};
use crate::listeners::{ChangeEvent, ListenerId, Listeners};
use crate::meta::{Descriptor, KeyList, Meta, MetaFlags};
use crate::queue::ObserverQueue;
use crate::seen::SeenSet;
use crate::transaction::{Deferral, Transaction};

/// A property-change propagation context.
///
/// `Observatory` owns everything propagation needs: the metadata of every
/// subject, the visited set of the current pass, the transaction depth, the
/// deferred observer queue, listeners, chain watchers and revision tags.
/// Separate observatories share nothing.
///
/// Subjects are host-chosen handles (`S`), typically small integer ids.
/// Callbacks (listeners, descriptor hooks, change reactions) receive
/// `&mut Observatory<S>` and may re-enter any method, including
/// [`notify_property_change`](Self::notify_property_change).
///
/// # Example
///
/// ```rust
/// use std::cell::RefCell;
/// use std::rc::Rc;
/// use understory_observe::Observatory;
///
/// let mut obs = Observatory::<u32>::new();
///
/// // `area` is derived from `width`.
/// obs.add_dependency(1, "area", "width");
///
/// let log = Rc::new(RefCell::new(Vec::new()));
/// let sink = log.clone();
/// obs.observe(1, "area", move |_, event| {
///     sink.borrow_mut().push(event.key.to_string());
/// });
///
/// obs.notify_property_change(1, "width");
/// assert_eq!(*log.borrow(), ["area"]);
///
/// // Inside a transaction, repeated changes collapse into one event.
/// obs.change_properties(|obs| {
///     obs.notify_property_change(1, "width");
///     obs.notify_property_change(1, "width");
/// });
/// assert_eq!(*log.borrow(), ["area", "area"]);
/// ```
pub struct Observatory<S: Subject> {
    config: ObserveConfig,
    subjects: HashMap<S, Meta<S>>,
    seen: SeenSet<S>,
    deferral: Deferral,
    queue: ObserverQueue<S>,
    listeners: Listeners<S>,
    /// Listener id -> key it watches, for listeners added with `observe`.
    observed: HashMap<ListenerId, PropertyKey>,
    dirty: DirtyTags<S>,
    /// Changes awaiting the next synchronous-observer flush (tracked mode).
    sync_pending: Vec<(S, PropertyKey)>,
    suspended: HashSet<(S, PropertyKey)>,
    rendering: HashSet<S>,
    chains: ChainTable<S>,
    /// Chains installed because a path key became watched.
    path_chains: HashMap<(S, PropertyKey), ChainWatchId>,
    resolver: Option<Rc<dyn PathResolver<S>>>,
}

impl<S: Subject> Default for Observatory<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subject> Observatory<S> {
    /// Creates an observatory with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ObserveConfig::default())
    }

    /// Creates an observatory with the given configuration.
    #[must_use]
    pub fn with_config(config: ObserveConfig) -> Self {
        Self {
            config,
            subjects: HashMap::new(),
            seen: SeenSet::new(),
            deferral: Deferral::default(),
            queue: ObserverQueue::new(),
            listeners: Listeners::new(),
            observed: HashMap::new(),
            dirty: DirtyTags::new(),
            sync_pending: Vec::new(),
            suspended: HashSet::new(),
            rendering: HashSet::new(),
            chains: ChainTable::default(),
            path_chains: HashMap::new(),
            resolver: None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ObserveConfig {
        &self.config
    }

    /// Installs the resolver chain watchers use to follow paths.
    ///
    /// Existing chains are not re-resolved; call
    /// [`revalidate_chains`](Self::revalidate_chains) for links that should
    /// pick up the new resolver.
    pub fn set_path_resolver<R>(&mut self, resolver: R)
    where
        R: PathResolver<S> + 'static,
    {
        self.resolver = Some(Rc::new(resolver));
    }

    /// Returns the metadata of `subject`, if it has any.
    #[must_use]
    pub fn meta(&self, subject: S) -> Option<&Meta<S>> {
        self.subjects.get(&subject)
    }

    /// Returns the revision tags.
    #[must_use]
    pub fn dirty(&self) -> &DirtyTags<S> {
        &self.dirty
    }

    /// Returns the transaction depth. Positive while a transaction is open.
    #[must_use]
    pub fn deferred(&self) -> i32 {
        self.deferral.depth()
    }

    /// Returns the number of observer events waiting for the end of the
    /// outermost transaction.
    #[must_use]
    pub fn pending_observers(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` while a dependent-key propagation pass is running.
    #[must_use]
    pub fn is_propagating(&self) -> bool {
        self.seen.is_owned()
    }

    fn meta_mut(&mut self, subject: S) -> &mut Meta<S> {
        self.subjects.entry(subject).or_insert_with(Meta::new)
    }

    // --- Change entry point ---

    /// Signals that `key` of `subject` just changed.
    ///
    /// Subjects that are initializing or prototypes ignore changes. Otherwise,
    /// in [`PropagationMode::Legacy`](crate::PropagationMode::Legacy):
    ///
    /// 1. the key's descriptor change hook runs, then, if the key is watched,
    /// 2. dependent keys are notified recursively,
    /// 3. chains through the key are notified,
    /// 4. observers are dispatched (or queued inside a transaction).
    ///
    /// In both modes the change is then stamped in the revision tags (for
    /// subjects with metadata). In [`PropagationMode::Tracked`](crate::PropagationMode::Tracked)
    /// synchronous observers are flushed when no transaction is open. Finally
    /// the subject's change reaction, if declared, runs with the key.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if `subject` is between
    /// [`begin_render`](Self::begin_render) and [`end_render`](Self::end_render).
    pub fn notify_property_change(&mut self, subject: S, key: impl Into<PropertyKey>) {
        let key = key.into();
        self.notify(subject, &key);
    }

    fn notify(&mut self, subject: S, key: &PropertyKey) {
        if self
            .subjects
            .get(&subject)
            .is_some_and(|meta| meta.is_initializing() || meta.is_prototype())
        {
            return;
        }

        if self.config.is_tracked() {
            self.revalidate_chains(subject, key);
        } else {
            let hook = self
                .subjects
                .get(&subject)
                .and_then(|meta| meta.descriptor(key.as_str()))
                .and_then(|descriptor| descriptor.did_change().cloned());
            if let Some(hook) = hook {
                hook(self, subject, key);
            }

            let watching = self
                .subjects
                .get(&subject)
                .map_or(0, |meta| meta.peek_watching(key.as_str()));
            if watching > 0 {
                self.propagate_dependents(subject, key);
                self.propagate_chains(subject, key);
                self.dispatch_observers(subject, key);
            }
        }

        // Hooks and listeners may have created or forgotten the subject.
        if self.subjects.contains_key(&subject) {
            self.dirty.mark(subject, key);
            if self.config.is_tracked() {
                self.sync_pending.push((subject, key.clone()));
            }
        }

        if self.config.is_tracked() && !self.deferral.is_open() {
            self.flush_sync_observers();
        }

        let reaction = self.subjects.get(&subject).and_then(Meta::change_reaction);
        if let Some(reaction) = reaction {
            reaction(self, subject, key);
        }

        debug_assert!(
            !self.rendering.contains(&subject),
            "`{key}` of {subject:?} changed while {subject:?} was being rendered"
        );
    }

    // --- Dependency graph walker ---

    /// Notifies every key that depends on `key`, transitively.
    ///
    /// Dependents are visited depth-first in registration order. Each
    /// `(subject, key)` pair is notified at most once per top-level pass, so
    /// cyclic dependencies terminate. Dependents suspended for `subject` are
    /// skipped. Does nothing if the subject is destroying or `key` has no
    /// dependents.
    pub fn propagate_dependents(&mut self, subject: S, key: &PropertyKey) {
        let dependents: KeyList = match self.subjects.get(&subject) {
            Some(meta) if !meta.is_source_destroying() && meta.has_deps(key.as_str()) => {
                meta.dependents(key.as_str()).iter().cloned().collect()
            }
            _ => return,
        };

        let mut pass = Pass::enter(self);
        let obs = &mut *pass.observatory;
        #[cfg(feature = "tracing")]
        if pass.top {
            tracing::trace!(?subject, %key, "dependent key pass started");
        }

        obs.seen.insert(subject, key);
        for dependent in &dependents {
            if obs.suspended.contains(&(subject, dependent.clone())) {
                continue;
            }
            if !obs.seen.insert(subject, dependent) {
                continue;
            }
            obs.notify(subject, dependent);
        }

        #[cfg(feature = "tracing")]
        if pass.top {
            tracing::trace!(
                ?subject,
                %key,
                visited = obs.seen.len(),
                "dependent key pass finished"
            );
        }
    }

    // --- Chain watcher bridge ---

    /// Notifies the roots of every chain passing through `key` of `subject`.
    ///
    /// This is a leaf notification: links downstream of the changed one are
    /// re-resolved first, then each chain's root is notified of its path key.
    pub fn propagate_chains(&mut self, subject: S, key: &PropertyKey) {
        let mut affected: SmallVec<[(ChainLink, bool); 4]> = SmallVec::new();
        match self
            .subjects
            .get(&subject)
            .and_then(Meta::readable_chain_watchers)
        {
            Some(watchers) => {
                watchers.notify(key.as_str(), true, |link, is_leaf| affected.push((link, is_leaf)));
            }
            None => return,
        }

        for (link, is_leaf) in affected {
            if is_leaf {
                self.resolve_chain(link.chain(), link.depth() + 1);
            }
            let Some((root, path)) = self
                .chains
                .get(link.chain())
                .map(|chain| (chain.root, chain.path.clone()))
            else {
                continue;
            };
            self.notify(root, &path);
        }
    }

    /// Re-resolves every chain link downstream of `key` of `subject`.
    ///
    /// Call this when the value stored under `key` was replaced by a
    /// different subject. Nothing is notified.
    pub fn revalidate_chains(&mut self, subject: S, key: &PropertyKey) {
        let mut links: SmallVec<[ChainLink; 4]> = SmallVec::new();
        if let Some(watchers) = self
            .subjects
            .get(&subject)
            .and_then(Meta::readable_chain_watchers)
        {
            watchers.revalidate(key.as_str(), |link| links.push(link));
        }
        for link in links {
            self.resolve_chain(link.chain(), link.depth() + 1);
        }
    }

    /// Watches the value at `path` (for example `"person.address.city"`)
    /// starting from `root`.
    ///
    /// Changes to any key along the path notify `root` of a change to the
    /// whole path key. Intermediate subjects are found with the resolver
    /// installed by [`set_path_resolver`](Self::set_path_resolver).
    ///
    /// Watching a path key with [`watch`](Self::watch) or
    /// [`observe`](Self::observe) installs a chain automatically.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if `path` is empty, has a single segment, or
    /// contains an empty segment.
    pub fn watch_path(
        &mut self,
        root: S,
        path: impl Into<PropertyKey>,
    ) -> Result<ChainWatchId, PathError> {
        let path = path.into();
        let segments = parse_path(&path)?;
        let first = segments[0].clone();
        let id = self.chains.insert(Chain::new(root, path, segments));
        self.subscribe_link(root, &first, link(id, 0));
        self.resolve_chain(id, 1);
        Ok(id)
    }

    /// Removes a chain created by [`watch_path`](Self::watch_path).
    ///
    /// Returns `false` if the chain no longer exists.
    pub fn unwatch_path(&mut self, id: ChainWatchId) -> bool {
        let Some(chain) = self.chains.remove(id) else {
            return false;
        };
        for (depth, hop) in chain.hops.iter().enumerate() {
            if let Some(subject) = *hop {
                self.unsubscribe_link(subject, &chain.segments[depth], link(id, depth));
            }
        }
        true
    }

    /// Moves the links of chain `id` from `from` onward to the subjects the
    /// path currently resolves to.
    fn resolve_chain(&mut self, id: ChainWatchId, from: usize) {
        let Some(chain) = self.chains.get(id) else {
            return;
        };
        let hops = chain.resolve_from(from, self.resolver.as_deref());
        let previous = chain.hops.clone();
        let segments = chain.segments.clone();
        #[cfg(feature = "tracing")]
        let path = chain.path.clone();

        for depth in from.max(1)..segments.len() {
            if previous[depth] == hops[depth] {
                continue;
            }
            #[cfg(feature = "tracing")]
            tracing::trace!(
                %path,
                depth,
                from = ?previous[depth],
                to = ?hops[depth],
                "chain link moved"
            );
            if let Some(old) = previous[depth] {
                self.unsubscribe_link(old, &segments[depth], link(id, depth));
            }
            if let Some(new) = hops[depth] {
                self.subscribe_link(new, &segments[depth], link(id, depth));
            }
        }

        if let Some(chain) = self.chains.get_mut(id) {
            chain.hops = hops;
        }
    }

    fn subscribe_link(&mut self, subject: S, key: &PropertyKey, link: ChainLink) {
        let mut newly = KeyList::new();
        let meta = self.meta_mut(subject);
        meta.chain_watchers_mut().add(key, link);
        meta.watch(key, &mut newly);
        self.install_path_chains(subject, &newly);
    }

    fn unsubscribe_link(&mut self, subject: S, key: &PropertyKey, link: ChainLink) {
        let mut released = KeyList::new();
        let Some(meta) = self.subjects.get_mut(&subject) else {
            return;
        };
        if meta.chain_watchers_mut().remove(key, link) {
            meta.unwatch(key, &mut released);
        }
        self.remove_path_chains(subject, &released);
    }

    fn install_path_chains(&mut self, subject: S, keys: &[PropertyKey]) {
        for key in keys.iter().filter(|key| key.is_path()) {
            match self.watch_path(subject, key) {
                Ok(id) => {
                    self.path_chains.insert((subject, key.clone()), id);
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        ?subject,
                        %key,
                        error = %_err,
                        "watched key is not a valid path"
                    );
                }
            }
        }
    }

    fn remove_path_chains(&mut self, subject: S, keys: &[PropertyKey]) {
        for key in keys.iter().filter(|key| key.is_path()) {
            if let Some(id) = self.path_chains.remove(&(subject, key.clone())) {
                self.unwatch_path(id);
            }
        }
    }

    // --- Observer dispatch ---

    /// Dispatches the change event of `key` to observers of `subject`.
    ///
    /// Inside a transaction the event is queued instead; queuing the same
    /// `(subject, event)` pair again before the flush has no further effect.
    /// Does nothing if the subject is destroying.
    pub fn dispatch_observers(&mut self, subject: S, key: &PropertyKey) {
        if self
            .subjects
            .get(&subject)
            .is_some_and(Meta::is_source_destroying)
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(?subject, %key, "change of destroying subject not dispatched");
            return;
        }
        let event = EventName::change(key);
        if self.deferral.is_open() {
            self.queue.add(subject, key, event);
        } else {
            self.send(subject, key, event);
        }
    }

    /// Sends `event` to the listeners of `subject` immediately, with `key` as
    /// the payload's key.
    pub fn send_event(&mut self, subject: S, event: EventName, key: impl Into<PropertyKey>) {
        let key = key.into();
        self.send(subject, &key, event);
    }

    fn send(&mut self, subject: S, key: &PropertyKey, event: EventName) {
        let listeners = self.listeners.snapshot(subject, &event);
        if listeners.is_empty() {
            return;
        }
        let payload = ChangeEvent {
            subject,
            key: key.clone(),
            event,
        };
        for listener in listeners {
            listener(self, &payload);
        }
    }

    /// Dispatches every queued observer event exactly once.
    ///
    /// Events queued while flushing are dispatched by the same call, so the
    /// queue is empty when this returns. Subjects that started destroying
    /// after their event was queued are skipped.
    pub fn flush_observers(&mut self) {
        while !self.queue.is_empty() {
            let batch = self.queue.take();
            #[cfg(feature = "tracing")]
            tracing::trace!(entries = batch.len(), "flushing observer queue");
            for entry in batch {
                if self
                    .subjects
                    .get(&entry.subject)
                    .is_some_and(Meta::is_source_destroying)
                {
                    continue;
                }
                self.send(entry.subject, &entry.key, entry.event);
            }
        }
    }

    /// Dispatches observers affected by changes recorded since the last flush
    /// ([`PropagationMode::Tracked`](crate::PropagationMode::Tracked)).
    ///
    /// Each changed key is expanded through its dependents and the chains
    /// passing through it. Every watched `(subject, key)` reached is
    /// dispatched once per flush, in depth-first order.
    pub fn flush_sync_observers(&mut self) {
        loop {
            let pending = core::mem::take(&mut self.sync_pending);
            if pending.is_empty() {
                break;
            }
            let mut visited = HashSet::new();
            let mut reached = Vec::new();
            for (subject, key) in pending {
                self.collect_affected(subject, key, &mut visited, &mut reached);
            }
            #[cfg(feature = "tracing")]
            tracing::trace!(reached = reached.len(), "flushing synchronous observers");

            for (subject, key) in reached {
                let dispatch = self.subjects.get(&subject).is_some_and(|meta| {
                    !meta.is_source_destroying() && meta.peek_watching(key.as_str()) > 0
                });
                if dispatch {
                    let event = EventName::change(&key);
                    self.send(subject, &key, event);
                }
            }
        }
    }

    fn collect_affected(
        &self,
        subject: S,
        key: PropertyKey,
        visited: &mut HashSet<(S, PropertyKey)>,
        reached: &mut Vec<(S, PropertyKey)>,
    ) {
        let mut stack = alloc::vec![(subject, key)];
        while let Some((subject, key)) = stack.pop() {
            if !visited.insert((subject, key.clone())) {
                continue;
            }
            reached.push((subject, key.clone()));

            let Some(meta) = self.subjects.get(&subject) else {
                continue;
            };
            if meta.is_source_destroying() {
                continue;
            }
            let mut next: SmallVec<[(S, PropertyKey); 4]> = meta
                .dependents(key.as_str())
                .iter()
                .filter(|dependent| !self.suspended.contains(&(subject, (*dependent).clone())))
                .map(|dependent| (subject, dependent.clone()))
                .collect();
            if let Some(watchers) = meta.readable_chain_watchers() {
                watchers.notify(key.as_str(), false, |link, _| {
                    if let Some(chain) = self.chains.get(link.chain()) {
                        next.push((chain.root, chain.path.clone()));
                    }
                });
            }
            stack.extend(next.into_iter().rev());
        }
    }

    // --- Deferral transactions ---

    /// Opens a transaction: observer events are queued until the outermost
    /// transaction ends.
    pub fn begin_property_changes(&mut self) {
        self.deferral.begin();
    }

    /// Closes a transaction opened by
    /// [`begin_property_changes`](Self::begin_property_changes).
    ///
    /// Closing the outermost transaction flushes the observer queue (or the
    /// synchronous observers in tracked mode). Calling this without a
    /// matching begin is a caller error; the depth goes negative and is not
    /// corrected.
    pub fn end_property_changes(&mut self) {
        if !self.deferral.end() {
            return;
        }
        #[cfg(feature = "tracing")]
        if self.deferral.depth() < 0 {
            tracing::warn!(
                depth = self.deferral.depth(),
                "end_property_changes without matching begin"
            );
        }
        if self.config.is_tracked() {
            self.flush_sync_observers();
        } else {
            self.flush_observers();
        }
    }

    /// Closes one transaction level without flushing.
    ///
    /// Queued events stay pending for the next outermost end or an explicit
    /// [`flush_observers`](Self::flush_observers).
    pub(crate) fn abandon_property_changes(&mut self) {
        if self.deferral.end() {
            #[cfg(feature = "tracing")]
            tracing::debug!(pending = self.queue.len(), "transaction closed without dispatching");
        }
    }

    /// Opens a transaction that ends when the returned guard is committed.
    ///
    /// See [`Transaction`] for what dropping the guard uncommitted does.
    pub fn transaction(&mut self) -> Transaction<'_, S> {
        Transaction::new(self)
    }

    /// Runs `f` inside a transaction and returns its result.
    ///
    /// The transaction ends exactly once however `f` exits. On return
    /// (including returning an `Err`) queued events are dispatched. If `f`
    /// panics the depth is restored while unwinding and no listener runs;
    /// the queued events stay pending.
    ///
    /// ```rust
    /// use understory_observe::Observatory;
    ///
    /// let mut obs = Observatory::<u32>::new();
    /// let result: Result<(), &str> = obs.change_properties(|obs| {
    ///     obs.notify_property_change(1, "width");
    ///     Err("validation failed")
    /// });
    /// assert!(result.is_err());
    /// assert_eq!(obs.deferred(), 0);
    /// ```
    pub fn change_properties<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let mut tx = self.transaction();
        let result = f(&mut *tx);
        tx.commit();
        result
    }

    // --- Registration ---

    /// Adds a watcher to `key` of `subject`.
    ///
    /// Only watched keys run dependent, chain and observer propagation in
    /// legacy mode. Watching a key also watches every key it depends on, and
    /// watching a path key installs a chain for it.
    pub fn watch(&mut self, subject: S, key: impl Into<PropertyKey>) {
        let key = key.into();
        let mut newly = KeyList::new();
        self.meta_mut(subject).watch(&key, &mut newly);
        self.install_path_chains(subject, &newly);
    }

    /// Removes a watcher added by [`watch`](Self::watch).
    pub fn unwatch(&mut self, subject: S, key: impl Into<PropertyKey>) {
        let key = key.into();
        let mut released = KeyList::new();
        if let Some(meta) = self.subjects.get_mut(&subject) {
            meta.unwatch(&key, &mut released);
        }
        self.remove_path_chains(subject, &released);
    }

    /// Declares that `dependent` of `subject` is derived from `source`.
    ///
    /// `source` may be a path key such as `"person.name"`. Returns `false` if
    /// the dependency was already registered. Cycles are allowed; propagation
    /// visits each key once per pass.
    pub fn add_dependency(
        &mut self,
        subject: S,
        dependent: impl Into<PropertyKey>,
        source: impl Into<PropertyKey>,
    ) -> bool {
        let (dependent, source) = (dependent.into(), source.into());
        let mut newly = KeyList::new();
        let added = self
            .meta_mut(subject)
            .add_dependency(&dependent, &source, &mut newly);
        self.install_path_chains(subject, &newly);
        added
    }

    /// Removes a dependency added by [`add_dependency`](Self::add_dependency).
    ///
    /// Returns `false` if it was not registered.
    pub fn remove_dependency(
        &mut self,
        subject: S,
        dependent: impl Into<PropertyKey>,
        source: impl Into<PropertyKey>,
    ) -> bool {
        let (dependent, source) = (dependent.into(), source.into());
        let mut released = KeyList::new();
        let Some(meta) = self.subjects.get_mut(&subject) else {
            return false;
        };
        let removed = meta.remove_dependency(&dependent, &source, &mut released);
        self.remove_path_chains(subject, &released);
        removed
    }

    /// Attaches a descriptor to `key` of `subject`, replacing any previous one.
    pub fn define_descriptor(
        &mut self,
        subject: S,
        key: impl Into<PropertyKey>,
        descriptor: Descriptor<S>,
    ) {
        self.meta_mut(subject).set_descriptor(key.into(), descriptor);
    }

    /// Removes the descriptor of `key`. Returns `false` if there was none.
    pub fn remove_descriptor(&mut self, subject: S, key: &str) -> bool {
        self.subjects
            .get_mut(&subject)
            .is_some_and(|meta| meta.remove_descriptor(key))
    }

    /// Declares that `subject` reacts to its own property changes.
    ///
    /// `reaction` runs with each changed key after all other propagation for
    /// that change, independently of watchers and observers.
    pub fn react_to_changes<F>(&mut self, subject: S, reaction: F)
    where
        F: Fn(&mut Self, S, &PropertyKey) + 'static,
    {
        self.meta_mut(subject).set_change_reaction(Some(Rc::new(reaction)));
    }

    /// Removes the change reaction of `subject`.
    pub fn clear_change_reaction(&mut self, subject: S) {
        if let Some(meta) = self.subjects.get_mut(&subject) {
            meta.set_change_reaction(None);
        }
    }

    /// Observes changes of `key` on `subject`.
    ///
    /// Registers `listener` for the key's change event and watches the key.
    /// Remove it with [`remove_listener`](Self::remove_listener).
    pub fn observe<F>(&mut self, subject: S, key: impl Into<PropertyKey>, listener: F) -> ListenerId
    where
        F: Fn(&mut Self, &ChangeEvent<S>) + 'static,
    {
        let key = key.into();
        let id = self
            .listeners
            .add(subject, EventName::change(&key), Rc::new(listener));
        self.observed.insert(id, key.clone());
        self.watch(subject, key);
        id
    }

    /// Registers `listener` for `event` on `subject` without watching anything.
    pub fn add_listener<F>(&mut self, subject: S, event: EventName, listener: F) -> ListenerId
    where
        F: Fn(&mut Self, &ChangeEvent<S>) + 'static,
    {
        self.listeners.add(subject, event, Rc::new(listener))
    }

    /// Removes a listener. Removing an observer also drops its watch.
    ///
    /// Returns `false` if the listener was already removed.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let Some((subject, _)) = self.listeners.remove(id) else {
            return false;
        };
        if let Some(key) = self.observed.remove(&id) {
            self.unwatch(subject, key);
        }
        true
    }

    /// Returns the number of listeners for `event` on `subject`.
    #[must_use]
    pub fn listener_count(&self, subject: S, event: &EventName) -> usize {
        self.listeners.count(subject, event)
    }

    // --- Suspension ---

    /// Suspends `key` of `subject`: dependent-key propagation skips it.
    ///
    /// This lets a computed key recompute (and write its inputs) without
    /// re-notifying itself. Returns `false` if it was already suspended.
    pub fn suspend(&mut self, subject: S, key: impl Into<PropertyKey>) -> bool {
        self.suspended.insert((subject, key.into()))
    }

    /// Lifts a suspension. Returns `false` if `key` was not suspended.
    pub fn resume(&mut self, subject: S, key: impl Into<PropertyKey>) -> bool {
        self.suspended.remove(&(subject, key.into()))
    }

    /// Returns `true` if `key` of `subject` is suspended.
    #[must_use]
    pub fn is_suspended(&self, subject: S, key: &PropertyKey) -> bool {
        self.suspended.contains(&(subject, key.clone()))
    }

    /// Runs `f` with `key` of `subject` suspended.
    ///
    /// The suspension is lifted when `f` exits, unless it was already in
    /// place before the call.
    pub fn with_suspended<R>(
        &mut self,
        subject: S,
        key: impl Into<PropertyKey>,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let mut guard = Suspension::new(self, subject, key.into());
        f(&mut *guard.observatory)
    }

    // --- Lifecycle ---

    /// Marks `subject` as initializing; its changes are ignored until
    /// [`finish_init`](Self::finish_init).
    pub fn begin_init(&mut self, subject: S) {
        self.meta_mut(subject).set_flag(MetaFlags::INITIALIZING, true);
    }

    /// Ends initialization of `subject`.
    pub fn finish_init(&mut self, subject: S) {
        if let Some(meta) = self.subjects.get_mut(&subject) {
            meta.set_flag(MetaFlags::INITIALIZING, false);
        }
    }

    /// Marks `subject` as a prototype; its changes are ignored.
    pub fn mark_prototype(&mut self, subject: S) {
        self.meta_mut(subject).set_flag(MetaFlags::PROTOTYPE, true);
    }

    /// Starts tearing `subject` down.
    ///
    /// Dependent-key propagation and observer dispatch from the subject stop;
    /// its changes are still stamped in the revision tags. Queued events for
    /// it are dropped at flush.
    pub fn destroy(&mut self, subject: S) {
        self.meta_mut(subject).set_flag(MetaFlags::DESTROYING, true);
    }

    /// Discards everything known about `subject`: metadata, listeners,
    /// revision tags, suspensions and the chains rooted at it.
    pub fn forget(&mut self, subject: S) {
        for id in self.chains.rooted_at(subject) {
            self.unwatch_path(id);
        }
        self.path_chains.retain(|(root, _), _| *root != subject);
        self.listeners.remove_subject(subject);
        let listeners = &self.listeners;
        self.observed.retain(|id, _| listeners.target(*id).is_some());
        self.dirty.remove_subject(subject);
        self.suspended.retain(|(s, _)| *s != subject);
        self.sync_pending.retain(|(s, _)| *s != subject);
        self.rendering.remove(&subject);
        self.subjects.remove(&subject);
    }

    // --- Render guard ---

    /// Marks `subject` as being rendered. Changing it before
    /// [`end_render`](Self::end_render) is a programmer error caught in debug
    /// builds.
    pub fn begin_render(&mut self, subject: S) {
        self.rendering.insert(subject);
    }

    /// Ends the render bracket opened by [`begin_render`](Self::begin_render).
    pub fn end_render(&mut self, subject: S) {
        self.rendering.remove(&subject);
    }

    /// Returns `true` between [`begin_render`](Self::begin_render) and
    /// [`end_render`](Self::end_render).
    #[must_use]
    pub fn is_rendering(&self, subject: S) -> bool {
        self.rendering.contains(&subject)
    }
}

impl<S: Subject> fmt::Debug for Observatory<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observatory")
            .field("config", &self.config)
            .field("subjects", &self.subjects.len())
            .field("deferred", &self.deferral.depth())
            .field("pending_observers", &self.queue.len())
            .field("chains", &self.chains.len())
            .field("listeners", &self.listeners)
            .field("revision", &self.dirty.revision())
            .finish_non_exhaustive()
    }
}

/// Ownership of the visited set for the duration of one walker call.
///
/// Dropping it releases the pass, so an unwinding panic cannot leave stale
/// entries behind for the next pass.
struct Pass<'a, S: Subject> {
    observatory: &'a mut Observatory<S>,
    top: bool,
}

impl<'a, S: Subject> Pass<'a, S> {
    fn enter(observatory: &'a mut Observatory<S>) -> Self {
        let top = observatory.seen.enter();
        Self { observatory, top }
    }
}

impl<S: Subject> Drop for Pass<'_, S> {
    fn drop(&mut self) {
        self.observatory.seen.release(self.top);
    }
}

/// Scoped suspension used by [`Observatory::with_suspended`].
struct Suspension<'a, S: Subject> {
    observatory: &'a mut Observatory<S>,
    subject: S,
    key: PropertyKey,
    inserted: bool,
}

impl<'a, S: Subject> Suspension<'a, S> {
    fn new(observatory: &'a mut Observatory<S>, subject: S, key: PropertyKey) -> Self {
        let inserted = observatory.suspended.insert((subject, key.clone()));
        Self {
            observatory,
            subject,
            key,
            inserted,
        }
    }
}

impl<S: Subject> Drop for Suspension<'_, S> {
    fn drop(&mut self) {
        if self.inserted {
            self.observatory
                .suspended
                .remove(&(self.subject, self.key.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use alloc::format;
    use alloc::string::{String, ToString};
    use core::cell::{Cell, RefCell};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    type Log = Rc<RefCell<Vec<String>>>;

    fn record(obs: &mut Observatory<u32>, subject: u32, key: &str, log: &Log) -> ListenerId {
        let log = log.clone();
        obs.observe(subject, key, move |_, event| {
            log.borrow_mut().push(event.key.to_string());
        })
    }

    /// Resolver where `1.person` points at whatever `person` holds.
    fn person_resolver(
        person: &Rc<Cell<u32>>,
    ) -> impl Fn(u32, &PropertyKey) -> Option<u32> + 'static {
        let person = person.clone();
        move |subject: u32, key: &PropertyKey| {
            (subject == 1 && key == "person").then(|| person.get())
        }
    }

    #[test]
    fn pass_is_released_after_propagation() {
        let mut obs = Observatory::<u32>::new();
        let log = Log::default();
        obs.add_dependency(1, "b", "a");
        record(&mut obs, 1, "b", &log);

        obs.notify_property_change(1, "a");
        assert!(!obs.is_propagating());

        // A second top-level pass starts from an empty visited set.
        obs.notify_property_change(1, "a");
        assert_eq!(*log.borrow(), ["b", "b"]);
    }

    #[test]
    fn panicking_listener_releases_the_pass() {
        let mut obs = Observatory::<u32>::new();
        obs.add_dependency(1, "b", "a");
        obs.observe(1, "b", |_, _| panic!("listener failed"));

        let result = catch_unwind(AssertUnwindSafe(|| obs.notify_property_change(1, "a")));
        assert!(result.is_err(), "listener panic propagates");
        assert!(!obs.is_propagating(), "unwinding released the visited set");
    }

    #[test]
    fn panicking_transaction_body_restores_depth_without_dispatch() {
        let mut obs = Observatory::<u32>::new();
        let log = Log::default();
        record(&mut obs, 1, "a", &log);

        let result = catch_unwind(AssertUnwindSafe(|| {
            obs.change_properties(|obs| {
                obs.notify_property_change(1, "a");
                panic!("transaction body failed");
            });
        }));
        assert!(result.is_err(), "body panic propagates");
        assert_eq!(obs.deferred(), 0);
        assert!(log.borrow().is_empty(), "no listener runs while unwinding");
        assert_eq!(obs.pending_observers(), 1);

        obs.flush_observers();
        assert_eq!(*log.borrow(), ["a"]);
    }

    #[test]
    fn panicking_listener_and_body_unwind_once() {
        let mut obs = Observatory::<u32>::new();
        obs.observe(1, "a", |_, _| panic!("listener failed"));

        let result = catch_unwind(AssertUnwindSafe(|| {
            obs.change_properties(|obs| {
                obs.notify_property_change(1, "a");
                panic!("transaction body failed");
            });
        }));
        let message = result.expect_err("body panic propagates");
        assert_eq!(message.downcast_ref::<&str>(), Some(&"transaction body failed"));
        assert_eq!(obs.deferred(), 0);
    }

    #[test]
    fn listener_panicking_on_commit_ends_the_transaction_once() {
        let mut obs = Observatory::<u32>::new();
        obs.observe(1, "a", |_, _| panic!("listener failed"));

        let result = catch_unwind(AssertUnwindSafe(|| {
            obs.change_properties(|obs| obs.notify_property_change(1, "a"));
        }));
        assert!(result.is_err(), "listener panic propagates");
        assert_eq!(obs.deferred(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "was being rendered")]
    fn change_during_render_is_caught() {
        let mut obs = Observatory::<u32>::new();
        obs.begin_render(1);
        obs.notify_property_change(1, "a");
    }

    #[test]
    fn render_bracket_is_scoped_to_subject() {
        let mut obs = Observatory::<u32>::new();
        obs.begin_render(1);
        obs.notify_property_change(2, "a");
        assert!(obs.is_rendering(1));
        obs.end_render(1);
        obs.notify_property_change(1, "a");
        assert!(!obs.is_rendering(1));
    }

    #[test]
    fn chain_links_follow_replaced_intermediate() {
        let person = Rc::new(Cell::new(2));
        let mut obs = Observatory::<u32>::new();
        obs.set_path_resolver(person_resolver(&person));

        let id = obs.watch_path(1, "person.name").unwrap();
        assert_eq!(obs.meta(1).unwrap().peek_watching("person"), 1);
        assert_eq!(obs.meta(2).unwrap().peek_watching("name"), 1);

        let reached = Log::default();
        let sink = reached.clone();
        obs.react_to_changes(1, move |_, _, key| sink.borrow_mut().push(key.to_string()));

        person.set(3);
        obs.notify_property_change(1, "person");
        assert_eq!(*reached.borrow(), ["person.name", "person"]);

        assert!(obs.meta(2).unwrap().readable_chain_watchers().is_none());
        assert_eq!(obs.meta(2).unwrap().peek_watching("name"), 0);
        let links = obs.meta(3).unwrap().readable_chain_watchers().unwrap();
        assert_eq!(links.links("name").len(), 1);
        assert_eq!(links.links("name")[0].chain(), id);
        assert_eq!(links.links("name")[0].depth(), 1);
    }

    #[test]
    fn unwatch_path_releases_every_link() {
        let person = Rc::new(Cell::new(2));
        let mut obs = Observatory::<u32>::new();
        obs.set_path_resolver(person_resolver(&person));

        let id = obs.watch_path(1, "person.name").unwrap();
        assert!(obs.unwatch_path(id));
        assert!(!obs.unwatch_path(id), "stale handle");

        assert_eq!(obs.meta(1).unwrap().peek_watching("person"), 0);
        assert!(obs.meta(1).unwrap().readable_chain_watchers().is_none());
        assert!(obs.meta(2).unwrap().readable_chain_watchers().is_none());
        assert_eq!(obs.chains.len(), 0);
    }

    #[test]
    fn watch_count_on_path_key_drives_chain() {
        let mut obs = Observatory::<u32>::new();
        obs.watch(1, "person.name");
        obs.watch(1, "person.name");
        assert_eq!(obs.chains.len(), 1);

        obs.unwatch(1, "person.name");
        assert_eq!(obs.chains.len(), 1);
        obs.unwatch(1, "person.name");
        assert_eq!(obs.chains.len(), 0);
        assert!(obs.path_chains.is_empty());
    }

    #[test]
    fn malformed_path_key_is_watched_as_plain_key() {
        let mut obs = Observatory::<u32>::new();
        obs.watch(1, "a..b");
        assert_eq!(obs.chains.len(), 0);
        assert_eq!(obs.meta(1).unwrap().peek_watching("a..b"), 1);
    }

    #[test]
    fn forget_drops_subject_state() {
        let person = Rc::new(Cell::new(2));
        let mut obs = Observatory::<u32>::new();
        obs.set_path_resolver(person_resolver(&person));
        let log = Log::default();
        record(&mut obs, 1, "title", &log);
        obs.add_dependency(1, "title", "person.name");
        obs.suspend(1, "title");
        obs.notify_property_change(1, "title");
        assert_eq!(obs.chains.len(), 1);

        obs.forget(1);
        assert!(obs.meta(1).is_none());
        assert_eq!(obs.dirty().tag(1, "title"), None);
        assert_eq!(obs.chains.len(), 0);
        assert!(!obs.is_suspended(1, &PropertyKey::from("title")));
        assert_eq!(obs.listener_count(1, &EventName::new("title:change")), 0);
        assert!(obs.observed.is_empty());
        assert!(obs.meta(2).unwrap().readable_chain_watchers().is_none());
    }

    #[test]
    fn with_suspended_keeps_prior_suspension() {
        let mut obs = Observatory::<u32>::new();
        let key = PropertyKey::from("b");

        obs.with_suspended(1, "b", |obs| assert!(obs.is_suspended(1, &PropertyKey::from("b"))));
        assert!(!obs.is_suspended(1, &key));

        obs.suspend(1, "b");
        obs.with_suspended(1, "b", |_| {});
        assert!(obs.is_suspended(1, &key), "outer suspension survives");
        assert!(obs.resume(1, "b"));
        assert!(!obs.resume(1, "b"));
    }

    #[test]
    fn unbalanced_end_leaves_depth_negative() {
        let mut obs = Observatory::<u32>::new();
        let log = Log::default();
        record(&mut obs, 1, "a", &log);

        obs.end_property_changes();
        assert_eq!(obs.deferred(), -1);

        // Depth 0 is still "not deferred".
        obs.begin_property_changes();
        obs.notify_property_change(1, "a");
        assert_eq!(*log.borrow(), ["a"]);
        assert_eq!(obs.pending_observers(), 0);
    }

    #[test]
    fn debug_output_summarizes_state() {
        let mut obs = Observatory::<u32>::new();
        obs.watch(1, "a");
        let text = format!("{obs:?}");
        assert!(text.starts_with("Observatory"), "{text}");
        assert!(text.contains("subjects: 1"), "{text}");
    }
}
