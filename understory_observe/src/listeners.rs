// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Listener registry: the event-sending side of observer dispatch.

use alloc::rc::Rc;
use core::fmt;

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::Subject;
use crate::key::{EventName, PropertyKey};
use crate::observatory::Observatory;

/// Identifies a registered listener.
///
/// Returned by [`Observatory::observe`] and [`Observatory::add_listener`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Payload delivered to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent<S> {
    /// The subject the event was sent to.
    pub subject: S,
    /// The key that changed.
    pub key: PropertyKey,
    /// The event name listeners were registered under.
    pub event: EventName,
}

/// Callback registered for an event on one subject.
pub type Listener<S> = Rc<dyn Fn(&mut Observatory<S>, &ChangeEvent<S>)>;

type ListenerList<S> = SmallVec<[(ListenerId, Listener<S>); 2]>;

/// Listeners by `(subject, event)`.
pub(crate) struct Listeners<S: Subject> {
    next_id: u64,
    by_target: HashMap<(S, EventName), ListenerList<S>>,
    targets: HashMap<ListenerId, (S, EventName)>,
}

impl<S: Subject> Listeners<S> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            by_target: HashMap::new(),
            targets: HashMap::new(),
        }
    }

    pub(crate) fn add(
        &mut self,
        subject: S,
        event: EventName,
        listener: Listener<S>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.by_target
            .entry((subject, event.clone()))
            .or_default()
            .push((id, listener));
        self.targets.insert(id, (subject, event));
        id
    }

    /// Removes a listener, returning the target it was registered on.
    pub(crate) fn remove(&mut self, id: ListenerId) -> Option<(S, EventName)> {
        let target = self.targets.remove(&id)?;
        if let Some(list) = self.by_target.get_mut(&target) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                self.by_target.remove(&target);
            }
        }
        Some(target)
    }

    /// Returns the target a listener is registered on.
    pub(crate) fn target(&self, id: ListenerId) -> Option<&(S, EventName)> {
        self.targets.get(&id)
    }

    /// Copies the listeners for `(subject, event)` so they can be called while
    /// the registry is being modified.
    pub(crate) fn snapshot(&self, subject: S, event: &EventName) -> SmallVec<[Listener<S>; 2]> {
        self.by_target
            .get(&(subject, event.clone()))
            .map(|list| list.iter().map(|(_, l)| Rc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn count(&self, subject: S, event: &EventName) -> usize {
        self.by_target
            .get(&(subject, event.clone()))
            .map_or(0, SmallVec::len)
    }

    /// Removes every listener registered on `subject`.
    pub(crate) fn remove_subject(&mut self, subject: S) {
        self.by_target.retain(|(s, _), _| *s != subject);
        self.targets.retain(|_, (s, _)| *s != subject);
    }
}

// Manual Debug impl since listeners aren't Debug
impl<S: Subject> fmt::Debug for Listeners<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("targets", &self.by_target.len())
            .field("listeners", &self.targets.len())
            .finish_non_exhaustive()
    }
}
