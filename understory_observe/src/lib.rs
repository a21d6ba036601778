// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Observe: property-change propagation for observable object graphs.
//!
//! When a property of a subject changes, everything that depends on it must
//! hear about it: keys computed from it, paths that pass through it, and
//! observers registered on any of those. This crate is the engine that fans a
//! single change out to all of them, safely in the presence of cycles and
//! reentrant callbacks.
//!
//! - **Observatory** ([`Observatory`]): The propagation context. Owns all
//!   state; separate observatories never interact.
//! - **Dependent keys** ([`Observatory::add_dependency`]): "`full_name`
//!   depends on `first_name`". Changes walk these edges depth-first, and each
//!   `(subject, key)` pair is notified at most once per pass, so cycles
//!   terminate.
//! - **Chain watchers** ([`Observatory::watch_path`], [`PathResolver`]):
//!   Subscriptions to values reached through a path such as
//!   `"person.address.city"`, re-resolved when an intermediate link changes.
//! - **Observers** ([`Observatory::observe`]): Callbacks for `"<key>:change"`
//!   events. Dispatched immediately, or queued and deduplicated inside a
//!   transaction.
//! - **Transactions** ([`Observatory::change_properties`], [`Transaction`]):
//!   Batch changes; the queue flushes when the outermost transaction ends.
//!   A panicking transaction body restores the depth without dispatching.
//! - **Revision tags** ([`DirtyTags`]): Per-key stamps from a monotonic
//!   revision counter, for consumers that poll rather than listen.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use understory_observe::Observatory;
//!
//! const PERSON: u32 = 1;
//!
//! let mut obs = Observatory::<u32>::new();
//! obs.add_dependency(PERSON, "full_name", "first_name");
//! obs.add_dependency(PERSON, "full_name", "last_name");
//!
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let sink = log.clone();
//! obs.observe(PERSON, "full_name", move |_, event| {
//!     sink.borrow_mut().push(event.event.to_string());
//! });
//!
//! // Renaming inside a transaction fires `full_name:change` once.
//! obs.change_properties(|obs| {
//!     obs.notify_property_change(PERSON, "first_name");
//!     obs.notify_property_change(PERSON, "last_name");
//! });
//! assert_eq!(*log.borrow(), ["full_name:change"]);
//! ```
//!
//! ## Paths
//!
//! A dependency on a path key installs a chain watcher once the dependent key
//! is watched. The host tells the engine how to follow a path segment:
//!
//! ```rust
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use understory_observe::{Observatory, PropertyKey};
//!
//! const VIEW: u32 = 1;
//! const PERSON: u32 = 2;
//!
//! let mut obs = Observatory::<u32>::new();
//! obs.set_path_resolver(|subject: u32, key: &PropertyKey| {
//!     (subject == VIEW && key == "person").then_some(PERSON)
//! });
//! obs.add_dependency(VIEW, "title", "person.name");
//!
//! let hits = Rc::new(Cell::new(0));
//! let h = hits.clone();
//! obs.observe(VIEW, "title", move |_, _| h.set(h.get() + 1));
//!
//! obs.notify_property_change(PERSON, "name");
//! assert_eq!(hits.get(), 1);
//! ```
//!
//! ## Propagation Modes
//!
//! [`PropagationMode::Legacy`] (the default) runs hooks, dependents, chains,
//! and observers directly from each change. [`PropagationMode::Tracked`] only
//! stamps revision tags at change time and dispatches observers from a flush
//! after the change (or at the end of the outermost transaction). Select it
//! with [`ObserveConfig`].
//!
//! ## Reentrancy
//!
//! Every callback receives `&mut Observatory` and may change properties,
//! register or remove listeners, or open transactions. Listener lists and
//! dependent lists are snapshotted before iteration, so mutations made by a
//! callback take effect from the next dispatch.
//!
//! ## `no_std` Support
//!
//! This crate is `no_std` and uses `alloc`. It does not depend on `std`.
//!
//! ## Features
//!
//! - `tracing`: Emits [`tracing`](https://docs.rs/tracing) events for
//!   propagation passes, queue flushes, chain re-resolution, and unbalanced
//!   transaction ends.

#![no_std]

extern crate alloc;

mod chains;
mod config;
mod dirty;
mod key;
mod listeners;
mod meta;
mod observatory;
mod queue;
mod seen;
mod transaction;

use core::fmt;
use core::hash::Hash;

pub use chains::{ChainLink, ChainWatchId, ChainWatchers, PathError, PathResolver};
pub use config::{ObserveConfig, PropagationMode};
pub use dirty::DirtyTags;
pub use key::{EventName, PropertyKey};
pub use listeners::{ChangeEvent, Listener, ListenerId};
pub use meta::{ChangeHook, Descriptor, Meta, MetaFlags};
pub use observatory::Observatory;
pub use transaction::Transaction;

/// Handle for an observable object.
///
/// Implemented for every `Copy + Eq + Hash + Debug` type. Hosts usually use a
/// small integer id or a generational handle into their own storage.
pub trait Subject: Copy + Eq + Hash + fmt::Debug {}

impl<T> Subject for T where T: Copy + Eq + Hash + fmt::Debug {}
