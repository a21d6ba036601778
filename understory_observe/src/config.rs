// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Engine configuration.

/// How property changes reach observers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum PropagationMode {
    /// Changes run descriptor hooks, walk dependent keys, notify chain watchers,
    /// and dispatch observer events directly from the write.
    ///
    /// Inside a transaction, observer events are queued and deduplicated
    /// until the outermost transaction ends.
    #[default]
    Legacy,
    /// Changes only stamp revision tags. Observers are dispatched by a flush
    /// of synchronous observers, which runs after every change made outside a
    /// transaction and at the end of the outermost transaction.
    ///
    /// The flush expands each changed key through its dependents and chain
    /// watchers, so a derived key's observers still fire when an input changes.
    Tracked,
}

/// Configuration for an [`Observatory`](crate::Observatory).
///
/// # Example
///
/// ```rust
/// use understory_observe::{ObserveConfig, Observatory, PropagationMode};
///
/// let config = ObserveConfig::new().mode(PropagationMode::Tracked);
/// let obs = Observatory::<u32>::with_config(config);
/// assert_eq!(obs.config().propagation_mode(), PropagationMode::Tracked);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ObserveConfig {
    mode: PropagationMode,
}

impl ObserveConfig {
    /// Creates the default configuration ([`PropagationMode::Legacy`]).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: PropagationMode::Legacy,
        }
    }

    /// Sets the propagation mode.
    #[must_use]
    pub const fn mode(mut self, mode: PropagationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Returns the propagation mode.
    #[must_use]
    #[inline]
    pub const fn propagation_mode(&self) -> PropagationMode {
        self.mode
    }

    /// Returns `true` for [`PropagationMode::Tracked`].
    #[must_use]
    #[inline]
    pub const fn is_tracked(&self) -> bool {
        matches!(self.mode, PropagationMode::Tracked)
    }
}
