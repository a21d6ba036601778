// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Property keys and observer event names.

use alloc::string::String;
use alloc::sync::Arc;
use core::borrow::Borrow;
use core::fmt;

/// Separator between the segments of a path key.
pub(crate) const PATH_SEPARATOR: char = '.';

/// Suffix appended to a key to form its change event name.
const CHANGE_SUFFIX: &str = ":change";

/// The name of an observable property.
///
/// `PropertyKey` is a reference-counted string, so cloning is a pointer bump.
/// A key that contains `.` is a *path key* (for example `"person.name"`) and
/// names a value reached through intermediate subjects; see
/// [`Observatory::watch`](crate::Observatory::watch).
///
/// # Example
///
/// ```rust
/// use understory_observe::PropertyKey;
///
/// let key = PropertyKey::from("person.name");
/// assert!(key.is_path());
/// assert_eq!(key.segments().collect::<Vec<_>>(), ["person", "name"]);
/// assert_eq!(key.as_str(), "person.name");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyKey(Arc<str>);

impl PropertyKey {
    /// Creates a key from a string slice.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// Returns the key as a string slice.
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this key names a multi-segment path.
    #[must_use]
    #[inline]
    pub fn is_path(&self) -> bool {
        self.0.contains(PATH_SEPARATOR)
    }

    /// Returns an iterator over the `.`-separated segments of this key.
    ///
    /// A plain key yields a single segment.
    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.split(PATH_SEPARATOR)
    }
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl From<&Self> for PropertyKey {
    fn from(key: &Self) -> Self {
        key.clone()
    }
}

impl Borrow<str> for PropertyKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PropertyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PropertyKey {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for PropertyKey {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl fmt::Debug for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PropertyKey({:?})", &*self.0)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The name of an event sent to listeners.
///
/// Change events use the fixed naming transform `"{key}:change"`, produced by
/// [`EventName::change`]. Other names can be created with [`EventName::new`]
/// and used with [`Observatory::add_listener`](crate::Observatory::add_listener).
///
/// ```rust
/// use understory_observe::{EventName, PropertyKey};
///
/// let name = EventName::change(&PropertyKey::from("width"));
/// assert_eq!(name.as_str(), "width:change");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventName(Arc<str>);

impl EventName {
    /// Creates an event name from a string slice.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    /// Returns the canonical change event name for `key`.
    #[must_use]
    pub fn change(key: &PropertyKey) -> Self {
        let mut name = String::with_capacity(key.as_str().len() + CHANGE_SUFFIX.len());
        name.push_str(key.as_str());
        name.push_str(CHANGE_SUFFIX);
        Self(Arc::from(name))
    }

    /// Returns the name as a string slice.
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Debug for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventName({:?})", &*self.0)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use hashbrown::HashSet;

    #[test]
    fn plain_key_has_one_segment() {
        let key = PropertyKey::from("width");
        assert!(!key.is_path());
        assert_eq!(key.segments().collect::<Vec<_>>(), ["width"]);
    }

    #[test]
    fn path_key_splits_on_dots() {
        let key = PropertyKey::from("a.b.c");
        assert!(key.is_path());
        assert_eq!(key.segments().collect::<Vec<_>>(), ["a", "b", "c"]);
    }

    #[test]
    fn keys_compare_by_content() {
        let a = PropertyKey::from("width");
        let b = PropertyKey::from(String::from("width"));
        assert_eq!(a, b);
        assert_eq!(a, "width");

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains("width"));
    }

    #[test]
    fn change_event_name_appends_suffix() {
        let name = EventName::change(&PropertyKey::from("person.name"));
        assert_eq!(name.as_str(), "person.name:change");
        assert_eq!(name, EventName::new("person.name:change"));
    }
}
