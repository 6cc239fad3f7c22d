//! Stable identities for watched files.
//!
//! A [`DispatchKey`] pairs the caller's name for a watched root with a path
//! relative to that root. Absolute paths move when a root is relocated; keys
//! don't.

use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    hash::Hash,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The caller-supplied identity of a watched root.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryKey(Arc<str>);

impl DirectoryKey {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DirectoryKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DirectoryKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&DirectoryKey> for DirectoryKey {
    fn from(value: &DirectoryKey) -> Self {
        value.clone()
    }
}

impl fmt::Debug for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

impl fmt::Display for DirectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a file or directory below a watched root.
///
/// Sub-key and parent-key relations compare whole path segments, so
/// `ab` is not considered to be nested under `a`. Every key is a sub-key and
/// a parent key of itself.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchKey {
    directory_key: DirectoryKey,
    relative_path: PathBuf,
}

impl DispatchKey {
    pub fn new(directory_key: impl Into<DirectoryKey>, relative_path: impl Into<PathBuf>) -> Self {
        Self {
            directory_key: directory_key.into(),
            relative_path: relative_path.into(),
        }
    }

    pub fn directory_key(&self) -> &DirectoryKey {
        &self.directory_key
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Whether this key names the watched root itself.
    pub fn is_root(&self) -> bool {
        self.relative_path.as_os_str().is_empty()
    }

    pub fn is_sub_key_of(&self, other: &DispatchKey) -> bool {
        self.directory_key == other.directory_key
            && self.relative_path.starts_with(&other.relative_path)
    }

    pub fn is_parent_key_of(&self, other: &DispatchKey) -> bool {
        other.is_sub_key_of(self)
    }

    /// Lazily yields every candidate that is a sub-key of this key.
    pub fn find_sub_keys<'a, I, K>(&'a self, candidates: I) -> impl Iterator<Item = K> + 'a
    where
        I: IntoIterator<Item = K>,
        I::IntoIter: 'a,
        K: Borrow<DispatchKey> + 'a,
    {
        candidates
            .into_iter()
            .filter(move |candidate| candidate.borrow().is_sub_key_of(self))
    }

    /// Removes every sub-key of this key from `candidates`, keeping the
    /// order of whatever remains.
    pub fn remove_sub_keys<C: RetainKeys + ?Sized>(&self, candidates: &mut C) {
        candidates.retain_keys(|candidate| !candidate.is_sub_key_of(self));
    }
}

impl fmt::Debug for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.directory_key, self.relative_path.display())
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Collections that [`DispatchKey::remove_sub_keys`] can prune in place.
pub trait RetainKeys {
    fn retain_keys<F: FnMut(&DispatchKey) -> bool>(&mut self, keep: F);
}

impl RetainKeys for Vec<DispatchKey> {
    fn retain_keys<F: FnMut(&DispatchKey) -> bool>(&mut self, mut keep: F) {
        self.retain(|key| keep(key));
    }
}

impl RetainKeys for VecDeque<DispatchKey> {
    fn retain_keys<F: FnMut(&DispatchKey) -> bool>(&mut self, mut keep: F) {
        self.retain(|key| keep(key));
    }
}

impl RetainKeys for HashSet<DispatchKey> {
    fn retain_keys<F: FnMut(&DispatchKey) -> bool>(&mut self, mut keep: F) {
        self.retain(|key| keep(key));
    }
}

impl<V> RetainKeys for HashMap<DispatchKey, V> {
    fn retain_keys<F: FnMut(&DispatchKey) -> bool>(&mut self, mut keep: F) {
        self.retain(|key, _| keep(key));
    }
}

impl<V> RetainKeys for indexmap::IndexMap<DispatchKey, V> {
    fn retain_keys<F: FnMut(&DispatchKey) -> bool>(&mut self, mut keep: F) {
        self.retain(|key, _| keep(key));
    }
}
