//! A single watched directory.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use globset::{Glob, GlobSet, GlobSetBuilder};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use watchfs::{WatchHandle, WatchService};

use crate::{
    checksum::{ChecksumResource, ResourceFactory},
    diff::DiffCycle,
    dispatch_key::{DirectoryKey, DispatchKey},
};

/// Relative paths a root never reports.
#[derive(Debug, Clone, Default)]
pub struct Blacklist(Option<Arc<GlobSet>>);

impl Blacklist {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, globset::Error> {
        if patterns.is_empty() {
            return Ok(Self(None));
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern.as_ref())?);
        }
        Ok(Self(Some(Arc::new(builder.build()?))))
    }

    pub fn is_blacklisted(&self, relative_path: &Path) -> bool {
        match &self.0 {
            Some(set) => set.is_match(relative_path),
            None => false,
        }
    }
}

/// A directory key together with the directory it is relative to.
#[derive(Debug, Clone)]
pub(crate) struct KeyBase {
    key: DirectoryKey,
    root: Arc<Path>,
    blacklist: Blacklist,
}

impl KeyBase {
    pub(crate) fn key(&self) -> &DirectoryKey {
        &self.key
    }

    /// Derives the dispatch key for `path`, which must be located at or below
    /// this base's root.
    pub(crate) fn dispatch_key(&self, path: &Path) -> Option<DispatchKey> {
        let relative = path.strip_prefix(&self.root).ok()?;
        if !relative.as_os_str().is_empty() && self.blacklist.is_blacklisted(relative) {
            return None;
        }
        Some(DispatchKey::new(self.key.clone(), relative))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    /// Topmost node of a tree; it carries at least one key.
    Root,

    /// Nested inside the directory at `parent`.
    Branch { parent: PathBuf },
}

/// A watched directory. Nodes are owned by their tree and refer to each
/// other by path only.
pub struct Directory {
    path: Arc<Path>,
    placement: RwLock<Placement>,
    keys: RwLock<IndexMap<DirectoryKey, Blacklist>>,
    watch: Mutex<Option<WatchHandle>>,
    resources: DashMap<PathBuf, Arc<ChecksumResource>>,
    cancelled: AtomicBool,
}

impl Directory {
    pub(crate) fn new_root(path: &Path, watch: WatchHandle) -> Self {
        Self::new(path, Placement::Root, watch)
    }

    pub(crate) fn new_branch(path: &Path, parent: &Path, watch: WatchHandle) -> Self {
        Self::new(
            path,
            Placement::Branch {
                parent: parent.to_path_buf(),
            },
            watch,
        )
    }

    fn new(path: &Path, placement: Placement, watch: WatchHandle) -> Self {
        Self {
            path: Arc::from(path),
            placement: RwLock::new(placement),
            keys: RwLock::new(IndexMap::new()),
            watch: Mutex::new(Some(watch)),
            resources: DashMap::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        *self.placement.read() == Placement::Root
    }

    /// The path of the enclosing node, if this is a branch.
    pub fn parent(&self) -> Option<PathBuf> {
        match &*self.placement.read() {
            Placement::Root => None,
            Placement::Branch { parent } => Some(parent.clone()),
        }
    }

    pub fn directory_keys(&self) -> Vec<DirectoryKey> {
        self.keys.read().keys().cloned().collect()
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.read().is_empty()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Attaches another identity to this directory. Returns `false` if the
    /// key was already attached.
    pub(crate) fn add_directory_key(&self, key: DirectoryKey, blacklist: Blacklist) -> bool {
        let mut keys = self.keys.write();
        if keys.contains_key(&key) {
            return false;
        }
        keys.insert(key, blacklist);
        true
    }

    pub(crate) fn remove_directory_key(&self, key: &DirectoryKey) -> bool {
        self.keys.write().shift_remove(key).is_some()
    }

    /// The bases contributed by keys attached directly to this node.
    pub(crate) fn own_key_bases(&self) -> Vec<KeyBase> {
        self.keys
            .read()
            .iter()
            .map(|(key, blacklist)| KeyBase {
                key: key.clone(),
                root: Arc::clone(&self.path),
                blacklist: blacklist.clone(),
            })
            .collect()
    }

    /// Moves this node below `new_base`, which must be a strict ancestor.
    /// Keys and checksums stay untouched; only the placement changes.
    pub(crate) fn rebase(&self, new_base: &Path) {
        debug_assert!(self.path.starts_with(new_base) && *self.path != *new_base);

        if let Some(parent) = self.path.parent() {
            log::debug!(
                "Rebasing {} below {}",
                self.path.display(),
                new_base.display()
            );
            *self.placement.write() = Placement::Branch {
                parent: parent.to_path_buf(),
            };
        }
    }

    /// Turns this node into the top of its own tree.
    pub(crate) fn to_root_directory(&self) {
        log::debug!("{} is a root directory again", self.path.display());
        *self.placement.write() = Placement::Root;
    }

    /// Cancels the watch and drops every checksum resource. Safe to call
    /// more than once.
    pub(crate) fn cancel_key(&self, service: &WatchService) {
        self.cancelled.store(true, Ordering::Release);

        if let Some(handle) = self.watch.lock().take() {
            if let Err(err) = service.cancel(&handle) {
                log::warn!(
                    "Could not cancel watch of {}: {}",
                    self.path.display(),
                    err
                );
            }
        }

        let files: Vec<PathBuf> = self.resources.iter().map(|e| e.key().clone()).collect();
        for file in files {
            if let Some((_, resource)) = self.resources.remove(&file) {
                resource.cancel();
            }
        }
    }

    /// Looks up the resource for `file`, creating it on first use. Cancelled
    /// directories hand out nothing.
    pub(crate) fn resource(
        &self,
        file: &Path,
        factory: &ResourceFactory,
    ) -> Option<Arc<ChecksumResource>> {
        if self.is_cancelled() {
            return None;
        }

        let resource = self
            .resources
            .entry(file.to_path_buf())
            .or_insert_with(|| factory.create(file));
        Some(Arc::clone(resource.value()))
    }

    pub(crate) fn existing_resource(&self, file: &Path) -> Option<Arc<ChecksumResource>> {
        self.resources.get(file).map(|e| Arc::clone(e.value()))
    }

    /// Files this directory currently tracks, in path order.
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self.resources.iter().map(|e| e.key().clone()).collect();
        files.sort();
        files
    }

    /// Records a possible modification of `file` under every key in `bases`.
    /// Whether it is delivered depends on the checksum once the cycle closes.
    pub(crate) fn inform_if_changed(
        &self,
        bases: &[KeyBase],
        cycle: &mut DiffCycle,
        file: &Path,
        factory: &ResourceFactory,
    ) {
        let keys: Vec<DispatchKey> = bases
            .iter()
            .filter_map(|base| base.dispatch_key(file))
            .collect();
        if keys.is_empty() {
            return;
        }

        let resource = match self.resource(file, factory) {
            Some(resource) => resource,
            None => return,
        };

        for key in keys {
            cycle.modified(key, file, &resource);
        }
    }

    /// Forgets `file` and records a discard under every key in `bases`.
    /// Files this directory never tracked were never reported, so they
    /// produce nothing.
    pub(crate) fn inform_discard(&self, bases: &[KeyBase], cycle: &mut DiffCycle, file: &Path) {
        if self.is_cancelled() {
            return;
        }

        let resource = match self.resources.remove(file) {
            Some((_, resource)) => resource,
            None => {
                log::trace!("{} was not tracked", file.display());
                return;
            }
        };

        for key in bases.iter().filter_map(|base| base.dispatch_key(file)) {
            cycle.discard(key);
        }
        resource.cancel();
    }

    /// Drops the resources of files that none of `bases` can see anymore.
    /// Returns how many were released.
    pub(crate) fn release_unseen(&self, bases: &[KeyBase]) -> usize {
        let mut released = 0;
        for file in self.tracked_files() {
            if bases.iter().any(|base| base.dispatch_key(&file).is_some()) {
                continue;
            }
            if let Some((_, resource)) = self.resources.remove(&file) {
                resource.cancel();
                released += 1;
            }
        }
        released
    }

    /// Records discards for every tracked file and for this directory
    /// itself. The caller cancels the node afterwards.
    pub(crate) fn inform_directory_discard(&self, bases: &[KeyBase], cycle: &mut DiffCycle) {
        for file in self.tracked_files() {
            self.inform_discard(bases, cycle, &file);
        }

        for key in bases.iter().filter_map(|base| base.dispatch_key(&self.path)) {
            cycle.discard(key);
        }
    }
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("path", &self.path)
            .field("placement", &*self.placement.read())
            .field("keys", &self.directory_keys())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
