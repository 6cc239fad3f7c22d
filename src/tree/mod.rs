//! The forest of watched directories on one filesystem.
//!
//! Every directory below a registered root has a node in the tree's index.
//! Nodes refer to their enclosing node by path, so the index is the only
//! owner. Overlapping roots share nodes: registering an ancestor of an
//! existing root rebases the existing root below the new one, registering a
//! descendant only attaches another key to an existing node.

mod rebase;
mod walk;

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use watchfs::{FileSystemId, WatchService};

use crate::{
    checksum::{Checksum, ResourceFactory},
    diff::DiffCycle,
    directory::{Directory, KeyBase},
    dispatch_key::DirectoryKey,
    subscriber::{Dispatcher, SubscriberEntry},
};

/// Digests of a root's files by relative path, carried over when a root is
/// relocated.
pub(crate) type Seeds = HashMap<PathBuf, Checksum>;

pub struct DirectoryTree {
    fs_id: FileSystemId,
    dirs: DashMap<PathBuf, Arc<Directory>>,

    /// Registered roots. Held for the whole of every structural change.
    roots: Mutex<HashMap<DirectoryKey, PathBuf>>,

    service: Arc<WatchService>,
    resources: ResourceFactory,
}

impl DirectoryTree {
    pub(crate) fn new(
        fs_id: FileSystemId,
        service: Arc<WatchService>,
        resources: ResourceFactory,
    ) -> Self {
        Self {
            fs_id,
            dirs: DashMap::new(),
            roots: Mutex::new(HashMap::new()),
            service,
            resources,
        }
    }

    pub fn fs_id(&self) -> FileSystemId {
        self.fs_id
    }

    pub fn directory(&self, path: &Path) -> Option<Arc<Directory>> {
        self.dirs.get(path).map(|node| Arc::clone(node.value()))
    }

    /// Number of watched directories.
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn root_path(&self, key: &DirectoryKey) -> Option<PathBuf> {
        self.roots.lock().get(key).cloned()
    }

    pub(crate) fn service(&self) -> &Arc<WatchService> {
        &self.service
    }

    /// Every key that sees `node`, innermost first.
    pub(crate) fn key_bases(&self, node: &Directory) -> Vec<KeyBase> {
        let mut bases = node.own_key_bases();
        let mut parent = node.parent();

        while let Some(path) = parent {
            match self.directory(&path) {
                Some(ancestor) => {
                    bases.extend(ancestor.own_key_bases());
                    parent = ancestor.parent();
                }
                None => {
                    log::warn!(
                        "{} refers to {} which is not watched",
                        node.path().display(),
                        path.display()
                    );
                    break;
                }
            }
        }

        bases
    }

    /// Nodes at or below `path`, deepest first.
    fn subtree(&self, path: &Path) -> Vec<Arc<Directory>> {
        let mut nodes: Vec<Arc<Directory>> = self
            .dirs
            .iter()
            .filter(|node| node.key().starts_with(path))
            .map(|node| Arc::clone(node.value()))
            .collect();

        nodes.sort_by(|a, b| {
            let depth_a = a.path().components().count();
            let depth_b = b.path().components().count();
            depth_b.cmp(&depth_a).then_with(|| a.path().cmp(b.path()))
        });
        nodes
    }

    fn evict(&self, node: &Directory) {
        node.cancel_key(&self.service);
        self.dirs.remove(node.path());
    }

    /// Handles a created or written path.
    pub(crate) fn path_modified(&self, path: &Path, cycle: &mut DiffCycle) {
        let _roots = self.roots.lock();

        match fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => self.directory_created(path, cycle),
            Ok(_) => self.file_modified(path, cycle),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::trace!("{} vanished before it was looked at", path.display());
            }
            Err(err) => log::warn!("Could not inspect {}: {}", path.display(), err),
        }
    }

    fn file_modified(&self, file: &Path, cycle: &mut DiffCycle) {
        let parent = match file.parent().and_then(|parent| self.directory(parent)) {
            Some(parent) => parent,
            None => return,
        };

        let bases = self.key_bases(&parent);
        parent.inform_if_changed(&bases, cycle, file, &self.resources);
    }

    /// Handles a removed path. Removing a directory discards everything
    /// below it, deepest first, and drops its nodes.
    pub(crate) fn path_discarded(&self, path: &Path, cycle: &mut DiffCycle) {
        let _roots = self.roots.lock();

        if self.dirs.contains_key(path) {
            self.directory_discarded(path, cycle);
            return;
        }

        if let Some(parent) = path.parent().and_then(|parent| self.directory(parent)) {
            let bases = self.key_bases(&parent);
            parent.inform_discard(&bases, cycle, path);
        }
    }

    fn directory_discarded(&self, path: &Path, cycle: &mut DiffCycle) {
        let worklist: Vec<(Arc<Directory>, Vec<KeyBase>)> = self
            .subtree(path)
            .into_iter()
            .map(|node| {
                let bases = self.key_bases(&node);
                (node, bases)
            })
            .collect();

        for (node, bases) in &worklist {
            node.inform_directory_discard(bases, cycle);
        }

        for (node, _) in &worklist {
            if node.has_keys() {
                log::warn!(
                    "Registered directory {} was removed; keys {:?} no longer see anything",
                    node.path().display(),
                    node.directory_keys()
                );
            }
            self.evict(node);
        }
    }

    /// Delivers `modified` for every file currently present to a single
    /// subscriber.
    pub(crate) fn force_inform(&self, entry: &SubscriberEntry) {
        let nodes: Vec<Arc<Directory>> = self
            .dirs
            .iter()
            .map(|node| Arc::clone(node.value()))
            .collect();

        for node in nodes {
            if node.is_cancelled() {
                continue;
            }

            let bases = self.key_bases(&node);
            for file in node.tracked_files() {
                if !file.is_file() {
                    continue;
                }
                for key in bases.iter().filter_map(|base| base.dispatch_key(&file)) {
                    Dispatcher::modified_to(entry, &key, &file);
                }
            }
        }
    }

    /// Cancels every watch and checksum of this tree.
    pub(crate) fn close(&self) {
        let mut roots = self.roots.lock();
        let nodes: Vec<Arc<Directory>> = self
            .dirs
            .iter()
            .map(|node| Arc::clone(node.value()))
            .collect();

        for node in nodes {
            node.cancel_key(&self.service);
        }
        self.dirs.clear();
        roots.clear();
        log::debug!("Closed directory tree {}", self.fs_id);
    }
}
