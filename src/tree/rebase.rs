use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    diff::DiffCycle,
    directory::{Blacklist, Directory},
    dispatch_key::DirectoryKey,
    virtual_root::RegistrationError,
};

use super::{DirectoryTree, Seeds};

impl DirectoryTree {
    /// Attaches `key` to the directory at `path` and reports every file below
    /// it under that key.
    ///
    /// Files that are already known under other keys are announced together
    /// with a supplement from each known key. Files whose relative path has
    /// a seed are compared against that digest instead.
    pub(crate) fn register_root(
        &self,
        key: DirectoryKey,
        path: &Path,
        blacklist: Blacklist,
        cycle: &mut DiffCycle,
        seeds: &Seeds,
    ) -> Result<(), RegistrationError> {
        let mut roots = self.roots.lock();
        if roots.contains_key(&key) {
            return Err(RegistrationError::DuplicateKey(key));
        }

        let node = match self.directory(path) {
            Some(node) => node,
            None => self.attach(path)?,
        };

        if !node.add_directory_key(key.clone(), blacklist) {
            return Err(RegistrationError::DuplicateKey(key));
        }
        roots.insert(key.clone(), path.to_path_buf());
        log::info!("Watching {} as {}", path.display(), key);

        self.walk_new_key(&node, &key, cycle, seeds);
        Ok(())
    }

    /// Creates the node for a root that is not watched yet. If an enclosing
    /// directory is watched, the new node joins its tree; otherwise it
    /// becomes a root and takes in every existing root below it.
    fn attach(&self, path: &Path) -> Result<Arc<Directory>, RegistrationError> {
        let io_error = |source| RegistrationError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(node) = self.ensure_chain(path).map_err(io_error)? {
            return Ok(node);
        }

        let handle = self.service.register(path).map_err(io_error)?;
        let node = Arc::new(Directory::new_root(path, handle));
        self.dirs.insert(path.to_path_buf(), Arc::clone(&node));
        self.rebase_existing_roots(&node);

        Ok(node)
    }

    fn rebase_existing_roots(&self, base: &Directory) {
        let nested: Vec<Arc<Directory>> = self
            .dirs
            .iter()
            .filter(|node| {
                node.is_root() && node.key() != base.path() && node.key().starts_with(base.path())
            })
            .map(|node| Arc::clone(node.value()))
            .collect();

        for node in nested {
            if let Some(parent) = node.path().parent() {
                if let Err(err) = self.ensure_chain(parent) {
                    log::warn!(
                        "Could not watch the directories between {} and {}: {}",
                        base.path().display(),
                        node.path().display(),
                        err
                    );
                }
            }
            node.rebase(base.path());
        }
    }

    /// Makes sure `target` and every directory between it and the nearest
    /// watched ancestor have nodes. Returns `None` if no ancestor is watched.
    pub(super) fn ensure_chain(&self, target: &Path) -> io::Result<Option<Arc<Directory>>> {
        if let Some(node) = self.directory(target) {
            return Ok(Some(node));
        }

        let mut missing = vec![target.to_path_buf()];
        let mut anchored = false;
        for ancestor in target.ancestors().skip(1) {
            if self.dirs.contains_key(ancestor) {
                anchored = true;
                break;
            }
            missing.push(ancestor.to_path_buf());
        }

        if !anchored {
            return Ok(None);
        }

        let mut node = None;
        for path in missing.into_iter().rev() {
            node = Some(self.ensure_dir(&path)?);
        }
        Ok(node)
    }

    /// Watches `path` as a branch of its parent node.
    pub(super) fn ensure_dir(&self, path: &Path) -> io::Result<Arc<Directory>> {
        if let Some(node) = self.directory(path) {
            return Ok(node);
        }

        let parent = path.parent().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no parent directory", path.display()),
            )
        })?;

        let handle = self.service.register(path)?;
        let node = Arc::new(Directory::new_branch(path, parent, handle));
        self.dirs.insert(path.to_path_buf(), Arc::clone(&node));
        log::trace!("Watching {}", path.display());

        Ok(node)
    }

    /// Detaches `key`, discarding every file it saw. Returns the last known
    /// digests of those files.
    ///
    /// A root left without keys is torn down: keyed directories below it
    /// become roots of their own, everything else is cancelled.
    pub(crate) fn unregister_root(
        &self,
        key: &DirectoryKey,
        cycle: &mut DiffCycle,
    ) -> Result<Seeds, RegistrationError> {
        let mut roots = self.roots.lock();
        let path = roots
            .remove(key)
            .ok_or_else(|| RegistrationError::UnknownKey(key.clone()))?;

        let mut seeds = Seeds::new();
        let node = match self.directory(&path) {
            Some(node) => node,
            None => {
                log::debug!("{} was already gone when {} was unregistered", path.display(), key);
                return Ok(seeds);
            }
        };

        let base = node
            .own_key_bases()
            .into_iter()
            .find(|base| base.key() == key);

        if let Some(base) = base {
            for dir in self.subtree(&path) {
                for file in dir.tracked_files().into_iter().rev() {
                    let dispatch_key = match base.dispatch_key(&file) {
                        Some(dispatch_key) => dispatch_key,
                        None => continue,
                    };

                    let digest = dir
                        .existing_resource(&file)
                        .and_then(|resource| resource.current());
                    if let Some(digest) = digest {
                        seeds.insert(dispatch_key.relative_path().to_path_buf(), digest);
                    }

                    cycle.discard(dispatch_key);
                }
            }
        }

        node.remove_directory_key(key);
        log::info!("Stopped watching {} as {}", path.display(), key);

        if node.is_root() && !node.has_keys() {
            self.cancel_and_rebase_discarded(&node);
        }
        self.release_unseen(&path);

        Ok(seeds)
    }

    /// Drops checksum resources below `path` that only a removed key could
    /// see.
    fn release_unseen(&self, path: &Path) {
        let mut released = 0;
        for dir in self.subtree(path) {
            let bases = self.key_bases(&dir);
            released += dir.release_unseen(&bases);
        }

        if released > 0 {
            log::debug!(
                "Released {} checksums below {} that no key sees anymore",
                released,
                path.display()
            );
        }
    }

    fn cancel_and_rebase_discarded(&self, root: &Directory) {
        let subtree = self.subtree(root.path());
        let mut kept: Vec<PathBuf> = Vec::new();

        for node in subtree.iter().rev() {
            if node.path() == root.path() || !node.has_keys() {
                continue;
            }
            if kept.iter().any(|path| node.path().starts_with(path)) {
                continue;
            }
            node.to_root_directory();
            kept.push(node.path().to_path_buf());
        }

        let mut cancelled = 0;
        for node in &subtree {
            if !kept.iter().any(|path| node.path().starts_with(path)) {
                self.evict(node);
                cancelled += 1;
            }
        }

        log::debug!(
            "Tore down {}: {} directories cancelled, {} roots kept",
            root.path().display(),
            cancelled,
            kept.len()
        );
    }
}
