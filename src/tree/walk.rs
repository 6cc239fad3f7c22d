use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use walkdir::WalkDir;

use crate::{
    diff::DiffCycle,
    directory::{Directory, KeyBase},
    dispatch_key::{DirectoryKey, DispatchKey},
};

use super::{DirectoryTree, Seeds};

impl DirectoryTree {
    /// Visits every regular file below `top`, creating nodes for the
    /// directories on the way. Directories that cannot be watched are
    /// skipped along with their contents.
    fn walk<F>(&self, top: &Path, mut visit: F)
    where
        F: FnMut(&Arc<Directory>, &[KeyBase], &Path),
    {
        let mut seen: HashMap<PathBuf, (Arc<Directory>, Vec<KeyBase>)> = HashMap::new();
        let mut entries = WalkDir::new(top).min_depth(1).sort_by_file_name().into_iter();

        while let Some(entry) = entries.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Error while walking {}: {}", top.display(), err);
                    continue;
                }
            };
            let path = entry.path();

            if entry.file_type().is_dir() {
                if let Err(err) = self.ensure_dir(path) {
                    log::warn!("Could not watch {}: {}", path.display(), err);
                    entries.skip_current_dir();
                }
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }

            let parent = match path.parent() {
                Some(parent) => parent,
                None => continue,
            };

            if !seen.contains_key(parent) {
                let dir = match self.directory(parent) {
                    Some(dir) => dir,
                    None => continue,
                };
                let bases = self.key_bases(&dir);
                seen.insert(parent.to_path_buf(), (dir, bases));
            }

            if let Some((dir, bases)) = seen.get(parent) {
                visit(dir, bases, path);
            }
        }
    }

    pub(super) fn walk_new_key(
        &self,
        node: &Arc<Directory>,
        key: &DirectoryKey,
        cycle: &mut DiffCycle,
        seeds: &Seeds,
    ) {
        let mut files = 0usize;

        self.walk(node.path(), |dir, bases, file| {
            let additional = match bases
                .iter()
                .find(|base| base.key() == key)
                .and_then(|base| base.dispatch_key(file))
            {
                Some(additional) => additional,
                None => return,
            };

            let existed = dir.existing_resource(file).is_some();
            let resource = match dir.resource(file, &self.resources) {
                Some(resource) => resource,
                None => return,
            };
            files += 1;

            if resource.current().is_none() {
                if let Some(seed) = seeds.get(additional.relative_path()) {
                    resource.seed(*seed);
                    cycle.modified(additional, file, &resource);
                    return;
                }
            }

            let known: Vec<DispatchKey> = bases
                .iter()
                .filter(|base| base.key() != key)
                .filter_map(|base| base.dispatch_key(file))
                .collect();

            if !existed || (known.is_empty() && resource.current().is_none()) {
                cycle.modified(additional, file, &resource);
                return;
            }

            // A checksum request supersedes the ones still waiting, so the
            // known keys go along in case an earlier request has not
            // reported them yet. Unchanged content keeps them silent.
            for known in known {
                cycle.supplement(known.clone(), additional.clone());
                cycle.modified(known, file, &resource);
            }
            cycle.announce(additional, file, &resource);
        });

        log::debug!("{} sees {} files below {}", key, files, node.path().display());
    }

    /// Reconciles the whole tree with what is on disk, after the watcher
    /// reported that it lost events. Vanished directories and files are
    /// discarded, everything else goes through the checksum so only real
    /// changes are delivered.
    pub(crate) fn rescan(&self, cycle: &mut DiffCycle) {
        let _roots = self.roots.lock();

        let mut vanished: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|node| !node.key().is_dir())
            .map(|node| node.key().clone())
            .collect();
        vanished.sort_by_key(|path| path.components().count());
        for path in vanished {
            if self.dirs.contains_key(&path) {
                self.directory_discarded(&path, cycle);
            }
        }

        let nodes: Vec<Arc<Directory>> = self
            .dirs
            .iter()
            .map(|node| Arc::clone(node.value()))
            .collect();
        for node in &nodes {
            let bases = self.key_bases(node);
            for file in node.tracked_files() {
                if !file.is_file() {
                    node.inform_discard(&bases, cycle, &file);
                }
            }
        }

        for top in nodes.iter().filter(|node| node.is_root()) {
            self.walk(top.path(), |dir, bases, file| {
                dir.inform_if_changed(bases, cycle, file, &self.resources);
            });
        }

        log::debug!("Rescanned {} directories of {}", self.dirs.len(), self.fs_id);
    }

    /// Starts watching a directory that appeared below a watched one, and
    /// reports every file in it.
    pub(super) fn directory_created(&self, path: &Path, cycle: &mut DiffCycle) {
        match self.ensure_chain(path) {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(err) => {
                log::warn!("Could not watch {}: {}", path.display(), err);
                return;
            }
        }

        self.walk(path, |dir, bases, file| {
            dir.inform_if_changed(bases, cycle, file, &self.resources);
        });
    }
}
