//! Per-cycle reconciliation of modifications, discards and supplements.
//!
//! Everything the engine learns while a cycle is open is recorded here and
//! only turned into subscriber notifications once the cycle closes. At that
//! point:
//!
//! * discards with no later modification of the same key are delivered,
//! * every modified file gets one debounced checksum update, and its keys
//!   are delivered only if the digest changed (or the key is new to an
//!   already known file),
//! * a discard followed by a modification of the same key is delivered only
//!   if the file could not be checksummed after all.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use indexmap::{IndexMap, IndexSet};

use crate::{
    checksum::{ChecksumResource, UpdateError},
    dispatch_key::DispatchKey,
    pending::PendingEventRegistry,
    subscriber::Dispatcher,
};

/// What a cycle needs to deliver its result.
#[derive(Clone)]
pub(crate) struct CycleContext {
    pub dispatcher: Arc<Dispatcher>,
    pub pending: Arc<PendingEventRegistry>,
    pub write_deadline: Duration,
}

pub(crate) struct DiffCycle {
    context: CycleContext,
    opened_at: Instant,

    /// Keys that may have changed, with the file that backs them.
    modified: IndexMap<DispatchKey, PathBuf>,
    resources: HashMap<PathBuf, Arc<ChecksumResource>>,

    /// Modified keys delivered even if the digest did not change.
    forced: HashSet<DispatchKey>,

    discarded: IndexSet<DispatchKey>,

    /// Additional key -> keys the same content is already known under.
    supplements: IndexMap<DispatchKey, IndexSet<DispatchKey>>,

    /// Paths whose CREATE opened a pending entry during this cycle.
    created: IndexSet<PathBuf>,
}

struct Outcome {
    key: DispatchKey,
    forced: bool,
    contested: bool,
    supplements: Vec<DispatchKey>,
}

impl DiffCycle {
    pub(crate) fn open(context: &CycleContext) -> Self {
        Self {
            context: context.clone(),
            opened_at: Instant::now(),
            modified: IndexMap::new(),
            resources: HashMap::new(),
            forced: HashSet::new(),
            discarded: IndexSet::new(),
            supplements: IndexMap::new(),
            created: IndexSet::new(),
        }
    }

    pub(crate) fn is_due(&self, delay: Duration) -> bool {
        self.opened_at.elapsed() >= delay
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.modified.is_empty()
            && self.discarded.is_empty()
            && self.supplements.is_empty()
            && self.created.is_empty()
    }

    pub(crate) fn modified(
        &mut self,
        key: DispatchKey,
        file: &Path,
        resource: &Arc<ChecksumResource>,
    ) {
        self.resources.insert(file.to_path_buf(), Arc::clone(resource));
        self.modified.insert(key, file.to_path_buf());
    }

    /// Like [`modified`](Self::modified), but the key is delivered whether or
    /// not the content changed.
    pub(crate) fn announce(
        &mut self,
        key: DispatchKey,
        file: &Path,
        resource: &Arc<ChecksumResource>,
    ) {
        self.forced.insert(key.clone());
        self.modified(key, file, resource);
    }

    /// Records that `key` is gone. A key whose file was created during this
    /// cycle and never checksummed was not announced yet, so it just
    /// disappears from the cycle.
    pub(crate) fn discard(&mut self, key: DispatchKey) {
        let unannounced = match self.modified.shift_remove(&key) {
            Some(file) => self.created.contains(&file) && self.is_unchecked(&file),
            None => false,
        };
        self.forced.remove(&key);
        self.supplements.shift_remove(&key);

        if unannounced {
            log::trace!("{} came and went within one cycle", key);
            return;
        }
        self.discarded.insert(key);
    }

    fn is_unchecked(&self, file: &Path) -> bool {
        self.resources
            .get(file)
            .map_or(true, |resource| resource.current().is_none())
    }

    pub(crate) fn supplement(&mut self, known: DispatchKey, additional: DispatchKey) {
        self.supplements
            .entry(additional)
            .or_default()
            .insert(known);
    }

    pub(crate) fn created(&mut self, path: &Path) {
        self.created.insert(path.to_path_buf());
    }

    pub(crate) fn close(self) {
        let DiffCycle {
            context,
            opened_at,
            modified,
            mut resources,
            forced,
            discarded,
            mut supplements,
            mut created,
        } = self;

        log::trace!(
            "Closing cycle after {:?}: {} modified, {} discarded",
            opened_at.elapsed(),
            modified.len(),
            discarded.len()
        );

        for key in &discarded {
            if !modified.contains_key(key) {
                context.dispatcher.discard(key.clone());
            }
        }

        let mut groups: IndexMap<PathBuf, Vec<Outcome>> = IndexMap::new();
        for (key, file) in modified {
            let outcome = Outcome {
                forced: forced.contains(&key),
                contested: discarded.contains(&key),
                supplements: supplements
                    .shift_remove(&key)
                    .map(|known| known.into_iter().collect())
                    .unwrap_or_default(),
                key,
            };
            groups.entry(file).or_default().push(outcome);
        }

        for (file, outcomes) in groups {
            let resource = match resources.remove(&file) {
                Some(resource) => resource,
                None => continue,
            };

            let was_created = created.shift_remove(&file);
            let deadline = context
                .write_deadline
                .max(context.pending.remaining_lock(&file));
            let dispatcher = Arc::clone(&context.dispatcher);
            let pending = Arc::clone(&context.pending);
            let path = file.clone();

            resource.update(deadline, move |result| {
                match result {
                    Ok(update) => {
                        let changed = update.has_changed();
                        for outcome in outcomes {
                            if changed || outcome.forced {
                                dispatcher.modified(
                                    outcome.key,
                                    path.clone(),
                                    outcome.supplements,
                                );
                            } else {
                                log::trace!("{} is unchanged", outcome.key);
                            }
                        }
                    }
                    Err(err) => {
                        match &err {
                            UpdateError::Cancelled(_) => log::trace!("{}", err),
                            _ => log::debug!("{}", err),
                        }
                        for outcome in outcomes {
                            if outcome.contested {
                                dispatcher.discard(outcome.key);
                            }
                        }
                    }
                }

                if was_created {
                    pending.done(&path);
                }
            });
        }

        for path in created {
            context.pending.done(&path);
        }
    }
}
