//! Gate that holds back MODIFY events while a freshly created file is still
//! being written.
//!
//! Operating systems usually report a CREATE immediately followed by one or
//! more MODIFY events for a single write. A CREATE marks the path pending.
//! MODIFY events inside the locking window are dropped, later ones wait
//! until the creating side calls [`PendingEventRegistry::done`].

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Create,
    Modify,
}

/// What the caller should do with an incoming event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Process the event now.
    Proceed,

    /// The event arrived inside the locking window and carries no new
    /// information.
    Drop,

    /// The path is still pending; call [`PendingEventRegistry::wait`] before
    /// processing the event.
    Await,
}

pub struct PendingEventRegistry {
    locking_time: Duration,
    timeout: Duration,
    entries: Mutex<HashMap<PathBuf, Instant>>,
    cleared: Condvar,
}

impl PendingEventRegistry {
    pub fn new(locking_time: Duration, timeout: Duration) -> Self {
        Self {
            locking_time,
            timeout,
            entries: Mutex::new(HashMap::new()),
            cleared: Condvar::new(),
        }
    }

    /// Classifies an event without blocking.
    ///
    /// A CREATE (re)starts the pending state of its path and always
    /// proceeds.
    pub fn admit(&self, path: &Path, kind: PendingKind) -> Admission {
        let mut entries = self.entries.lock();

        match kind {
            PendingKind::Create => {
                entries.insert(path.to_path_buf(), Instant::now());
                Admission::Proceed
            }
            PendingKind::Modify => match entries.get(path) {
                None => Admission::Proceed,
                Some(created) if created.elapsed() < self.locking_time => {
                    log::trace!(
                        "Dropping modification of {} inside the locking window",
                        path.display()
                    );
                    Admission::Drop
                }
                Some(_) => Admission::Await,
            },
        }
    }

    /// Blocks until `path` is no longer pending or the configured timeout
    /// elapsed. Returns `false` on timeout, in which case the entry is
    /// discarded so later events are not held back again.
    pub fn wait(&self, path: &Path) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut entries = self.entries.lock();

        while entries.contains_key(path) {
            if self.cleared.wait_until(&mut entries, deadline).timed_out() {
                if entries.remove(path).is_some() {
                    log::warn!(
                        "Gave up waiting for {} to finish after {:?}",
                        path.display(),
                        self.timeout
                    );
                    return false;
                }
                break;
            }
        }

        true
    }

    /// Combines [`admit`](Self::admit) and [`wait`](Self::wait). Returns
    /// whether the event should be processed.
    pub fn await_if_pending(&self, path: &Path, kind: PendingKind) -> bool {
        match self.admit(path, kind) {
            Admission::Proceed => true,
            Admission::Drop => false,
            Admission::Await => {
                self.wait(path);
                true
            }
        }
    }

    /// Clears the pending state of `path` and wakes every waiter.
    pub fn done(&self, path: &Path) {
        if self.entries.lock().remove(path).is_some() {
            log::trace!("{} is no longer pending", path.display());
            self.cleared.notify_all();
        }
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    /// How much of the locking window of `path` is left. Zero if the path is
    /// not pending.
    pub fn remaining_lock(&self, path: &Path) -> Duration {
        match self.entries.lock().get(path) {
            Some(created) => self.locking_time.saturating_sub(created.elapsed()),
            None => Duration::ZERO,
        }
    }
}
