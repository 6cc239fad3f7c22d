//! Subscribers and the pool that delivers notifications to them.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;

use crate::{
    dispatch_key::DispatchKey,
    restriction::{DeliveryRestriction, RestrictionError},
};

/// Receives change notifications.
///
/// Callbacks run on the delivery pool, possibly concurrently for different
/// keys. Notifications for one key arrive in the order they were produced.
/// Errors and panics are logged and never reach other subscribers.
pub trait Subscriber: Send + Sync + 'static {
    /// Called once when the subscriber is added.
    fn restrict(&self, restriction: &mut DeliveryRestriction) -> Result<(), RestrictionError> {
        let _ = restriction;
        Ok(())
    }

    /// Content at `file` is new or has changed. `file` is only valid for the
    /// duration of the call; cache by `key` instead.
    fn modified(&self, key: &DispatchKey, file: &Path) -> anyhow::Result<()>;

    /// The entity behind `key` is gone, either deleted or because its root
    /// was unregistered.
    fn discard(&self, key: &DispatchKey);

    /// `additional` names content that was already delivered as `known`.
    /// Always called before the `modified` call for `additional`.
    fn supplement(&self, known: &DispatchKey, additional: &DispatchKey) {
        let _ = (known, additional);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

pub(crate) struct SubscriberEntry {
    id: SubscriberId,
    subscriber: Arc<dyn Subscriber>,
    restriction: DeliveryRestriction,
}

impl SubscriberEntry {
    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn accepts(&self, key: &DispatchKey) -> bool {
        self.restriction.is_accepted(key)
    }

    fn deliver_modified(&self, key: &DispatchKey, file: &Path, supplements: &[DispatchKey]) {
        for known in supplements {
            if self.accepts(known) {
                self.guard("supplement", key, || {
                    self.subscriber.supplement(known, key);
                    Ok(())
                });
            }
        }

        self.guard("modified", key, || self.subscriber.modified(key, file));
    }

    fn deliver_discard(&self, key: &DispatchKey) {
        self.guard("discard", key, || {
            self.subscriber.discard(key);
            Ok(())
        });
    }

    fn guard(&self, callback: &str, key: &DispatchKey, call: impl FnOnce() -> anyhow::Result<()>) {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::warn!(
                    "Subscriber {:?} failed in {} for {}: {:?}",
                    self.id,
                    callback,
                    key,
                    err
                );
            }
            Err(_) => {
                log::error!(
                    "Subscriber {:?} panicked in {} for {}",
                    self.id,
                    callback,
                    key
                );
            }
        }
    }
}

/// The live set of subscribers.
#[derive(Default)]
pub(crate) struct SubscriberSet {
    next_id: AtomicU64,
    entries: RwLock<Vec<Arc<SubscriberEntry>>>,
}

impl SubscriberSet {
    /// Adds `subscriber` unless the very same instance is already present.
    /// Returns `None` for duplicates.
    pub(crate) fn add(
        &self,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<Option<Arc<SubscriberEntry>>, RestrictionError> {
        let mut restriction = DeliveryRestriction::new();
        subscriber.restrict(&mut restriction)?;

        let mut entries = self.entries.write();
        if entries
            .iter()
            .any(|entry| Arc::ptr_eq(&entry.subscriber, &subscriber))
        {
            return Ok(None);
        }

        let entry = Arc::new(SubscriberEntry {
            id: SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            subscriber,
            restriction,
        });
        entries.push(Arc::clone(&entry));
        Ok(Some(entry))
    }

    pub(crate) fn remove(&self, id: SubscriberId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<SubscriberEntry>> {
        self.entries.read().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Fans notifications out to every interested subscriber on a bounded set
/// of delivery threads.
///
/// Each thread is a single-threaded pool with a FIFO queue. A key always
/// hashes to the same lane, so its notifications cannot overtake each other.
pub(crate) struct Dispatcher {
    subscribers: SubscriberSet,
    lanes: Vec<rayon::ThreadPool>,
    next_lane: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let lanes = (0..threads.max(1))
            .map(|lane| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(1)
                    .thread_name(move |_| format!("treewatch delivery #{}", lane))
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            subscribers: SubscriberSet::default(),
            lanes,
            next_lane: AtomicUsize::new(0),
        })
    }

    fn lane_for(&self, key: &DispatchKey) -> &rayon::ThreadPool {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.lanes[hasher.finish() as usize % self.lanes.len()]
    }

    pub(crate) fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    /// Delivers `modified` for `key`, preceded by one `supplement` per entry
    /// of `supplements`.
    pub(crate) fn modified(&self, key: DispatchKey, file: PathBuf, supplements: Vec<DispatchKey>) {
        let lane = self.lane_for(&key);
        let key = Arc::new(key);
        let file = Arc::new(file);
        let supplements = Arc::new(supplements);

        for entry in self.subscribers.snapshot() {
            if !entry.accepts(&key) {
                continue;
            }

            let key = Arc::clone(&key);
            let file = Arc::clone(&file);
            let supplements = Arc::clone(&supplements);
            lane.spawn_fifo(move || entry.deliver_modified(&key, &file, &supplements));
        }
    }

    pub(crate) fn discard(&self, key: DispatchKey) {
        let lane = self.lane_for(&key);
        let key = Arc::new(key);

        for entry in self.subscribers.snapshot() {
            if !entry.accepts(&key) {
                continue;
            }

            let key = Arc::clone(&key);
            lane.spawn_fifo(move || entry.deliver_discard(&key));
        }
    }

    /// Runs `job` on the next delivery thread in turn.
    pub(crate) fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let lane = self.next_lane.fetch_add(1, Ordering::Relaxed) % self.lanes.len();
        self.lanes[lane].spawn_fifo(job);
    }

    /// Delivers a single `modified` to one subscriber on the calling thread.
    pub(crate) fn modified_to(entry: &SubscriberEntry, key: &DispatchKey, file: &Path) {
        if entry.accepts(key) {
            entry.deliver_modified(key, file, &[]);
        }
    }
}
