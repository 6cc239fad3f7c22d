//! The engine's entry point: one directory tree per filesystem, the
//! registered roots and the subscribers.

use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use watchfs::{FileSystemId, StdBackend, WatchService};

use crate::{
    change_processor::ChangeProcessor,
    checksum::{ChecksumScheduler, ResourceFactory},
    config::{Config, ConfigError},
    diff::{CycleContext, DiffCycle},
    directory::Blacklist,
    dispatch_key::DirectoryKey,
    pending::PendingEventRegistry,
    restriction::RestrictionError,
    subscriber::{Dispatcher, Subscriber, SubscriberId},
    tree::{DirectoryTree, Seeds},
};

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("directory key {0} is already registered")]
    DuplicateKey(DirectoryKey),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("directory key {0} is not registered")]
    UnknownKey(DirectoryKey),

    #[error("invalid blacklist pattern")]
    Blacklist(#[from] globset::Error),

    #[error("could not watch {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the watch engine has been shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not start the checksum scheduler")]
    Scheduler(#[from] io::Error),

    #[error("could not start the delivery pool")]
    DeliveryPool(#[from] rayon::ThreadPoolBuildError),
}

/// Creates the native watch service for a newly seen filesystem.
pub type BackendFactory = Arc<dyn Fn(FileSystemId) -> io::Result<WatchService> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct RootOptions {
    /// Glob patterns over paths relative to the root. Matching files are
    /// never reported for this root.
    pub blacklist: Vec<String>,
}

/// Told when a watched root moved to another directory.
pub trait RelocationObserver: Send + Sync + 'static {
    fn destination_changed(&self, root: &WatchedRoot, previous: &Path);
}

/// Handle to a registered root. Cheap to clone; all clones see relocations.
#[derive(Clone)]
pub struct WatchedRoot {
    inner: Arc<WatchedRootInner>,
}

struct WatchedRootInner {
    key: DirectoryKey,
    blacklist: Blacklist,
    location: RwLock<Location>,
    observers: RwLock<Vec<Arc<dyn RelocationObserver>>>,
}

#[derive(Clone)]
struct Location {
    path: PathBuf,
    fs_id: FileSystemId,
}

impl WatchedRoot {
    fn new(key: DirectoryKey, blacklist: Blacklist, location: Location) -> Self {
        Self {
            inner: Arc::new(WatchedRootInner {
                key,
                blacklist,
                location: RwLock::new(location),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn key(&self) -> &DirectoryKey {
        &self.inner.key
    }

    /// The directory currently watched for this root.
    pub fn path(&self) -> PathBuf {
        self.inner.location.read().path.clone()
    }

    pub fn fs_id(&self) -> FileSystemId {
        self.inner.location.read().fs_id
    }

    pub fn add_relocation_observer(&self, observer: Arc<dyn RelocationObserver>) {
        self.inner.observers.write().push(observer);
    }

    fn location(&self) -> Location {
        self.inner.location.read().clone()
    }

    fn same_root(&self, other: &WatchedRoot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WatchedRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let location = self.location();
        f.debug_struct("WatchedRoot")
            .field("key", &self.inner.key)
            .field("path", &location.path)
            .field("fs_id", &location.fs_id)
            .finish()
    }
}

enum Relocation {
    Done,

    /// The root is still watched at its previous location.
    Unchanged(RegistrationError),

    /// The root could not be watched anywhere and is gone.
    Lost(RegistrationError),
}

enum RootSlot {
    /// A registration or relocation of this key is in progress.
    Reserved,
    Active(WatchedRoot),
}

struct TreeEntry {
    tree: Arc<DirectoryTree>,

    /// Allowed to be unused because dropping it stops the worker thread.
    #[allow(unused)]
    processor: ChangeProcessor,
}

/// Owns everything the engine runs: one [`DirectoryTree`] and worker thread
/// per filesystem, the checksum scheduler and the delivery pool.
///
/// Dropping the `VirtualRoot` shuts it down.
pub struct VirtualRoot {
    config: Config,
    context: CycleContext,
    resources: ResourceFactory,
    backend_factory: BackendFactory,

    trees: Mutex<HashMap<FileSystemId, TreeEntry>>,
    roots: Mutex<HashMap<DirectoryKey, RootSlot>>,
    shut_down: AtomicBool,

    /// Declared last so the scheduler outlives every tree.
    #[allow(unused)]
    scheduler: ChecksumScheduler,
}

impl VirtualRoot {
    /// Starts an engine that watches through the operating system.
    pub fn new(config: Config) -> Result<Self, StartError> {
        let debounce = config.watcher_debounce;
        let factory: BackendFactory = Arc::new(move |fs_id| {
            log::debug!("Starting native watcher for {}", fs_id);
            StdBackend::with_debounce(debounce).map(WatchService::new)
        });
        Self::with_backend_factory(config, factory)
    }

    pub fn with_backend_factory(
        config: Config,
        backend_factory: BackendFactory,
    ) -> Result<Self, StartError> {
        config.validate()?;

        let scheduler = ChecksumScheduler::start()?;
        let resources = scheduler.factory(config.algorithm);
        let dispatcher = Arc::new(Dispatcher::new(config.delivery_threads)?);
        let pending = Arc::new(PendingEventRegistry::new(
            config.modification_locking_time,
            config.pending_timeout,
        ));

        log::debug!("Starting watch engine with {:?}", config);

        Ok(Self {
            context: CycleContext {
                dispatcher,
                pending,
                write_deadline: config.write_deadline,
            },
            config,
            resources,
            backend_factory,
            trees: Mutex::new(HashMap::new()),
            roots: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
            scheduler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Adds a subscriber and delivers every file that is already watched to
    /// it. Returns `None` if this subscriber was added before.
    pub fn add_subscriber(
        &self,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<Option<SubscriberId>, RestrictionError> {
        let dispatcher = &self.context.dispatcher;
        let entry = match dispatcher.subscribers().add(subscriber)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        for tree in self.trees() {
            let entry = Arc::clone(&entry);
            dispatcher.spawn(move || tree.force_inform(&entry));
        }

        Ok(Some(entry.id()))
    }

    pub fn remove_subscriber(&self, id: SubscriberId) -> bool {
        self.context.dispatcher.subscribers().remove(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.context.dispatcher.subscribers().len()
    }

    pub fn register_root(
        &self,
        key: impl Into<DirectoryKey>,
        path: impl AsRef<Path>,
    ) -> Result<WatchedRoot, RegistrationError> {
        self.register_root_with(key, path, RootOptions::default())
    }

    /// Starts watching `path` as `key`. Every file below it is reported as
    /// modified, or supplemented where it is already known under another
    /// key.
    pub fn register_root_with(
        &self,
        key: impl Into<DirectoryKey>,
        path: impl AsRef<Path>,
        options: RootOptions,
    ) -> Result<WatchedRoot, RegistrationError> {
        let key = key.into();
        let blacklist = Blacklist::new(&options.blacklist)?;
        let path = resolve_directory(path.as_ref())?;

        self.reserve(&key)?;
        let result = self.attach(&key, &path, &blacklist);

        let mut roots = self.roots.lock();
        match result {
            Ok(location) => {
                let root = WatchedRoot::new(key.clone(), blacklist, location);
                roots.insert(key, RootSlot::Active(root.clone()));
                Ok(root)
            }
            Err(err) => {
                roots.remove(&key);
                Err(err)
            }
        }
    }

    fn attach(
        &self,
        key: &DirectoryKey,
        path: &Path,
        blacklist: &Blacklist,
    ) -> Result<Location, RegistrationError> {
        let fs_id = watchfs::filesystem_id(path).map_err(|source| RegistrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let tree = self.tree_for(fs_id, path)?;

        let mut cycle = DiffCycle::open(&self.context);
        tree.register_root(key.clone(), path, blacklist.clone(), &mut cycle, &Seeds::new())?;
        cycle.close();

        Ok(Location {
            path: path.to_path_buf(),
            fs_id,
        })
    }

    /// Stops watching `root`. Every file it reported is discarded before
    /// this returns.
    pub fn unregister_root(&self, root: &WatchedRoot) -> Result<(), RegistrationError> {
        let key = root.key();
        {
            let mut roots = self.roots.lock();
            match roots.get(key) {
                Some(RootSlot::Active(active)) if active.same_root(root) => {
                    roots.remove(key);
                }
                _ => return Err(RegistrationError::UnknownKey(key.clone())),
            }
        }

        let tree = match self.tree(root.fs_id()) {
            Some(tree) => tree,
            None => return Ok(()),
        };

        let mut cycle = DiffCycle::open(&self.context);
        let result = tree.unregister_root(key, &mut cycle);
        cycle.close();
        result.map(|_| ())
    }

    /// Moves `root` to `new_path`.
    ///
    /// Both the unregistration at the old location and the registration at
    /// the new one happen in a single cycle, and digests are carried over by
    /// relative path. Subscribers only hear about files that differ. If the
    /// new location cannot be watched, the root stays where it was.
    pub fn relocate(
        &self,
        root: &WatchedRoot,
        new_path: impl AsRef<Path>,
    ) -> Result<(), RegistrationError> {
        let new_path = resolve_directory(new_path.as_ref())?;
        let key = root.key().clone();
        let previous = root.location();

        if previous.path == new_path {
            return Ok(());
        }

        {
            let mut roots = self.roots.lock();
            match roots.get(&key) {
                Some(RootSlot::Active(active)) if active.same_root(root) => {
                    roots.insert(key.clone(), RootSlot::Reserved);
                }
                _ => return Err(RegistrationError::UnknownKey(key)),
            }
        }

        let outcome = self.move_root(root, &previous, &new_path);

        {
            let mut roots = self.roots.lock();
            match &outcome {
                Relocation::Done | Relocation::Unchanged(_) => {
                    roots.insert(key, RootSlot::Active(root.clone()));
                }
                Relocation::Lost(_) => {
                    roots.remove(&key);
                }
            }
        }

        match outcome {
            Relocation::Done => {}
            Relocation::Unchanged(err) | Relocation::Lost(err) => return Err(err),
        }

        log::info!(
            "Relocated {} from {} to {}",
            root.key(),
            previous.path.display(),
            new_path.display()
        );

        let observers = root.inner.observers.read().clone();
        for observer in observers {
            observer.destination_changed(root, &previous.path);
        }

        Ok(())
    }

    fn move_root(&self, root: &WatchedRoot, previous: &Location, new_path: &Path) -> Relocation {
        let key = root.key();
        let blacklist = &root.inner.blacklist;

        let new_fs = match watchfs::filesystem_id(new_path) {
            Ok(fs_id) => fs_id,
            Err(source) => {
                return Relocation::Unchanged(RegistrationError::Io {
                    path: new_path.to_path_buf(),
                    source,
                })
            }
        };
        let new_tree = match self.tree_for(new_fs, new_path) {
            Ok(tree) => tree,
            Err(err) => return Relocation::Unchanged(err),
        };
        let old_tree = match self.tree(previous.fs_id) {
            Some(tree) => tree,
            None => return Relocation::Lost(RegistrationError::UnknownKey(key.clone())),
        };

        let mut cycle = DiffCycle::open(&self.context);
        let seeds = match old_tree.unregister_root(key, &mut cycle) {
            Ok(seeds) => seeds,
            Err(err) => {
                cycle.close();
                return Relocation::Lost(err);
            }
        };

        if let Err(err) =
            new_tree.register_root(key.clone(), new_path, blacklist.clone(), &mut cycle, &seeds)
        {
            log::warn!(
                "Could not move {} to {}: {}",
                key,
                new_path.display(),
                err
            );

            let rollback = old_tree.register_root(
                key.clone(),
                &previous.path,
                blacklist.clone(),
                &mut cycle,
                &seeds,
            );
            cycle.close();

            return match rollback {
                Ok(()) => Relocation::Unchanged(err),
                Err(rollback) => {
                    log::error!(
                        "Could not watch {} at {} again, it is no longer watched: {}",
                        key,
                        previous.path.display(),
                        rollback
                    );
                    Relocation::Lost(err)
                }
            };
        }

        cycle.close();
        *root.inner.location.write() = Location {
            path: new_path.to_path_buf(),
            fs_id: new_fs,
        };

        Relocation::Done
    }

    /// Roots currently registered.
    pub fn roots(&self) -> Vec<WatchedRoot> {
        self.roots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                RootSlot::Active(root) => Some(root.clone()),
                RootSlot::Reserved => None,
            })
            .collect()
    }

    pub fn tree(&self, fs_id: FileSystemId) -> Option<Arc<DirectoryTree>> {
        self.trees
            .lock()
            .get(&fs_id)
            .map(|entry| Arc::clone(&entry.tree))
    }

    pub fn trees(&self) -> Vec<Arc<DirectoryTree>> {
        self.trees
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.tree))
            .collect()
    }

    fn reserve(&self, key: &DirectoryKey) -> Result<(), RegistrationError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RegistrationError::ShutDown);
        }

        let mut roots = self.roots.lock();
        if roots.contains_key(key) {
            return Err(RegistrationError::DuplicateKey(key.clone()));
        }
        roots.insert(key.clone(), RootSlot::Reserved);
        Ok(())
    }

    fn tree_for(
        &self,
        fs_id: FileSystemId,
        path: &Path,
    ) -> Result<Arc<DirectoryTree>, RegistrationError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RegistrationError::ShutDown);
        }

        let mut trees = self.trees.lock();
        if let Some(entry) = trees.get(&fs_id) {
            return Ok(Arc::clone(&entry.tree));
        }

        let io_error = |source| RegistrationError::Io {
            path: path.to_path_buf(),
            source,
        };

        let service = (self.backend_factory)(fs_id).map_err(io_error)?;
        let tree = Arc::new(DirectoryTree::new(
            fs_id,
            Arc::new(service),
            self.resources.clone(),
        ));
        let processor = ChangeProcessor::start(
            Arc::clone(&tree),
            self.context.clone(),
            self.config.dispatch_delay,
        )
        .map_err(io_error)?;

        log::debug!("Created directory tree for {}", fs_id);
        trees.insert(
            fs_id,
            TreeEntry {
                tree: Arc::clone(&tree),
                processor,
            },
        );

        Ok(tree)
    }

    /// Stops every worker and cancels every watch. Further registrations
    /// fail with [`RegistrationError::ShutDown`].
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let entries: Vec<TreeEntry> = self.trees.lock().drain().map(|(_, entry)| entry).collect();
        for TreeEntry { tree, processor } in entries {
            drop(processor);
            tree.close();
        }

        self.roots.lock().clear();
        log::debug!("Watch engine shut down");
    }
}

impl Drop for VirtualRoot {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve_directory(path: &Path) -> Result<PathBuf, RegistrationError> {
    match fs_err::metadata(path) {
        Ok(metadata) if metadata.is_dir() => {}
        _ => return Err(RegistrationError::NotADirectory(path.to_path_buf())),
    }

    fs_err::canonicalize(path).map_err(|source| RegistrationError::Io {
        path: path.to_path_buf(),
        source,
    })
}
