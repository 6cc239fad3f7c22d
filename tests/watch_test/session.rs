use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tempfile::{tempdir, TempDir};
use watchfs::{ManualBackend, ManualInjector, WatchEvent, WatchService, WatcherCriticalError};

use libtreewatch::{BackendFactory, Config, VirtualRoot, WatchedRoot};

use super::recording::{drain, drain_sorted, Recorder, Seen};

pub const WRITE_DEADLINE: Duration = Duration::from_millis(50);
pub const DISPATCH_DELAY: Duration = Duration::from_millis(50);
pub const LOCKING_TIME: Duration = Duration::from_millis(100);

/// How long the subscriber has to stay silent before a test looks at what
/// it received.
pub const QUIET: Duration = Duration::from_millis(400);

/// A running engine over a scratch directory. Watch events never come from
/// the operating system; tests report them through [`WatchSession::send`].
pub struct WatchSession {
    pub engine: VirtualRoot,
    pub events: Receiver<Seen>,
    root: PathBuf,
    injectors: Arc<Mutex<Vec<ManualInjector>>>,

    /// Removed on drop, so it has to outlive the engine.
    _dir: TempDir,
}

impl WatchSession {
    pub fn new() -> Self {
        let _ = init_test_logging();

        let injectors = Arc::new(Mutex::new(Vec::new()));
        let factory: BackendFactory = {
            let injectors = Arc::clone(&injectors);
            Arc::new(move |_| {
                let backend = ManualBackend::new();
                injectors.lock().push(backend.injector());
                Ok(WatchService::new(backend))
            })
        };

        let config = Config {
            write_deadline: WRITE_DEADLINE,
            dispatch_delay: DISPATCH_DELAY,
            modification_locking_time: LOCKING_TIME,
            pending_timeout: Duration::from_secs(2),
            delivery_threads: 2,
            ..Config::default()
        };

        let engine = VirtualRoot::with_backend_factory(config, factory).unwrap();
        let (recorder, events) = Recorder::new();
        engine.add_subscriber(recorder).unwrap();

        let dir = tempdir().unwrap();
        let root = fs_err::canonicalize(dir.path()).unwrap();

        WatchSession {
            engine,
            events,
            root,
            injectors,
            _dir: dir,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent).unwrap();
        }
        fs_err::write(&path, contents).unwrap();
        path
    }

    pub fn mkdir(&self, relative: &str) -> PathBuf {
        let path = self.path(relative);
        fs_err::create_dir_all(&path).unwrap();
        path
    }

    pub fn register(&self, key: &str, relative: &str) -> WatchedRoot {
        self.engine.register_root(key, self.path(relative)).unwrap()
    }

    pub fn send(&self, event: WatchEvent) {
        for injector in self.injectors.lock().iter() {
            injector.send(event.clone());
        }
    }

    pub fn created(&self, path: &Path) {
        self.send(WatchEvent::Create(path.to_path_buf()));
    }

    pub fn written(&self, path: &Path) {
        self.send(WatchEvent::Write(path.to_path_buf()));
    }

    pub fn removed(&self, path: &Path) {
        self.send(WatchEvent::Remove(path.to_path_buf()));
    }

    /// Tells the engine that the watcher dropped events.
    pub fn rescan_required(&self) {
        for injector in self.injectors.lock().iter() {
            injector.report(WatcherCriticalError::RescanRequired);
        }
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.injectors
            .lock()
            .iter()
            .any(|injector| injector.is_watched(path))
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .injectors
            .lock()
            .iter()
            .flat_map(|injector| injector.watched_paths())
            .collect();
        paths.sort();
        paths
    }

    pub fn drain(&self) -> Vec<Seen> {
        drain(&self.events, QUIET)
    }

    pub fn drain_sorted(&self) -> Vec<Seen> {
        drain_sorted(&self.events, QUIET)
    }
}

fn init_test_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish()
        .try_init()
}
