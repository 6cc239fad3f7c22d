/*!
Per-directory filesystem watching with a configurable backend.

watchfs is the native watch layer underneath treewatch. Every watched
directory gets its own [`WatchHandle`]; changes inside it arrive as raw
[`WatchEvent`]s on a channel that the owner polls or selects on.

## Backends
* `StdBackend`, which uses the `notify` crate and watches each directory
  non-recursively
* `ManualBackend`, which only emits the events it is handed, useful for
  testing and for embedders that already have an event source
*/

mod manual_backend;
mod std_backend;

use std::io;
use std::path::{Path, PathBuf};

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

pub use manual_backend::{ManualBackend, ManualInjector};
pub use std_backend::{CriticalErrorHandler, StdBackend, WatcherCriticalError};

mod sealed {
    use super::*;

    /// Sealing trait for WatchBackend.
    pub trait Sealed {}

    impl Sealed for StdBackend {}
    impl Sealed for ManualBackend {}
}

/// Token returned for every directory registered with a backend.
///
/// A handle stays valid until it is passed to `cancel`. Cancelling twice is
/// harmless.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    id: u64,
    path: PathBuf,
}

impl WatchHandle {
    pub(crate) fn new(id: u64, path: PathBuf) -> Self {
        Self { id, path }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Backend that can be used to create a `WatchService`.
///
/// This trait is sealed and cannot not be implemented outside this crate.
pub trait WatchBackend: sealed::Sealed + Send + 'static {
    fn watch(&mut self, path: &Path) -> io::Result<WatchHandle>;
    fn cancel(&mut self, handle: &WatchHandle) -> io::Result<()>;
    fn event_receiver(&self) -> Receiver<WatchEvent>;

    /// Errors after which the backend may have lost events.
    fn critical_error_receiver(&self) -> Receiver<WatcherCriticalError>;
}

/// A raw change reported for a path inside a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WatchEvent {
    Create(PathBuf),
    Write(PathBuf),
    Remove(PathBuf),
}

impl WatchEvent {
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Create(path) | WatchEvent::Write(path) | WatchEvent::Remove(path) => path,
        }
    }
}

/// A watch service with a configurable backend.
///
/// All operations go through a mutex so a service can be shared between the
/// thread registering directories and the thread consuming events.
pub struct WatchService {
    backend: Mutex<Box<dyn WatchBackend>>,
    receiver: Receiver<WatchEvent>,
    errors: Receiver<WatcherCriticalError>,
}

impl WatchService {
    /// Creates a new `WatchService` with the given backend.
    pub fn new<B: WatchBackend>(backend: B) -> Self {
        let receiver = backend.event_receiver();
        let errors = backend.critical_error_receiver();

        Self {
            backend: Mutex::new(Box::new(backend)),
            receiver,
            errors,
        }
    }

    /// Starts watching the direct children of the given directory.
    pub fn register(&self, path: &Path) -> io::Result<WatchHandle> {
        self.backend.lock().watch(path)
    }

    /// Stops watching the directory behind `handle`.
    pub fn cancel(&self, handle: &WatchHandle) -> io::Result<()> {
        self.backend.lock().cancel(handle)
    }

    /// Returns a receiver for every raw event the backend produces.
    pub fn event_receiver(&self) -> Receiver<WatchEvent> {
        self.receiver.clone()
    }

    /// Returns a receiver for errors that mean events were lost. Whoever
    /// consumes events should rescan what it watches when one arrives.
    pub fn critical_error_receiver(&self) -> Receiver<WatcherCriticalError> {
        self.errors.clone()
    }

    /// Takes the next pending event without blocking.
    pub fn poll(&self) -> Option<WatchEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Identifies the filesystem or volume a path lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileSystemId(u64);

impl std::fmt::Display for FileSystemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fs#{:x}", self.0)
    }
}

/// Returns the identity of the filesystem holding `path`.
#[cfg(unix)]
pub fn filesystem_id(path: &Path) -> io::Result<FileSystemId> {
    use std::os::unix::fs::MetadataExt;

    let metadata = fs_err::metadata(path)?;
    Ok(FileSystemId(metadata.dev()))
}

/// Returns the identity of the filesystem holding `path`.
///
/// Without device numbers available, the path prefix (drive letter or UNC
/// share) stands in for the volume.
#[cfg(not(unix))]
pub fn filesystem_id(path: &Path) -> io::Result<FileSystemId> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::path::Component;

    fs_err::metadata(path)?;

    let mut hasher = DefaultHasher::new();
    if let Some(Component::Prefix(prefix)) = path.components().next() {
        prefix.as_os_str().to_ascii_lowercase().hash(&mut hasher);
    }
    Ok(FileSystemId(hasher.finish()))
}
