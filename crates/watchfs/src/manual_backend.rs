use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::{WatchBackend, WatchEvent, WatchHandle, WatcherCriticalError};

#[derive(Debug, Default)]
struct Registrations {
    next_id: u64,
    watches: HashMap<PathBuf, u64>,
}

/// `WatchBackend` that never touches the operating system.
///
/// Events only appear when they are pushed through a [`ManualInjector`].
/// Registrations are still tracked so callers can check which directories
/// are currently watched.
#[derive(Debug)]
pub struct ManualBackend {
    sender: Sender<WatchEvent>,
    receiver: Receiver<WatchEvent>,
    error_sender: Sender<WatcherCriticalError>,
    error_receiver: Receiver<WatcherCriticalError>,
    registrations: Arc<Mutex<Registrations>>,
}

impl ManualBackend {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (error_sender, error_receiver) = crossbeam_channel::unbounded();

        Self {
            sender,
            receiver,
            error_sender,
            error_receiver,
            registrations: Arc::new(Mutex::new(Registrations::default())),
        }
    }

    /// Returns a handle that can feed events into this backend from any
    /// thread, even after the backend moved into a `WatchService`.
    pub fn injector(&self) -> ManualInjector {
        ManualInjector {
            sender: self.sender.clone(),
            error_sender: self.error_sender.clone(),
            registrations: Arc::clone(&self.registrations),
        }
    }
}

impl Default for ManualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchBackend for ManualBackend {
    fn watch(&mut self, path: &Path) -> io::Result<WatchHandle> {
        let mut registrations = self.registrations.lock();

        if let Some(id) = registrations.watches.get(path) {
            return Ok(WatchHandle::new(*id, path.to_path_buf()));
        }

        registrations.next_id += 1;
        let id = registrations.next_id;
        registrations.watches.insert(path.to_path_buf(), id);
        log::trace!("Manually watching {}", path.display());

        Ok(WatchHandle::new(id, path.to_path_buf()))
    }

    fn cancel(&mut self, handle: &WatchHandle) -> io::Result<()> {
        let mut registrations = self.registrations.lock();

        if registrations.watches.get(handle.path()) == Some(&handle.id()) {
            registrations.watches.remove(handle.path());
            log::trace!("Manually unwatched {}", handle.path().display());
        }

        Ok(())
    }

    fn event_receiver(&self) -> Receiver<WatchEvent> {
        self.receiver.clone()
    }

    fn critical_error_receiver(&self) -> Receiver<WatcherCriticalError> {
        self.error_receiver.clone()
    }
}

/// Sending half of a [`ManualBackend`].
#[derive(Debug, Clone)]
pub struct ManualInjector {
    sender: Sender<WatchEvent>,
    error_sender: Sender<WatcherCriticalError>,
    registrations: Arc<Mutex<Registrations>>,
}

impl ManualInjector {
    /// Delivers `event` as if the operating system had reported it.
    pub fn send(&self, event: WatchEvent) {
        // The receiving side lives as long as the backend; once that is gone
        // nobody is interested in the event anymore.
        let _ = self.sender.send(event);
    }

    /// Reports `error` as if the native watcher had run into it.
    pub fn report(&self, error: WatcherCriticalError) {
        let _ = self.error_sender.send(error);
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.registrations.lock().watches.contains_key(path)
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.registrations.lock().watches.keys().cloned().collect();
        paths.sort();
        paths
    }
}
