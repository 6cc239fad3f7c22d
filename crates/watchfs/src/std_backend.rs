use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use notify::RecursiveMode;
use notify_debouncer_full::{
    new_debouncer,
    notify::event::{CreateKind, EventKind, ModifyKind, RemoveKind, RenameMode},
    DebounceEventResult, Debouncer, RecommendedCache,
};

use crate::{WatchBackend, WatchEvent, WatchHandle};

/// Errors from the file watcher that mean some events were or will be lost.
#[derive(Debug, Clone)]
pub enum WatcherCriticalError {
    /// The notify crate reported an error
    WatcherError {
        error: String,
        path: Option<PathBuf>,
    },
    /// Too many file changes caused the watcher to request a rescan
    RescanRequired,
    /// Failed to send an event through the channel
    ChannelSendFailed(String),
}

impl std::fmt::Display for WatcherCriticalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WatcherError { error, path } => {
                write!(f, "File watcher error: {} (path: {:?})", error, path)
            }
            Self::RescanRequired => {
                write!(f, "File watcher requested rescan due to too many changes")
            }
            Self::ChannelSendFailed(err) => {
                write!(f, "File watcher failed to send event: {}", err)
            }
        }
    }
}

impl std::error::Error for WatcherCriticalError {}

/// Callback type for handling critical watcher errors.
/// Return `true` to drop the rest of the current event batch.
pub type CriticalErrorHandler = Box<dyn Fn(WatcherCriticalError) -> bool + Send + Sync + 'static>;

/// `WatchBackend` that uses the `notify` crate.
///
/// Every registered directory is watched on its own, non-recursively, so the
/// owner decides which sub-directories are interesting.
pub struct StdBackend {
    debouncer: Debouncer<notify::RecommendedWatcher, RecommendedCache>,
    watcher_receiver: Receiver<WatchEvent>,
    watches: HashMap<PathBuf, u64>,
    next_id: u64,
    critical_error_receiver: Receiver<WatcherCriticalError>,
}

impl StdBackend {
    /// Creates a new StdBackend that coalesces raw notify events for
    /// `debounce` before handing them out.
    ///
    /// Errors are logged. A closed event channel stops delivery of the
    /// current batch since nobody is listening anymore.
    pub fn with_debounce(debounce: Duration) -> io::Result<StdBackend> {
        Self::new_with_error_handler(
            debounce,
            Box::new(|err| match &err {
                WatcherCriticalError::RescanRequired => {
                    log::warn!(
                        "File watcher requested rescan due to rapid changes. \
                         Some file events may have been missed."
                    );
                    false
                }
                WatcherCriticalError::ChannelSendFailed(_) => {
                    log::debug!("{}", err);
                    true
                }
                WatcherCriticalError::WatcherError { .. } => {
                    log::error!("{}", err);
                    false
                }
            }),
        )
    }

    /// Creates a new StdBackend with a custom error handler.
    ///
    /// Critical errors are also sent to the `critical_error_receiver()`
    /// channel, which the owning `WatchService` hands to its consumer.
    pub fn new_with_error_handler(
        debounce: Duration,
        error_handler: CriticalErrorHandler,
    ) -> io::Result<StdBackend> {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (error_tx, error_rx) = crossbeam_channel::unbounded();

        let debouncer = Self::create_debouncer(debounce, event_tx, error_tx, error_handler)?;

        Ok(Self {
            debouncer,
            watcher_receiver: event_rx,
            watches: HashMap::new(),
            next_id: 0,
            critical_error_receiver: error_rx,
        })
    }

    fn create_debouncer(
        debounce: Duration,
        event_tx: Sender<WatchEvent>,
        error_tx: Sender<WatcherCriticalError>,
        error_handler: CriticalErrorHandler,
    ) -> io::Result<Debouncer<notify::RecommendedWatcher, RecommendedCache>> {
        new_debouncer(debounce, None, move |result: DebounceEventResult| {
            let report = |critical_err: WatcherCriticalError| {
                let _ = error_tx.send(critical_err.clone());
                error_handler(critical_err)
            };

            match result {
                Ok(events) => {
                    for event in events {
                        for watch_event in Self::convert_event(&event.event) {
                            if let Err(err) = event_tx.send(watch_event) {
                                if report(WatcherCriticalError::ChannelSendFailed(
                                    err.to_string(),
                                )) {
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        let critical_err = if error.paths.is_empty() {
                            WatcherCriticalError::RescanRequired
                        } else {
                            WatcherCriticalError::WatcherError {
                                error: format!("{:?}", error.kind),
                                path: error.paths.first().cloned(),
                            }
                        };

                        if report(critical_err) {
                            return;
                        }
                    }
                }
            }
        })
        .map_err(|err| io::Error::other(format!("Failed to create file watcher: {:?}", err)))
    }

    /// Convert a notify event to our WatchEvent(s)
    fn convert_event(event: &notify::Event) -> Vec<WatchEvent> {
        let mut watch_events = Vec::new();

        match &event.kind {
            EventKind::Create(CreateKind::File)
            | EventKind::Create(CreateKind::Folder)
            | EventKind::Create(CreateKind::Any)
            | EventKind::Create(CreateKind::Other) => {
                for path in &event.paths {
                    watch_events.push(WatchEvent::Create(path.clone()));
                }
            }

            EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Other) => {
                for path in &event.paths {
                    watch_events.push(WatchEvent::Write(path.clone()));
                }
            }

            // Permissions and timestamps never change a checksum.
            EventKind::Modify(ModifyKind::Metadata(_)) => {}

            // Old path at [0], new path at [1]
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if event.paths.len() >= 2 {
                    watch_events.push(WatchEvent::Remove(event.paths[0].clone()));
                    watch_events.push(WatchEvent::Create(event.paths[1].clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    watch_events.push(WatchEvent::Remove(path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &event.paths {
                    watch_events.push(WatchEvent::Create(path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Any))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Other)) => {
                for path in &event.paths {
                    watch_events.push(WatchEvent::Write(path.clone()));
                }
            }

            EventKind::Remove(RemoveKind::File)
            | EventKind::Remove(RemoveKind::Folder)
            | EventKind::Remove(RemoveKind::Any)
            | EventKind::Remove(RemoveKind::Other) => {
                for path in &event.paths {
                    watch_events.push(WatchEvent::Remove(path.clone()));
                }
            }

            EventKind::Access(_) => {}

            EventKind::Other | EventKind::Any => {
                for path in &event.paths {
                    watch_events.push(WatchEvent::Write(path.clone()));
                }
            }
        }

        watch_events
    }

    #[cfg(test)]
    fn new_for_testing() -> StdBackend {
        Self::new_with_error_handler(
            Duration::from_millis(50),
            Box::new(|err| {
                log::trace!("Test backend error (expected during test cleanup): {}", err);
                true
            }),
        )
        .unwrap()
    }
}

impl WatchBackend for StdBackend {
    fn watch(&mut self, path: &Path) -> io::Result<WatchHandle> {
        if let Some(id) = self.watches.get(path) {
            return Ok(WatchHandle::new(*id, path.to_path_buf()));
        }

        // Only track the path once notify accepted it, so a failed watch can
        // be retried later.
        match self.debouncer.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                self.next_id += 1;
                self.watches.insert(path.to_path_buf(), self.next_id);
                log::debug!("Watching directory: {}", path.display());
                Ok(WatchHandle::new(self.next_id, path.to_path_buf()))
            }
            Err(err) => {
                log::warn!("Failed to watch path {}: {:?}", path.display(), err);
                Err(io::Error::other(format!("{:?}", err)))
            }
        }
    }

    fn cancel(&mut self, handle: &WatchHandle) -> io::Result<()> {
        if self.watches.get(handle.path()) != Some(&handle.id()) {
            return Ok(());
        }

        self.watches.remove(handle.path());

        match self.debouncer.unwatch(handle.path()) {
            Ok(()) => {
                log::debug!("Unwatched directory: {}", handle.path().display());
                Ok(())
            }
            // A deleted directory takes its OS watch with it.
            Err(err)
                if matches!(
                    err.kind,
                    notify::ErrorKind::WatchNotFound | notify::ErrorKind::PathNotFound
                ) =>
            {
                log::trace!("Watch already gone: {}", handle.path().display());
                Ok(())
            }
            Err(err) => {
                log::warn!(
                    "Failed to unwatch path {}: {:?}",
                    handle.path().display(),
                    err
                );
                Err(io::Error::other(format!("{:?}", err)))
            }
        }
    }

    fn event_receiver(&self) -> Receiver<WatchEvent> {
        self.watcher_receiver.clone()
    }

    fn critical_error_receiver(&self) -> Receiver<WatcherCriticalError> {
        self.critical_error_receiver.clone()
    }
}
