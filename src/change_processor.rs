use std::{io, sync::Arc, time::Duration};

use crossbeam_channel::{select, Sender};
use jod_thread::JoinHandle;
use watchfs::{WatchEvent, WatcherCriticalError};

use crate::{
    diff::{CycleContext, DiffCycle},
    pending::{Admission, PendingKind},
    tree::DirectoryTree,
};

const MIN_TICK: Duration = Duration::from_millis(5);
const MAX_TICK: Duration = Duration::from_millis(500);

/// Processes raw watch events of one filesystem and turns them into dispatch
/// cycles.
///
/// Owns the connection between a tree's watch service and the tree by
/// holding onto a thread that processes events. A cycle opens with the first
/// event after a quiet period and closes once it has been open for the
/// dispatch delay.
pub struct ChangeProcessor {
    /// Controls the runtime of the processor thread. When signaled, the job
    /// thread will finish its current work and terminate.
    ///
    /// This channel should be signaled before dropping ChangeProcessor or we'll
    /// hang forever waiting for the event loop to terminate.
    shutdown_sender: Sender<()>,

    /// A handle to the event processing thread. When dropped, we'll block
    /// until it's done.
    ///
    /// Allowed to be unused because dropping this value has side effects.
    #[allow(unused)]
    job_thread: JoinHandle<()>,
}

impl ChangeProcessor {
    /// Spin up the ChangeProcessor, connecting it to the given tree.
    pub fn start(
        tree: Arc<DirectoryTree>,
        context: CycleContext,
        dispatch_delay: Duration,
    ) -> io::Result<Self> {
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);
        let event_receiver = tree.service().event_receiver();
        let mut error_receiver = tree.service().critical_error_receiver();
        let tick = (dispatch_delay / 4).clamp(MIN_TICK, MAX_TICK);
        let name = format!("ChangeProcessor {}", tree.fs_id());

        let task = JobThreadContext {
            tree,
            context,
            dispatch_delay,
        };

        let job_thread = jod_thread::Builder::new().name(name).spawn(move || {
            log::trace!("ChangeProcessor thread started");
            let mut cycle = None;
            let mut errors_closed = false;

            loop {
                select! {
                    recv(event_receiver) -> event => match event {
                        Ok(event) => task.handle_event(event, &mut cycle),
                        Err(_) => {
                            log::debug!("Watch service went away, stopping ChangeProcessor");
                            return;
                        }
                    },
                    recv(error_receiver) -> error => match error {
                        Ok(error) => task.handle_critical_error(error, &mut cycle),
                        Err(_) => errors_closed = true,
                    },
                    recv(shutdown_receiver) -> _ => {
                        log::trace!("ChangeProcessor shutdown signal received...");
                        return;
                    },
                    default(tick) => {},
                }

                if errors_closed {
                    error_receiver = crossbeam_channel::never();
                    errors_closed = false;
                }
                task.flush_if_due(&mut cycle);
            }
        })?;

        Ok(Self {
            shutdown_sender,
            job_thread,
        })
    }
}

impl Drop for ChangeProcessor {
    fn drop(&mut self) {
        // Signal the job thread to start spinning down. Without this we'll hang
        // forever waiting for the thread to finish its infinite loop.
        let _ = self.shutdown_sender.send(());
    }
}

/// Contains all of the state needed to turn events into cycles.
struct JobThreadContext {
    tree: Arc<DirectoryTree>,
    context: CycleContext,
    dispatch_delay: Duration,
}

impl JobThreadContext {
    fn open<'a>(&self, cycle: &'a mut Option<DiffCycle>) -> &'a mut DiffCycle {
        cycle.get_or_insert_with(|| DiffCycle::open(&self.context))
    }

    fn flush(&self, cycle: &mut Option<DiffCycle>) {
        match cycle.take() {
            Some(cycle) if !cycle.is_empty() => cycle.close(),
            _ => {}
        }
    }

    fn flush_if_due(&self, cycle: &mut Option<DiffCycle>) {
        if cycle
            .as_ref()
            .is_some_and(|cycle| cycle.is_due(self.dispatch_delay))
        {
            self.flush(cycle);
        }
    }

    fn handle_event(&self, event: WatchEvent, cycle: &mut Option<DiffCycle>) {
        log::trace!("Watch event: {:?}", event);
        let pending = &self.context.pending;

        match event {
            WatchEvent::Create(path) => {
                pending.admit(&path, PendingKind::Create);
                let cycle = self.open(cycle);
                cycle.created(&path);
                self.tree.path_modified(&path, cycle);
            }
            WatchEvent::Write(path) => match pending.admit(&path, PendingKind::Modify) {
                Admission::Proceed => self.tree.path_modified(&path, self.open(cycle)),
                Admission::Drop => {}
                Admission::Await => {
                    // The creating cycle releases the path once its checksum
                    // completed, so it has to be closed before waiting.
                    self.flush(cycle);
                    pending.wait(&path);
                    self.tree.path_modified(&path, self.open(cycle));
                }
            },
            WatchEvent::Remove(path) => {
                pending.done(&path);
                self.tree.path_discarded(&path, self.open(cycle));
            }
            other => log::debug!("Ignoring unknown watch event {:?}", other),
        }
    }

    fn handle_critical_error(&self, error: WatcherCriticalError, cycle: &mut Option<DiffCycle>) {
        match error {
            WatcherCriticalError::RescanRequired => {
                log::info!("Rescanning {} after lost watch events", self.tree.fs_id());
                self.tree.rescan(self.open(cycle));
            }
            other => log::trace!("Watcher reported {}", other),
        }
    }
}
