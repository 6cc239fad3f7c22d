//! Debounced content digests for watched files.
//!
//! Every tracked file owns a [`ChecksumResource`]. Asking a resource to
//! update schedules a digest computation `deadline` after the request; any
//! newer request pushes that moment further out, so a file that is still
//! being written is hashed once, after it went quiet.

use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fmt, io,
    io::Read,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use crossbeam_channel::{select, Receiver, Sender};
use jod_thread::JoinHandle;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Digest as _;
use thiserror::Error;

/// Digest algorithm used for every resource created by a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Sha256,
    Blake3,
}

impl Algorithm {
    pub fn digest_file(self, path: &Path) -> io::Result<Checksum> {
        let mut file = fs_err::File::open(path)?;
        let mut buffer = [0u8; 16 * 1024];

        match self {
            Algorithm::Sha256 => {
                let mut hasher = sha2::Sha256::new();
                loop {
                    let read = file.read(&mut buffer)?;
                    if read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..read]);
                }
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&hasher.finalize());
                Ok(Checksum(bytes))
            }
            Algorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                loop {
                    let read = file.read(&mut buffer)?;
                    if read == 0 {
                        break;
                    }
                    hasher.update(&buffer[..read]);
                }
                Ok(Checksum(*hasher.finalize().as_bytes()))
            }
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Sha256 => f.write_str("sha256"),
            Algorithm::Blake3 => f.write_str("blake3"),
        }
    }
}

/// A 256 bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Result of a completed digest computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Update {
    pub previous: Option<Checksum>,
    pub current: Checksum,
}

impl Update {
    pub fn has_changed(&self) -> bool {
        self.previous != Some(self.current)
    }
}

#[derive(Debug, Clone, Error)]
pub enum UpdateError {
    #[error("could not checksum {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("checksum resource for {} was cancelled", .0.display())]
    Cancelled(PathBuf),

    #[error("checksum scheduler has stopped")]
    SchedulerStopped,
}

type UpdateCallback = Box<dyn FnOnce(Result<Update, UpdateError>) + Send + 'static>;

struct ResourceState {
    digest: Option<Checksum>,
    generation: u64,
    waiters: Vec<UpdateCallback>,
    cancelled: bool,
}

/// Tracks the last known digest of one file.
pub struct ChecksumResource {
    path: PathBuf,
    algorithm: Algorithm,
    scheduler: Sender<Scheduled>,
    state: Mutex<ResourceState>,
}

impl ChecksumResource {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The digest recorded by the last successful computation.
    pub fn current(&self) -> Option<Checksum> {
        self.state.lock().digest
    }

    /// Records `digest` as the known content without reading the file.
    pub fn seed(&self, digest: Checksum) {
        let mut state = self.state.lock();
        if !state.cancelled {
            state.digest = Some(digest);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Requests a new digest once `deadline` passed without another request.
    ///
    /// Requests that are superseded before their deadline are answered
    /// together with the newest one. Only the newest request observes a
    /// change; older ones see the new digest as both previous and current.
    pub fn update<F>(self: &Arc<Self>, deadline: Duration, callback: F)
    where
        F: FnOnce(Result<Update, UpdateError>) + Send + 'static,
    {
        let mut state = self.state.lock();

        if state.cancelled {
            drop(state);
            callback(Err(UpdateError::Cancelled(self.path.clone())));
            return;
        }

        state.generation += 1;
        state.waiters.push(Box::new(callback));

        let scheduled = Scheduled {
            due: Instant::now() + deadline,
            generation: state.generation,
            resource: Arc::downgrade(self),
        };

        if self.scheduler.send(scheduled).is_err() {
            let waiters = std::mem::take(&mut state.waiters);
            drop(state);
            for waiter in waiters {
                waiter(Err(UpdateError::SchedulerStopped));
            }
        }
    }

    /// Stops tracking the file. Outstanding requests fail with
    /// `UpdateError::Cancelled`; later requests fail immediately.
    pub fn cancel(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.digest = None;
            std::mem::take(&mut state.waiters)
        };

        for waiter in waiters {
            waiter(Err(UpdateError::Cancelled(self.path.clone())));
        }
    }

    fn fire(&self, generation: u64) {
        let (previous, waiters) = {
            let mut state = self.state.lock();
            if state.cancelled || state.generation != generation {
                return;
            }
            (state.digest, std::mem::take(&mut state.waiters))
        };

        if waiters.is_empty() {
            return;
        }

        let result = self.algorithm.digest_file(&self.path);

        {
            let mut state = self.state.lock();
            if state.cancelled {
                drop(state);
                for waiter in waiters {
                    waiter(Err(UpdateError::Cancelled(self.path.clone())));
                }
                return;
            }
            state.digest = result.as_ref().ok().copied();
        }

        match result {
            Ok(current) => {
                log::trace!("Checksum of {} is {}", self.path.display(), current);

                let newest = waiters.len() - 1;
                for (index, waiter) in waiters.into_iter().enumerate() {
                    let previous = if index == newest {
                        previous
                    } else {
                        Some(current)
                    };
                    waiter(Ok(Update { previous, current }));
                }
            }
            Err(err) => {
                let source = Arc::new(err);
                for waiter in waiters {
                    waiter(Err(UpdateError::Io {
                        path: self.path.clone(),
                        source: Arc::clone(&source),
                    }));
                }
            }
        }
    }
}

impl fmt::Debug for ChecksumResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChecksumResource")
            .field("path", &self.path)
            .field("algorithm", &self.algorithm)
            .field("digest", &self.current())
            .finish()
    }
}

struct Scheduled {
    due: Instant,
    generation: u64,
    resource: Weak<ChecksumResource>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.generation == other.generation
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then(self.generation.cmp(&other.generation))
    }
}

/// Creates [`ChecksumResource`]s bound to a running [`ChecksumScheduler`].
#[derive(Clone)]
pub struct ResourceFactory {
    algorithm: Algorithm,
    sender: Sender<Scheduled>,
}

impl ResourceFactory {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn create(&self, path: impl Into<PathBuf>) -> Arc<ChecksumResource> {
        Arc::new(ChecksumResource {
            path: path.into(),
            algorithm: self.algorithm,
            scheduler: self.sender.clone(),
            state: Mutex::new(ResourceState {
                digest: None,
                generation: 0,
                waiters: Vec::new(),
                cancelled: false,
            }),
        })
    }
}

/// Owns the thread that computes digests once their deadline is reached.
///
/// Dropping the scheduler stops the thread; requests still waiting for their
/// deadline are never answered.
pub struct ChecksumScheduler {
    sender: Sender<Scheduled>,

    shutdown_sender: Sender<()>,

    /// Allowed to be unused because dropping this value joins the thread.
    #[allow(unused)]
    job_thread: JoinHandle<()>,
}

impl ChecksumScheduler {
    pub fn start() -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (shutdown_sender, shutdown_receiver) = crossbeam_channel::bounded(1);

        let job_thread = jod_thread::Builder::new()
            .name("Checksum scheduler".to_owned())
            .spawn(move || run_scheduler(receiver, shutdown_receiver))?;

        Ok(Self {
            sender,
            shutdown_sender,
            job_thread,
        })
    }

    pub fn factory(&self, algorithm: Algorithm) -> ResourceFactory {
        ResourceFactory {
            algorithm,
            sender: self.sender.clone(),
        }
    }
}

impl Drop for ChecksumScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_sender.send(());
    }
}

fn run_scheduler(receiver: Receiver<Scheduled>, shutdown_receiver: Receiver<()>) {
    log::trace!("Checksum scheduler started");
    let mut queue: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while queue.peek().is_some_and(|next| next.0.due <= now) {
            if let Some(Reverse(scheduled)) = queue.pop() {
                if let Some(resource) = scheduled.resource.upgrade() {
                    resource.fire(scheduled.generation);
                }
            }
        }

        let timeout = match queue.peek() {
            Some(next) => next.0.due.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(3600),
        };

        select! {
            recv(receiver) -> scheduled => match scheduled {
                Ok(scheduled) => queue.push(Reverse(scheduled)),
                Err(_) => return,
            },
            recv(shutdown_receiver) -> _ => {
                log::trace!("Checksum scheduler shutdown signal received...");
                return;
            },
            default(timeout) => {},
        }
    }
}
