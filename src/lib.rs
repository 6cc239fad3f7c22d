//! A hierarchical filesystem change notification engine.
//!
//! Roots are registered under caller chosen [`DirectoryKey`]s. Raw events of
//! the operating system are debounced, checked against content digests and
//! delivered to [`Subscriber`]s as [`DispatchKey`]s, which stay stable when a
//! root is relocated.

pub mod cli;

mod change_processor;
mod checksum;
mod config;
mod diff;
mod directory;
mod dispatch_key;
pub mod logging;
mod pending;
mod restriction;
mod subscriber;
mod tree;
mod virtual_root;

pub use checksum::{
    Algorithm, Checksum, ChecksumResource, ChecksumScheduler, ResourceFactory, Update, UpdateError,
};
pub use config::{Config, ConfigError};
pub use directory::{Blacklist, Directory};
pub use dispatch_key::{DirectoryKey, DispatchKey, RetainKeys};
pub use pending::{Admission, PendingEventRegistry, PendingKind};
pub use restriction::{DeliveryRestriction, RestrictionError, Syntax};
pub use subscriber::{Subscriber, SubscriberId};
pub use tree::DirectoryTree;
pub use virtual_root::{
    BackendFactory, RegistrationError, RelocationObserver, RootOptions, StartError, VirtualRoot,
    WatchedRoot,
};
