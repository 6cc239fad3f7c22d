use std::{path::Path, sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, Sender};

use libtreewatch::{DeliveryRestriction, DispatchKey, RestrictionError, Subscriber};

/// One notification, with keys rendered as `key:relative/path`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Seen {
    Modified(String, String),
    Discard(String),
    Supplement(String, String),
}

pub fn modified(key: &str, contents: &str) -> Seen {
    Seen::Modified(key.to_owned(), contents.to_owned())
}

pub fn discard(key: &str) -> Seen {
    Seen::Discard(key.to_owned())
}

pub fn supplement(known: &str, additional: &str) -> Seen {
    Seen::Supplement(known.to_owned(), additional.to_owned())
}

type Restrict = Box<dyn Fn(&mut DeliveryRestriction) -> Result<(), RestrictionError> + Send + Sync>;

/// Forwards every notification into a channel, reading the file content at
/// delivery time.
pub struct Recorder {
    sender: Sender<Seen>,
    restrict: Option<Restrict>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Receiver<Seen>) {
        Self::build(None)
    }

    pub fn restricted(
        restrict: impl Fn(&mut DeliveryRestriction) -> Result<(), RestrictionError>
            + Send
            + Sync
            + 'static,
    ) -> (Arc<Self>, Receiver<Seen>) {
        Self::build(Some(Box::new(restrict)))
    }

    fn build(restrict: Option<Restrict>) -> (Arc<Self>, Receiver<Seen>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Arc::new(Self { sender, restrict }), receiver)
    }
}

fn render(key: &DispatchKey) -> String {
    let relative = key.relative_path().to_string_lossy().replace('\\', "/");
    format!("{}:{}", key.directory_key(), relative)
}

impl Subscriber for Recorder {
    fn restrict(&self, restriction: &mut DeliveryRestriction) -> Result<(), RestrictionError> {
        match &self.restrict {
            Some(restrict) => restrict(restriction),
            None => Ok(()),
        }
    }

    fn modified(&self, key: &DispatchKey, file: &Path) -> anyhow::Result<()> {
        let contents = fs_err::read_to_string(file)?;
        let _ = self.sender.send(Seen::Modified(render(key), contents));
        Ok(())
    }

    fn discard(&self, key: &DispatchKey) {
        let _ = self.sender.send(Seen::Discard(render(key)));
    }

    fn supplement(&self, known: &DispatchKey, additional: &DispatchKey) {
        let _ = self
            .sender
            .send(Seen::Supplement(render(known), render(additional)));
    }
}

/// Everything that arrives until the channel stayed quiet for `quiet`, in
/// delivery order.
pub fn drain(receiver: &Receiver<Seen>, quiet: Duration) -> Vec<Seen> {
    let mut seen = Vec::new();
    while let Ok(event) = receiver.recv_timeout(quiet) {
        seen.push(event);
    }
    seen
}

/// Like [`drain`], sorted for comparisons where delivery order across keys
/// does not matter.
pub fn drain_sorted(receiver: &Receiver<Seen>, quiet: Duration) -> Vec<Seen> {
    let mut seen = drain(receiver, quiet);
    seen.sort();
    seen
}
