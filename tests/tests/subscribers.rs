use std::{path::Path, sync::Arc};

use pretty_assertions::assert_eq;

use libtreewatch::{DispatchKey, Subscriber, Syntax};

use crate::watch_test::{
    recording::*,
    session::{WatchSession, QUIET},
};

struct Broken;

impl Subscriber for Broken {
    fn modified(&self, key: &DispatchKey, _file: &Path) -> anyhow::Result<()> {
        anyhow::bail!("refusing {}", key)
    }

    fn discard(&self, _key: &DispatchKey) {
        panic!("discard is not supported");
    }
}

#[test]
fn broken_subscribers_do_not_affect_others() {
    let session = WatchSession::new();
    session.engine.add_subscriber(Arc::new(Broken)).unwrap();
    let file = session.write("a.txt", "a");
    session.register("docs", "");
    assert_eq!(session.drain(), vec![modified("docs:a.txt", "a")]);

    fs_err::remove_file(&file).unwrap();
    session.removed(&file);
    assert_eq!(session.drain(), vec![discard("docs:a.txt")]);
}

#[test]
fn restricted_subscribers_only_see_matching_keys() {
    let session = WatchSession::new();
    let (recorder, events) = Recorder::restricted(|restriction| {
        restriction
            .ignore(["private"])
            .add_in(0..1, Syntax::Glob, &["src"])?;
        Ok(())
    });
    session.engine.add_subscriber(recorder).unwrap();

    session.write("project/src/main.txt", "main");
    session.write("project/docs/guide.txt", "guide");
    session.write("secret/src/key.txt", "key");
    session.register("project", "project");
    session.register("private", "secret");

    assert_eq!(
        drain(&events, QUIET),
        vec![modified("project:src/main.txt", "main")]
    );
    assert_eq!(session.drain_sorted().len(), 3);
}

#[test]
fn late_subscribers_catch_up_on_known_files() {
    let session = WatchSession::new();
    session.write("a.txt", "a");
    session.write("sub/b.txt", "b");
    session.register("docs", "");
    session.drain();

    let (recorder, events) = Recorder::new();
    let id = session.engine.add_subscriber(recorder.clone()).unwrap();
    assert!(id.is_some());
    assert_eq!(session.engine.add_subscriber(recorder).unwrap(), None);

    assert_eq!(
        drain_sorted(&events, QUIET),
        vec![modified("docs:a.txt", "a"), modified("docs:sub/b.txt", "b")]
    );
}

#[test]
fn removed_subscribers_hear_nothing() {
    let session = WatchSession::new();
    let (recorder, events) = Recorder::new();
    let id = session.engine.add_subscriber(recorder).unwrap().unwrap();
    assert_eq!(session.engine.subscriber_count(), 2);

    assert!(session.engine.remove_subscriber(id));
    assert!(!session.engine.remove_subscriber(id));
    assert_eq!(session.engine.subscriber_count(), 1);

    session.write("a.txt", "a");
    session.register("docs", "");

    assert_eq!(drain(&events, QUIET), vec![]);
    assert_eq!(session.drain(), vec![modified("docs:a.txt", "a")]);
}
