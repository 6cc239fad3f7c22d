use std::path::PathBuf;

use pretty_assertions::assert_eq;

use libtreewatch::RegistrationError;

use crate::watch_test::{recording::*, session::WatchSession};

#[test]
fn removed_file_is_discarded() {
    let session = WatchSession::new();
    let file = session.write("a.txt", "a");
    session.register("docs", "");
    session.drain();

    fs_err::remove_file(&file).unwrap();
    session.removed(&file);

    assert_eq!(session.drain(), vec![discard("docs:a.txt")]);
}

#[test]
fn removed_directory_discards_everything_below() {
    let session = WatchSession::new();
    session.write("keep.txt", "keep");
    session.write("sub/a.txt", "a");
    session.write("sub/deeper/b.txt", "b");
    session.register("docs", "");
    session.drain();

    let sub = session.path("sub");
    fs_err::remove_dir_all(&sub).unwrap();
    session.removed(&sub);

    assert_eq!(
        session.drain_sorted(),
        vec![
            discard("docs:sub"),
            discard("docs:sub/a.txt"),
            discard("docs:sub/deeper"),
            discard("docs:sub/deeper/b.txt"),
        ]
    );
    assert_eq!(session.watched_paths(), vec![session.path("")]);
}

#[test]
fn replaced_file_is_a_modification() {
    let session = WatchSession::new();
    let file = session.write("a.txt", "old");
    session.register("docs", "");
    session.drain();

    fs_err::remove_file(&file).unwrap();
    session.removed(&file);
    session.write("a.txt", "new");
    session.created(&file);

    assert_eq!(session.drain(), vec![modified("docs:a.txt", "new")]);
}

#[test]
fn file_removed_after_modification_is_discarded() {
    let session = WatchSession::new();
    let file = session.write("a.txt", "old");
    session.register("docs", "");
    session.drain();

    session.write("a.txt", "new");
    session.written(&file);
    fs_err::remove_file(&file).unwrap();
    session.removed(&file);

    assert_eq!(session.drain(), vec![discard("docs:a.txt")]);
}

#[test]
fn unregistering_discards_and_stops_watching() {
    let session = WatchSession::new();
    session.write("a.txt", "a");
    session.write("sub/b.txt", "b");
    let root = session.register("docs", "");
    session.drain();

    session.engine.unregister_root(&root).unwrap();

    assert_eq!(
        session.drain_sorted(),
        vec![discard("docs:a.txt"), discard("docs:sub/b.txt")]
    );
    assert_eq!(session.watched_paths(), Vec::<PathBuf>::new());
    assert!(matches!(
        session.engine.unregister_root(&root),
        Err(RegistrationError::UnknownKey(_))
    ));

    let file = session.write("a.txt", "changed");
    session.written(&file);
    assert_eq!(session.drain(), vec![]);
}

#[test]
fn file_created_and_removed_before_delivery_is_never_reported() {
    let session = WatchSession::new();
    session.register("docs", "");
    session.drain();

    let file = session.write("tmp.txt", "short lived");
    session.created(&file);
    fs_err::remove_file(&file).unwrap();
    session.removed(&file);

    assert_eq!(session.drain(), vec![]);
}

#[test]
fn removing_an_unknown_file_is_silent() {
    let session = WatchSession::new();
    session.write("a.txt", "a");
    session.register("docs", "");
    session.drain();

    session.removed(&session.path("never-seen.txt"));

    assert_eq!(session.drain(), vec![]);
}
