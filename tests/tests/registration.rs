use std::{sync::Arc, thread};

use pretty_assertions::assert_eq;

use libtreewatch::{DirectoryKey, RegistrationError, RootOptions};

use crate::watch_test::{recording::*, session::WatchSession};

#[test]
fn registering_reports_existing_files() {
    let session = WatchSession::new();
    session.write("a.txt", "a");
    session.write("nested/deeper/b.txt", "b");
    session.mkdir("empty");

    session.register("docs", "");

    assert_eq!(
        session.drain_sorted(),
        vec![
            modified("docs:a.txt", "a"),
            modified("docs:nested/deeper/b.txt", "b"),
        ]
    );
}

#[test]
fn every_directory_is_watched() {
    let session = WatchSession::new();
    session.write("nested/deeper/b.txt", "b");

    session.register("docs", "");

    assert_eq!(
        session.watched_paths(),
        vec![
            session.path(""),
            session.path("nested"),
            session.path("nested/deeper"),
        ]
    );
}

#[test]
fn new_files_are_reported() {
    let session = WatchSession::new();
    session.register("docs", "");
    assert_eq!(session.drain(), vec![]);

    let file = session.write("sub/new.txt", "fresh");
    session.created(&session.path("sub"));
    session.created(&file);

    assert_eq!(session.drain(), vec![modified("docs:sub/new.txt", "fresh")]);
    assert!(session.is_watched(&session.path("sub")));
}

#[test]
fn rewriting_identical_content_is_silent() {
    let session = WatchSession::new();
    let file = session.write("a.txt", "same");
    session.register("docs", "");
    session.drain();

    session.write("a.txt", "same");
    session.written(&file);

    assert_eq!(session.drain(), vec![]);
}

#[test]
fn blacklisted_files_are_never_reported() {
    let session = WatchSession::new();
    session.write("keep.txt", "keep");
    session.write("drop.tmp", "drop");
    session.write("cache/inner.txt", "inner");

    let options = RootOptions {
        blacklist: vec!["*.tmp".to_owned(), "cache/**".to_owned()],
    };
    session
        .engine
        .register_root_with("docs", session.path(""), options)
        .unwrap();

    assert_eq!(session.drain(), vec![modified("docs:keep.txt", "keep")]);

    let file = session.write("other.tmp", "nope");
    session.created(&file);
    assert_eq!(session.drain(), vec![]);
}

#[test]
fn keys_are_unique() {
    let session = WatchSession::new();
    session.mkdir("a");
    session.mkdir("b");

    session.register("docs", "a");
    let err = session
        .engine
        .register_root("docs", session.path("b"))
        .unwrap_err();

    assert!(matches!(err, RegistrationError::DuplicateKey(_)));
    assert!(!session.is_watched(&session.path("b")));
}

#[test]
fn roots_on_one_filesystem_share_a_tree() {
    let session = WatchSession::new();
    session.mkdir("a");
    session.mkdir("b");

    let a = session.register("first", "a");
    let b = session.register("second", "b");

    assert_eq!(a.fs_id(), b.fs_id());
    assert_eq!(session.engine.trees().len(), 1);
    assert_eq!(session.engine.roots().len(), 2);
}

#[test]
fn concurrent_disjoint_roots_stay_independent() {
    let session = WatchSession::new();
    session.write("left/l.txt", "l");
    session.write("right/r.txt", "r");

    thread::scope(|scope| {
        scope.spawn(|| session.register("left", "left"));
        scope.spawn(|| session.register("right", "right"));
    });

    assert_eq!(
        session.drain_sorted(),
        vec![modified("left:l.txt", "l"), modified("right:r.txt", "r")]
    );

    let trees = session.engine.trees();
    assert_eq!(trees.len(), 1);
    let left = trees[0].directory(&session.path("left")).unwrap();
    let right = trees[0].directory(&session.path("right")).unwrap();

    assert!(!Arc::ptr_eq(&left, &right));
    assert!(left.is_root() && right.is_root());
    assert_eq!(left.directory_keys(), vec![DirectoryKey::from("left")]);
    assert_eq!(right.directory_keys(), vec![DirectoryKey::from("right")]);
    assert_eq!(left.tracked_files(), vec![session.path("left/l.txt")]);
    assert_eq!(right.tracked_files(), vec![session.path("right/r.txt")]);
}

#[test]
fn concurrent_overlapping_roots_are_linearized() {
    let session = WatchSession::new();
    session.write("a/b/x.txt", "x");

    thread::scope(|scope| {
        scope.spawn(|| session.register("outer", "a"));
        scope.spawn(|| session.register("inner", "a/b"));
    });

    let seen = session.drain_sorted();
    let inner_first = vec![
        modified("inner:x.txt", "x"),
        modified("outer:b/x.txt", "x"),
        supplement("inner:x.txt", "outer:b/x.txt"),
    ];
    let outer_first = vec![
        modified("inner:x.txt", "x"),
        modified("outer:b/x.txt", "x"),
        supplement("outer:b/x.txt", "inner:x.txt"),
    ];
    assert!(
        seen == inner_first || seen == outer_first,
        "unexpected notifications: {:?}",
        seen
    );

    let trees = session.engine.trees();
    let tree = &trees[0];
    let outer = tree.directory(&session.path("a")).unwrap();
    let inner = tree.directory(&session.path("a/b")).unwrap();
    assert!(outer.is_root());
    assert_eq!(inner.parent(), Some(session.path("a")));
    assert_eq!(inner.directory_keys(), vec![DirectoryKey::from("inner")]);
    assert_eq!(
        session.watched_paths(),
        vec![session.path("a"), session.path("a/b")]
    );
}
