use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use libtreewatch::{RegistrationError, RelocationObserver, WatchedRoot};

use crate::watch_test::{recording::*, session::WatchSession};

#[derive(Default)]
struct Moves {
    seen: Mutex<Vec<(String, PathBuf, PathBuf)>>,
}

impl RelocationObserver for Moves {
    fn destination_changed(&self, root: &WatchedRoot, previous: &Path) {
        self.seen.lock().push((
            root.key().to_string(),
            previous.to_path_buf(),
            root.path(),
        ));
    }
}

#[test]
fn relocation_reports_only_differences() {
    let session = WatchSession::new();
    session.write("old/same.txt", "same");
    session.write("old/changed.txt", "before");
    session.write("old/gone.txt", "gone");
    session.write("new/same.txt", "same");
    session.write("new/changed.txt", "after");
    session.write("new/added.txt", "added");

    let root = session.register("docs", "old");
    session.drain();

    session.engine.relocate(&root, session.path("new")).unwrap();

    assert_eq!(
        session.drain_sorted(),
        vec![
            modified("docs:added.txt", "added"),
            modified("docs:changed.txt", "after"),
            discard("docs:gone.txt"),
        ]
    );
    assert_eq!(root.path(), session.path("new"));
    assert_eq!(session.watched_paths(), vec![session.path("new")]);
}

#[test]
fn observers_learn_about_relocation() {
    let session = WatchSession::new();
    session.mkdir("old");
    session.mkdir("new");
    let root = session.register("docs", "old");
    let moves = Arc::new(Moves::default());
    root.add_relocation_observer(moves.clone());

    session.engine.relocate(&root, session.path("new")).unwrap();

    assert_eq!(
        *moves.seen.lock(),
        vec![(
            "docs".to_owned(),
            session.path("old"),
            session.path("new")
        )]
    );
}

#[test]
fn relocating_to_a_missing_directory_keeps_the_root() {
    let session = WatchSession::new();
    let file = session.write("old/a.txt", "a");
    let root = session.register("docs", "old");
    let moves = Arc::new(Moves::default());
    root.add_relocation_observer(moves.clone());
    session.drain();

    let err = session
        .engine
        .relocate(&root, session.path("missing"))
        .unwrap_err();

    assert!(matches!(err, RegistrationError::NotADirectory(_)));
    assert_eq!(root.path(), session.path("old"));
    assert!(moves.seen.lock().is_empty());

    session.write("old/a.txt", "changed");
    session.written(&file);
    assert_eq!(session.drain(), vec![modified("docs:a.txt", "changed")]);
}

#[test]
fn relocated_root_follows_the_new_location() {
    let session = WatchSession::new();
    session.write("old/a.txt", "a");
    let moved = session.write("new/a.txt", "a");
    let root = session.register("docs", "old");
    session.engine.relocate(&root, session.path("new")).unwrap();
    session.drain();

    session.write("new/a.txt", "moved");
    session.written(&moved);
    assert_eq!(session.drain(), vec![modified("docs:a.txt", "moved")]);

    session.engine.unregister_root(&root).unwrap();
    assert_eq!(session.drain(), vec![discard("docs:a.txt")]);
}
