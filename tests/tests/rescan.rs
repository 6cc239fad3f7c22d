use pretty_assertions::assert_eq;

use crate::watch_test::{recording::*, session::WatchSession};

#[test]
fn lost_events_are_made_up_by_a_rescan() {
    let session = WatchSession::new();
    session.write("same.txt", "same");
    session.write("edited.txt", "before");
    let gone = session.write("gone.txt", "gone");
    session.write("sub/old/deep.txt", "deep");
    session.register("docs", "");
    session.drain();

    session.write("edited.txt", "after");
    session.write("added.txt", "added");
    fs_err::remove_file(&gone).unwrap();
    fs_err::remove_dir_all(session.path("sub/old")).unwrap();

    session.rescan_required();

    assert_eq!(
        session.drain_sorted(),
        vec![
            modified("docs:added.txt", "added"),
            modified("docs:edited.txt", "after"),
            discard("docs:gone.txt"),
            discard("docs:sub/old"),
            discard("docs:sub/old/deep.txt"),
        ]
    );
    assert!(session.is_watched(&session.path("sub")));
    assert!(!session.is_watched(&session.path("sub/old")));
}

#[test]
fn rescan_of_an_unchanged_tree_is_silent() {
    let session = WatchSession::new();
    session.write("a.txt", "a");
    session.write("sub/b.txt", "b");
    session.register("docs", "");
    session.drain();

    session.rescan_required();

    assert_eq!(session.drain(), vec![]);
}
