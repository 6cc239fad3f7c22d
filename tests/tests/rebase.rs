use pretty_assertions::assert_eq;

use libtreewatch::RootOptions;

use crate::watch_test::{recording::*, session::WatchSession};

#[test]
fn enclosing_root_supplements_known_files() {
    let session = WatchSession::new();
    session.write("project/src/main.txt", "main");
    session.register("src", "project/src");
    assert_eq!(session.drain(), vec![modified("src:main.txt", "main")]);

    session.register("project", "project");

    assert_eq!(
        session.drain(),
        vec![
            supplement("src:main.txt", "project:src/main.txt"),
            modified("project:src/main.txt", "main"),
        ]
    );
}

#[test]
fn enclosing_root_reports_files_outside_known_roots() {
    let session = WatchSession::new();
    session.write("project/src/main.txt", "main");
    session.write("project/README.txt", "readme");
    session.register("src", "project/src");
    session.drain();

    session.register("project", "project");

    assert_eq!(
        session.drain_sorted(),
        vec![
            modified("project:README.txt", "readme"),
            modified("project:src/main.txt", "main"),
            supplement("src:main.txt", "project:src/main.txt"),
        ]
    );
}

#[test]
fn directories_between_roots_are_watched_after_rebase() {
    let session = WatchSession::new();
    session.write("project/a/b/c/deep.txt", "deep");
    session.register("deep", "project/a/b/c");
    assert_eq!(session.watched_paths(), vec![session.path("project/a/b/c")]);

    session.register("project", "project");

    assert_eq!(
        session.watched_paths(),
        vec![
            session.path("project"),
            session.path("project/a"),
            session.path("project/a/b"),
            session.path("project/a/b/c"),
        ]
    );
}

#[test]
fn changes_reach_every_enclosing_key() {
    let session = WatchSession::new();
    let file = session.write("project/src/main.txt", "main");
    session.register("project", "project");
    session.register("src", "project/src");
    session.drain();

    session.write("project/src/main.txt", "changed");
    session.written(&file);

    assert_eq!(
        session.drain_sorted(),
        vec![
            modified("project:src/main.txt", "changed"),
            modified("src:main.txt", "changed"),
        ]
    );
}

#[test]
fn registering_inside_a_watched_tree_adds_no_watch() {
    let session = WatchSession::new();
    session.write("project/src/main.txt", "main");
    session.register("project", "project");
    let before = session.watched_paths();
    session.drain();

    session.register("src", "project/src");

    assert_eq!(session.watched_paths(), before);
    assert_eq!(
        session.drain(),
        vec![
            supplement("project:src/main.txt", "src:main.txt"),
            modified("src:main.txt", "main"),
        ]
    );
}

#[test]
fn unregistering_the_outer_root_keeps_the_inner_one() {
    let session = WatchSession::new();
    session.write("project/README.txt", "readme");
    let file = session.write("project/src/main.txt", "main");
    let outer = session.register("project", "project");
    session.register("src", "project/src");
    session.drain();

    session.engine.unregister_root(&outer).unwrap();

    assert_eq!(
        session.drain_sorted(),
        vec![
            discard("project:README.txt"),
            discard("project:src/main.txt"),
        ]
    );
    assert_eq!(session.watched_paths(), vec![session.path("project/src")]);

    session.write("project/src/main.txt", "changed");
    session.written(&file);
    assert_eq!(session.drain(), vec![modified("src:main.txt", "changed")]);
}

#[test]
fn registering_again_reports_files_the_enclosing_root_hides() {
    let session = WatchSession::new();
    session.write("project/src/main.txt", "main");
    let options = RootOptions {
        blacklist: vec!["src/**".to_owned()],
    };
    session
        .engine
        .register_root_with("project", session.path("project"), options)
        .unwrap();
    let src = session.register("src", "project/src");
    assert_eq!(session.drain(), vec![modified("src:main.txt", "main")]);

    session.engine.unregister_root(&src).unwrap();
    assert_eq!(session.drain(), vec![discard("src:main.txt")]);

    session.register("src", "project/src");
    assert_eq!(session.drain(), vec![modified("src:main.txt", "main")]);
}
