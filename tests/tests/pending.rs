use std::{thread, time::Duration};

use pretty_assertions::assert_eq;

use crate::watch_test::{
    recording::*,
    session::{WatchSession, LOCKING_TIME},
};

#[test]
fn modifications_right_after_create_are_folded_in() {
    let session = WatchSession::new();
    session.register("docs", "");

    let file = session.write("new.txt", "first");
    session.created(&file);
    session.write("new.txt", "second");
    session.written(&file);
    session.written(&file);

    assert_eq!(session.drain(), vec![modified("docs:new.txt", "second")]);
}

#[test]
fn created_file_is_read_after_the_locking_window() {
    let session = WatchSession::new();
    session.register("docs", "");

    let file = session.write("new.txt", "partial");
    session.created(&file);
    thread::sleep(LOCKING_TIME / 2);
    session.write("new.txt", "complete");

    assert_eq!(session.drain(), vec![modified("docs:new.txt", "complete")]);
}

#[test]
fn later_modifications_are_reported_separately() {
    let session = WatchSession::new();
    session.register("docs", "");

    let file = session.write("new.txt", "one");
    session.created(&file);
    assert_eq!(session.drain(), vec![modified("docs:new.txt", "one")]);

    thread::sleep(Duration::from_millis(20));
    session.write("new.txt", "two");
    session.written(&file);

    assert_eq!(session.drain(), vec![modified("docs:new.txt", "two")]);
}
