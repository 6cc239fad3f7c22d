use std::{thread, time::Duration};

use pretty_assertions::assert_eq;

use crate::watch_test::{
    recording::*,
    session::{WatchSession, WRITE_DEADLINE},
};

#[test]
fn burst_of_writes_is_one_modification() {
    let session = WatchSession::new();
    let file = session.write("log.txt", "0");
    session.register("docs", "");
    session.drain();

    for round in 1..=5 {
        session.write("log.txt", &round.to_string());
        session.written(&file);
        thread::sleep(WRITE_DEADLINE / 5);
    }

    assert_eq!(session.drain(), vec![modified("docs:log.txt", "5")]);
}

#[test]
fn separate_writes_are_separate_modifications() {
    let session = WatchSession::new();
    let file = session.write("log.txt", "0");
    session.register("docs", "");
    session.drain();

    session.write("log.txt", "1");
    session.written(&file);
    assert_eq!(session.drain(), vec![modified("docs:log.txt", "1")]);

    session.write("log.txt", "2");
    session.written(&file);
    assert_eq!(session.drain(), vec![modified("docs:log.txt", "2")]);
}

#[test]
fn writing_back_the_old_content_is_silent() {
    let session = WatchSession::new();
    let file = session.write("log.txt", "stable");
    session.register("docs", "");
    session.drain();

    session.write("log.txt", "intermediate");
    session.written(&file);
    thread::sleep(Duration::from_millis(5));
    session.write("log.txt", "stable");
    session.written(&file);

    assert_eq!(session.drain(), vec![]);
}
