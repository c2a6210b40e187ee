use std::fs;

use turnloop_core::message::{AssistantMessage, ContentBlock, Message, StopReason};
use turnloop_core::session::Session;
use turnloop_store::{SessionStore, StoreError};

fn conversation(prompt: &str) -> Session {
    let mut session = Session::new("be brief");
    session.append(Message::user(prompt));
    session.append(AssistantMessage::new(
        vec![ContentBlock::text("ok")],
        StopReason::EndTurn,
    ));
    session
}

#[test]
fn save_then_load_returns_the_same_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("sessions"));
    let session = conversation("hello");

    let path = store.save(&session).unwrap();
    assert!(path.ends_with(format!("{}.json", session.id())));
    assert_eq!(store.load(session.id()).unwrap(), session);
}

#[test]
fn save_overwrites_and_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    let mut session = conversation("hello");
    store.save(&session).unwrap();

    session.append(Message::user("again"));
    store.save(&session).unwrap();

    assert_eq!(store.load(session.id()).unwrap().len(), 3);
    let names: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec![format!("{}.json", session.id())]);
}

#[test]
fn load_missing_session() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    assert!(matches!(
        store.load("does-not-exist"),
        Err(StoreError::NotFound(id)) if id == "does-not-exist"
    ));
}

#[test]
fn list_is_newest_first_and_skips_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());

    let older = conversation("first task");
    store.save(&older).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    let newer = conversation("second task");
    store.save(&newer).unwrap();

    fs::write(dir.path().join("broken.json"), "{not json").unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
    fs::write(
        dir.path().join("future.json"),
        r#"{"version": 9, "id": "future"}"#,
    )
    .unwrap();

    let listed = store.list().unwrap();
    let ids: Vec<_> = listed.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![newer.id(), older.id()]);
    assert_eq!(listed[0].preview.as_deref(), Some("second task"));
    assert_eq!(listed[0].message_count, 2);

    assert_eq!(store.latest().unwrap().id(), newer.id());
}

#[test]
fn empty_or_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path().join("never-created"));
    assert!(store.list().unwrap().is_empty());
    assert!(matches!(store.latest(), Err(StoreError::NoSessions { .. })));
}

#[test]
fn unsupported_version_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path());
    fs::write(
        dir.path().join("s2.json"),
        r#"{"version": 2, "id": "s2", "messages": []}"#,
    )
    .unwrap();
    assert!(matches!(
        store.load("s2"),
        Err(StoreError::UnsupportedVersion { found: 2, expected: 1 })
    ));
}
