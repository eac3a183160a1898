use super::*;
use chrono::TimeZone;
use shared::domain::MessageId;

fn message(id: &str, sender: &str, receiver: Option<&str>, body: &str) -> Message {
    Message {
        id: MessageId::from(id),
        sender: UserId::from(sender),
        receiver: receiver.map(UserId::from),
        body: body.to_string(),
        attachment: None,
        timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        deleted_by: Default::default(),
        client_id: None,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("cache.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn credentials_round_trip_and_clear() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage.load_credentials("alice").await.expect("load").is_none());

    storage
        .save_credentials(&Credentials::new("alice", "pw-1"))
        .await
        .expect("save");
    storage
        .save_credentials(&Credentials::new("alice", "pw-2"))
        .await
        .expect("overwrite");
    let loaded = storage
        .load_credentials("alice")
        .await
        .expect("load")
        .expect("present");
    assert_eq!(loaded.secret, "pw-2");

    storage.clear_credentials("alice").await.expect("clear");
    assert!(storage.load_credentials("alice").await.expect("load").is_none());
    assert!(storage.load_last_credentials().await.expect("last").is_none());
}

#[tokio::test]
async fn last_credentials_follow_most_recent_identity() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_credentials(&Credentials::new("alice", "a"))
        .await
        .expect("alice");
    storage
        .save_credentials(&Credentials::new("bob", "b"))
        .await
        .expect("bob");

    let last = storage
        .load_last_credentials()
        .await
        .expect("last")
        .expect("present");
    assert_eq!(last.username, "bob");
}

#[tokio::test]
async fn thread_snapshots_are_keyed_by_owner_and_keep_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let broadcast = ThreadId::broadcast();
    let messages = vec![
        message("m2", "bob", None, "second arrived first"),
        message("m1", "alice", None, "first"),
    ];
    storage
        .save_thread("alice", &broadcast, &messages)
        .await
        .expect("save");

    let threads = storage.load_threads("alice").await.expect("load");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].thread_id, broadcast);
    assert_eq!(threads[0].messages, messages);

    assert!(storage.load_threads("bob").await.expect("load").is_empty());
}

#[tokio::test]
async fn saving_a_thread_replaces_previous_snapshot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let thread = ThreadId::private(&UserId::from("alice"), &UserId::from("bob"));
    storage
        .save_thread(
            "alice",
            &thread,
            &[
                message("m1", "alice", Some("bob"), "one"),
                message("m2", "bob", Some("alice"), "two"),
            ],
        )
        .await
        .expect("save");
    storage
        .save_thread("alice", &thread, &[message("m2", "bob", Some("alice"), "two")])
        .await
        .expect("replace");

    let threads = storage.load_threads("alice").await.expect("load");
    assert_eq!(threads[0].messages.len(), 1);
    assert_eq!(threads[0].messages[0].id, MessageId::from("m2"));
}

#[tokio::test]
async fn save_threads_rewrites_whole_owner_snapshot() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_thread("alice", &ThreadId::from("alice_carol"), &[message("old", "carol", Some("alice"), "x")])
        .await
        .expect("seed");

    storage
        .save_threads(
            "alice",
            &[StoredThread {
                thread_id: ThreadId::broadcast(),
                messages: vec![message("m1", "alice", None, "hi")],
            }],
        )
        .await
        .expect("save all");

    let threads = storage.load_threads("alice").await.expect("load");
    assert_eq!(threads.len(), 1);
    assert!(threads[0].thread_id.is_broadcast());
}

#[tokio::test]
async fn profile_picture_and_known_peers_are_per_owner() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .save_profile_picture("alice", "data:image/png;base64,AAAA")
        .await
        .expect("picture");
    assert_eq!(
        storage.load_profile_picture("alice").await.expect("load").as_deref(),
        Some("data:image/png;base64,AAAA")
    );
    assert!(storage.load_profile_picture("bob").await.expect("load").is_none());

    assert!(storage
        .remember_peer("alice", &UserId::from("bob"))
        .await
        .expect("peer"));
    assert!(!storage
        .remember_peer("alice", &UserId::from("bob"))
        .await
        .expect("peer again"));
    storage
        .remember_peer("alice", &UserId::from("bob"))
        .await
        .expect("peer again");
    storage
        .remember_peer("alice", &UserId::from("carol"))
        .await
        .expect("peer");

    let peers = storage.list_known_peers("alice").await.expect("peers");
    assert_eq!(peers, vec![UserId::from("bob"), UserId::from("carol")]);
    assert!(storage.list_known_peers("bob").await.expect("peers").is_empty());
}
