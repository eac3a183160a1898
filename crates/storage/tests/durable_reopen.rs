use chrono::Utc;
use shared::domain::{Credentials, Message, MessageId, ThreadId, UserId};
use storage::Storage;

#[tokio::test]
async fn cached_state_survives_reopening_the_database_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        dir.path().join("offline.db").to_string_lossy().replace('\\', "/")
    );

    let message = Message {
        id: MessageId::from("m1"),
        sender: UserId::from("alice"),
        receiver: None,
        body: "kept across restarts".into(),
        attachment: None,
        timestamp: Utc::now(),
        deleted_by: Default::default(),
        client_id: None,
    };

    {
        let storage = Storage::new(&database_url).await.expect("first open");
        storage
            .save_credentials(&Credentials::new("alice", "secret"))
            .await
            .expect("credentials");
        storage
            .save_thread("alice", &ThreadId::broadcast(), std::slice::from_ref(&message))
            .await
            .expect("thread");
        storage.pool().close().await;
    }

    let reopened = Storage::new(&database_url).await.expect("second open");
    let credentials = reopened
        .load_last_credentials()
        .await
        .expect("load")
        .expect("remembered");
    assert_eq!(credentials.username, "alice");

    let threads = reopened.load_threads("alice").await.expect("threads");
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].messages, vec![message]);
}
