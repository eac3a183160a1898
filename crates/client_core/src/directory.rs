use anyhow::{Context, Result};
use serde::Deserialize;
use shared::domain::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    #[serde(alias = "id")]
    pub username: UserId,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

/// Lists every registered user, online or not, from `GET {server}/users`.
pub async fn fetch_user_directory(
    http: &reqwest::Client,
    server_url: &str,
) -> Result<Vec<DirectoryEntry>> {
    let url = format!("{}/users", server_url.trim_end_matches('/'));
    http.get(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach user directory at {url}"))?
        .error_for_status()?
        .json::<Vec<DirectoryEntry>>()
        .await
        .context("invalid user directory response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn fetches_and_decodes_directory() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = Router::new().route(
            "/users",
            get(|| async {
                Json(serde_json::json!([
                    {"username": "alice", "profilePicture": "data:image/png;base64,AA=="},
                    {"id": "bob"}
                ]))
            }),
        );
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let entries = fetch_user_directory(&reqwest::Client::new(), &format!("http://{addr}/"))
            .await
            .expect("directory");

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].username, UserId::from("alice"));
        assert!(entries[0].profile_picture.is_some());
        assert_eq!(entries[1].username, UserId::from("bob"));
        assert_eq!(entries[1].profile_picture, None);
    }
}
