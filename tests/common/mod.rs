//! Common test utilities for E2E tests

#![allow(dead_code)]

use serde_json::{Value, json};
use std::sync::Once;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use versus::auth::USER_HEADER;
use versus::{AppState, config};

static METRICS: Once = Once::new();

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after adjusting the default test configuration
    pub async fn with_config(customize: impl FnOnce(&mut config::AppConfig)) -> Self {
        METRICS.call_once(versus::metrics::init_metrics);

        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let mut config = config::AppConfig::for_database(temp_dir.path().join("test.db"));
        customize(&mut config);

        // Initialize app state
        let state = AppState::new(config).await.unwrap();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        // Bind to random port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = versus::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: addr_str,
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn get(&self, user: &str, path: &str) -> reqwest::RequestBuilder {
        self.client.get(self.url(path)).header(USER_HEADER, user)
    }

    pub fn post(&self, user: &str, path: &str) -> reqwest::RequestBuilder {
        self.client.post(self.url(path)).header(USER_HEADER, user)
    }

    pub fn put(&self, user: &str, path: &str) -> reqwest::RequestBuilder {
        self.client.put(self.url(path)).header(USER_HEADER, user)
    }

    pub fn delete(&self, user: &str, path: &str) -> reqwest::RequestBuilder {
        self.client.delete(self.url(path)).header(USER_HEADER, user)
    }

    /// Create a club owned by `owner` and return its id
    pub async fn create_club(&self, owner: &str, name: &str) -> String {
        let response = self
            .post(owner, "/api/v1/clubs")
            .json(&json!({ "name": name }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);

        let club: Value = response.json().await.unwrap();
        club["id"].as_str().unwrap().to_string()
    }

    pub async fn join_club(&self, user: &str, club_id: &str) {
        let response = self
            .post(user, &format!("/api/v1/clubs/{club_id}/join"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    /// Get or create the DM conversation between two users
    pub async fn direct_conversation(&self, user: &str, other: &str) -> String {
        let response = self
            .post(user, "/api/v1/direct_conversations")
            .json(&json!({ "participant_id": other }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);

        let conversation: Value = response.json().await.unwrap();
        conversation["id"].as_str().unwrap().to_string()
    }

    /// Send a message and return the created message JSON
    pub async fn send(&self, user: &str, kind: &str, id: &str, text: &str) -> Value {
        let response = self
            .post(user, &format!("/api/v1/conversations/{kind}/{id}/messages"))
            .json(&json!({ "text": text }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        response.json().await.unwrap()
    }

    /// Current unread snapshot; opens the user's session on first call
    pub async fn unread(&self, user: &str) -> Value {
        let response = self.get(user, "/api/v1/unread").send().await.unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    pub async fn mark_read(&self, user: &str, kind: &str, id: &str) -> Value {
        let response = self
            .post(user, &format!("/api/v1/unread/{kind}/{id}/read"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    /// Poll the unread snapshot until `condition` holds
    pub async fn wait_for_unread(&self, user: &str, condition: impl Fn(&Value) -> bool) -> Value {
        for _ in 0..100 {
            let snapshot = self.unread(user).await;
            if condition(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("unread snapshot for {user} never reached the expected state");
    }
}

/// Whether a JSON id array contains `id`
pub fn contains_id(ids: &Value, id: &str) -> bool {
    ids.as_array()
        .is_some_and(|ids| ids.iter().any(|value| value.as_str() == Some(id)))
}
