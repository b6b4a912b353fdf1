//! HTTP API tests against a server bound to an ephemeral port.

use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use scenariosync_core::config::{AppConfig, GitConfig, MergeConfig, ServerConfig, WebConfig};
use scenariosync_core::db::Database;
use scenariosync_core::git::InMemoryRepository;
use scenariosync_core::models::GitCredential;
use scenariosync_core::{DbCredentialVault, SyncOrchestrator};
use scenariosync_web::{AppState, WebServer};

const URL: &str = "https://git.example.com/planning/scenarios.git";

// ===========================================================================
// Helpers
// ===========================================================================

struct TestServer {
    base: String,
    client: Client,
    repo: Arc<InMemoryRepository>,
}

impl TestServer {
    async fn start() -> Self {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let config = AppConfig {
            server: ServerConfig::default(),
            web: WebConfig::default(),
            git: GitConfig::for_url(URL),
            merge: MergeConfig::default(),
        };
        let repo = Arc::new(InMemoryRepository::new());
        let vault = Arc::new(DbCredentialVault::new(Arc::clone(&db)));
        vault
            .store(&GitCredential {
                user_id: "alice".into(),
                provider: "github-enterprise".into(),
                credential_type: "personal-access-token".into(),
                token: "t0ken".into(),
                repository_url: URL.into(),
                expires_at: None,
                created_at: Utc::now(),
                last_used_at: None,
            })
            .unwrap();
        let sync = Arc::new(SyncOrchestrator::new(
            Arc::clone(&db),
            repo.clone(),
            vault,
            config.git.clone(),
            &config.merge,
        ));
        let server = WebServer::new(AppState::new(config, db, sync));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(server.serve(listener, std::future::pending()));

        Self {
            base,
            client: Client::new(),
            repo,
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        user: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = self
            .client
            .request(method, format!("{}{}", self.base, path))
            .header("x-user-id", user);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.unwrap();
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        self.send(reqwest::Method::GET, path, "alice", None).await
    }

    async fn post(&self, path: &str, user: &str, body: Value) -> (StatusCode, Value) {
        self.send(reqwest::Method::POST, path, user, Some(body)).await
    }

    async fn create(&self, name: &str, parent: Option<&str>) -> String {
        let (status, body) = self
            .post(
                "/api/scenarios",
                "alice",
                json!({"name": name, "parentId": parent}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["id"].as_str().unwrap().to_string()
    }

    async fn set_allocation(&self, scenario: &str, value: i64) {
        let (status, body) = self
            .post(
                &format!("/api/scenarios/{scenario}/entities"),
                "bob",
                json!({"edits": [{
                    "op": "upsert",
                    "entityType": "assignment",
                    "entityId": "a1",
                    "fields": {"name": "Ada on Apollo", "allocation_percentage": value}
                }]}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn health_reports_version() {
    let server = TestServer::start().await;
    let (status, body) = server.get("/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn branch_edit_merge_and_history() {
    let server = TestServer::start().await;
    let root = server.create("Baseline", None).await;
    server.set_allocation(&root, 50).await;
    let child = server.create("Hiring plan", Some(&root)).await;

    let (status, body) = server.get(&format!("/api/scenarios/{child}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scenario_type"], json!("what-if"));
    assert_eq!(body["created_by"], json!("alice"));
    assert!(body["branch"]["branch_name"]
        .as_str()
        .unwrap()
        .starts_with("scenario/hiring-plan-"));

    let (_, ancestors) = server.get(&format!("/api/scenarios/{child}/ancestors")).await;
    assert_eq!(ancestors[0]["id"], json!(root));

    server.set_allocation(&child, 80).await;
    let (status, diff) = server
        .get(&format!("/api/scenarios/{root}/compare/{child}"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(diff["entries"].as_array().unwrap().len(), 1);

    let (status, merge) = server
        .post(&format!("/api/scenarios/{child}/merge"), "bob", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK, "{merge}");
    assert_eq!(merge["committed"], json!(true));
    assert_eq!(merge["operation"]["user_id"], json!("bob"));

    let (_, entities) = server
        .get(&format!("/api/scenarios/{root}/entities?entityType=assignment"))
        .await;
    assert_eq!(entities["count"], json!(1));
    assert_eq!(
        entities["entities"][0]["fields"]["allocation_percentage"],
        json!(80)
    );

    let (status, page) = server
        .get("/api/history?entityType=assignment&entityId=a1&limit=1")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert!(page["items"][0]["message"]
        .as_str()
        .unwrap()
        .starts_with("Merge scenario 'Hiring plan'"));
    let cursor = page["next_cursor"].as_str().unwrap().to_string();
    let (_, older) = server
        .get(&format!(
            "/api/history?entityType=assignment&entityId=a1&limit=10&cursor={cursor}"
        ))
        .await;
    assert_eq!(older["items"].as_array().unwrap().len(), 2);
    assert!(older["next_cursor"].is_null());
}

#[tokio::test]
async fn conflicting_merge_waits_for_resolution() {
    let server = TestServer::start().await;
    let root = server.create("Baseline", None).await;
    server.set_allocation(&root, 50).await;
    let child = server.create("B", Some(&root)).await;
    server.set_allocation(&child, 60).await;
    server.set_allocation(&root, 70).await;

    let (status, merge) = server
        .post(&format!("/api/scenarios/{child}/merge"), "bob", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(merge["committed"], json!(false));
    assert_eq!(merge["operation"]["status"], json!("conflict"));
    let op = merge["operation"]["id"].as_str().unwrap().to_string();
    let conflict = merge["conflicts"][0]["id"].as_str().unwrap().to_string();

    let (status, _) = server
        .post(&format!("/api/merges/{op}/retry"), "bob", json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = server
        .post(
            &format!("/api/conflicts/{conflict}/resolve"),
            "carol",
            json!({"strategy": "take_both"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, resolved) = server
        .post(
            &format!("/api/conflicts/{conflict}/resolve"),
            "carol",
            json!({"strategy": "custom", "customValue": 65}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["resolution_status"], json!("resolved"));
    assert_eq!(resolved["resolved_by"], json!("carol"));

    let (_, listed) = server
        .get(&format!("/api/conflicts?syncOperationId={op}"))
        .await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, retried) = server
        .post(&format!("/api/merges/{op}/retry"), "bob", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["committed"], json!(true));
}

#[tokio::test]
async fn error_statuses() {
    let server = TestServer::start().await;
    let root = server.create("Baseline", None).await;
    server.create("child", Some(&root)).await;

    let (status, body) = server.get("/api/scenarios/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = server
        .post(&format!("/api/scenarios/{root}/archive"), "alice", json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = server
        .post(
            &format!("/api/scenarios/{root}/import"),
            "alice",
            json!({"schemaVersion": 2, "data": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = server
        .post("/api/sync/pull", "mallory", json!({"scenarioId": root}))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(server.repo.network_calls(), 0);

    let (status, _) = server.get("/api/conflicts").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn push_publishes_the_scenario() {
    let server = TestServer::start().await;
    let root = server.create("Baseline", None).await;
    server.set_allocation(&root, 50).await;

    let (status, body) = server
        .post("/api/sync/push", "alice", json!({"scenarioId": root}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["operation"]["status"], json!("completed"));
    assert!(server.repo.head("main").is_some());

    let op = body["operation"]["id"].as_str().unwrap();
    let (status, fetched) = server.get(&format!("/api/sync/operations/{op}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["operation"]["operation_type"], json!("push"));

    let (status, export) = server.get(&format!("/api/scenarios/{root}/export")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["schemaVersion"], json!(1));
    assert_eq!(export["exportedBy"], json!("alice"));
}
