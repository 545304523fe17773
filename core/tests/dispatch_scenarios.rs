//! End-to-end cycles: engine + HTTP adapter + SQLite against a local mock
//! provider.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use chatlist_core::adapter::{ErrorKind, HttpAdapter};
use chatlist_core::config::AppConfig;
use chatlist_core::db::{init_db, DbPool};
use chatlist_core::engine::{DispatchEngine, RowStatus};
use chatlist_core::registry::{ModelRegistry, NewModel, StaticCredentials};
use chatlist_core::settings::{self, EngineSettings, KEY_REQUEST_TIMEOUT};

async fn chat_completions(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if headers.get("authorization").is_none() {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing key" })));
    }
    let model = body["model"].as_str().unwrap_or_default();
    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({ "choices": [{ "message": { "content": format!("{model} on {prompt}") } }] })),
    )
}

async fn ollama_chat(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let auth = if headers.contains_key("authorization") { "keyed" } else { "keyless" };
    assert_eq!(body["stream"], false);
    Json(json!({ "message": { "role": "assistant", "content": format!("local {auth}") } }))
}

async fn flat_text() -> Json<Value> {
    Json(json!({ "text": "plain text answer" }))
}

async fn broken() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded")
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json(json!({ "text": "too late" }))
}

async fn serve() -> String {
    let app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/ollama/api/chat", post(ollama_chat))
        .route("/flat", post(flat_text))
        .route("/broken", post(broken))
        .route("/slow", post(slow));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

struct Harness {
    _dir: tempfile::TempDir,
    pool: DbPool,
    engine: DispatchEngine,
    base: String,
}

impl Harness {
    async fn new() -> Self {
        let base = serve().await;
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().to_path_buf(), "e2e.db").unwrap();
        let registry = ModelRegistry::new(
            pool.clone(),
            Arc::new(StaticCredentials::default().with("MOCK_KEY", "sk-test")),
        );
        let engine = DispatchEngine::new(
            pool.clone(),
            registry,
            Arc::new(HttpAdapter::new().unwrap()),
            EngineSettings::from_config(&AppConfig::default()),
        )
        .unwrap();
        Self {
            _dir: dir,
            pool,
            engine,
            base,
        }
    }

    fn add(&self, name: &str, path: &str, credential_ref: &str) {
        self.engine
            .registry()
            .create_model(NewModel {
                name: name.into(),
                api_url: format!("{}{path}", self.base),
                credential_ref: credential_ref.into(),
                is_active: true,
            })
            .unwrap();
    }
}

#[tokio::test]
async fn three_providers_answer_and_are_saved_together() {
    let h = Harness::new().await;
    h.add("gpt-mock", "/v1/chat/completions", "MOCK_KEY");
    h.add("llama-local", "/ollama/api/chat", "MOCK_KEY");
    h.add("plain", "/flat", "MOCK_KEY");

    let progress = h.engine.submit("what is a lifetime?").unwrap().wait().await;
    assert_eq!((progress.total, progress.succeeded), (3, 3));

    let snap = h.engine.snapshot();
    assert_eq!(snap.row("gpt-mock").unwrap().response_text, "gpt-mock on what is a lifetime?");
    assert_eq!(snap.row("llama-local").unwrap().response_text, "local keyless");
    assert_eq!(snap.row("plain").unwrap().response_text, "plain text answer");

    let prompt_id = h.engine.save(Some("x")).unwrap();
    let gateway = h.engine.gateway();
    assert_eq!(gateway.list_prompts().unwrap().len(), 1);
    let saved = gateway.results_for_prompt(prompt_id).unwrap();
    assert_eq!(saved.len(), 3);
    assert!(h.engine.snapshot().rows.is_empty());
}

#[tokio::test]
async fn each_row_fails_on_its_own_terms() {
    let h = Harness::new().await;
    settings::set(&h.pool.get().unwrap(), KEY_REQUEST_TIMEOUT, "1").unwrap();
    h.add("fine", "/v1/chat/completions", "MOCK_KEY");
    h.add("broken", "/broken", "MOCK_KEY");
    h.add("slow", "/slow", "MOCK_KEY");
    h.add("keyless", "/v1/chat/completions", "NOT_CONFIGURED");

    let started = std::time::Instant::now();
    let progress = h.engine.submit("status?").unwrap().wait().await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!((progress.succeeded, progress.failed), (1, 3));

    let snap = h.engine.snapshot();
    assert_eq!(snap.row("fine").unwrap().status, RowStatus::Success);
    let broken = snap.row("broken").unwrap();
    assert_eq!(broken.error_kind, Some(ErrorKind::HttpStatus(500)));
    assert!(broken.response_text.contains("upstream exploded"));
    assert_eq!(snap.row("slow").unwrap().error_kind, Some(ErrorKind::Timeout));
    assert_eq!(snap.row("keyless").unwrap().error_kind, Some(ErrorKind::Network));

    let id = h.engine.save(None).unwrap();
    assert_eq!(h.engine.gateway().results_for_prompt(id).unwrap().len(), 1);
}

#[tokio::test]
async fn dispatch_outcomes_reach_the_event_log() {
    let h = Harness::new().await;
    h.add("fine", "/v1/chat/completions", "MOCK_KEY");
    h.add("broken", "/broken", "MOCK_KEY");
    h.engine.submit("log me").unwrap().wait().await;

    let codes = |pool: &DbPool| -> Vec<String> {
        let conn = pool.get().unwrap();
        let mut stmt = conn
            .prepare("SELECT code FROM event_log WHERE module = 'dispatch' ORDER BY code")
            .unwrap();
        let rows = stmt.query_map([], |r| r.get::<_, String>(0)).unwrap();
        let found: Vec<String> = rows.map(Result::unwrap).collect();
        found
    };
    let mut found = codes(&h.pool);
    for _ in 0..50 {
        if found.len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        found = codes(&h.pool);
    }
    assert_eq!(found, vec!["DSP-0100", "DSP-0200", "DSP-0201"]);
}
