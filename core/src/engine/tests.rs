use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::*;
use crate::config::AppConfig;
use crate::db::init_db;
use crate::registry::{NewModel, StaticCredentials};
use crate::settings;

#[derive(Clone)]
enum Behaviour {
    Echo,
    Fail(ErrorKind),
    Hang,
    Sleep(Duration),
    /// Block prompts starting with the prefix until the gate opens.
    GatedOn(&'static str, Arc<Semaphore>),
}

#[derive(Default)]
struct ScriptedClient {
    behaviours: HashMap<String, Behaviour>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    fn with(mut self, model: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(model.to_string(), behaviour);
        self
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn call(
        &self,
        target: &CallTarget,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let name = target.model.name.as_str();
        let behaviour = self
            .behaviours
            .get(name)
            .cloned()
            .unwrap_or(Behaviour::Echo);
        match behaviour {
            Behaviour::Echo => {
                tokio::task::yield_now().await;
                Ok(format!("{name}: {prompt}"))
            }
            Behaviour::Fail(kind) => Err(CallError::new(kind, format!("{kind} failure"))),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("never".into())
            }
            Behaviour::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(format!("{name}: {prompt}"))
            }
            Behaviour::GatedOn(prefix, gate) => {
                if prompt.starts_with(prefix) {
                    let _ = gate.acquire().await;
                }
                Ok(format!("{name}: {prompt}"))
            }
        }
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    pool: DbPool,
    engine: DispatchEngine,
    client: Arc<ScriptedClient>,
}

fn fixture(models: &[&str], client: ScriptedClient) -> Fixture {
    fixture_with_creds(models, StaticCredentials::default().with("TEST_KEY", "secret"), client)
}

fn fixture_with_creds(models: &[&str], creds: StaticCredentials, client: ScriptedClient) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_db(dir.path().to_path_buf(), "engine.db").unwrap();
    let registry = ModelRegistry::new(pool.clone(), Arc::new(creds));
    for name in models {
        add_model(&registry, name, "TEST_KEY");
    }
    let client = Arc::new(client);
    let engine = DispatchEngine::new(
        pool.clone(),
        registry,
        client.clone(),
        EngineSettings::from_config(&AppConfig::default()),
    )
    .unwrap();
    Fixture {
        _dir: dir,
        pool,
        engine,
        client,
    }
}

fn add_model(registry: &ModelRegistry, name: &str, credential_ref: &str) {
    registry
        .create_model(NewModel {
            name: name.to_string(),
            api_url: format!("https://{name}.example.com/v1/chat/completions"),
            credential_ref: credential_ref.to_string(),
            is_active: true,
        })
        .unwrap();
}

fn count(pool: &DbPool, table: &str) -> i64 {
    let conn = pool.get().unwrap();
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
        .unwrap()
}

#[tokio::test]
async fn three_models_succeed_and_save_everything() {
    let fx = fixture(&["alpha", "beta", "gamma"], ScriptedClient::default());
    let handle = fx.engine.submit("Explain ownership").unwrap();
    assert_eq!(handle.models(), ["alpha", "beta", "gamma"]);

    let progress = handle.wait().await;
    assert_eq!((progress.total, progress.succeeded, progress.failed), (3, 3, 0));

    let snap = fx.engine.snapshot();
    assert_eq!(snap.prompt.as_deref(), Some("Explain ownership"));
    assert_eq!(snap.rows.len(), 3);
    for row in &snap.rows {
        assert_eq!(row.status, RowStatus::Success);
        assert!(row.selected);
        assert_eq!(row.response_text, format!("{}: Explain ownership", row.model_name));
    }

    let prompt_id = fx.engine.save(Some("x")).unwrap();
    assert_eq!(count(&fx.pool, "prompts"), 1);
    assert_eq!(count(&fx.pool, "results"), 3);
    let stored = fx.engine.gateway().get_prompt(prompt_id).unwrap().unwrap();
    assert_eq!(stored.tags.as_deref(), Some("x"));
    assert!(fx.engine.snapshot().rows.is_empty());
}

#[tokio::test]
async fn row_set_is_fixed_at_submit_time() {
    let gate = Arc::new(Semaphore::new(0));
    let client = ScriptedClient::default()
        .with("alpha", Behaviour::GatedOn("", gate.clone()))
        .with("beta", Behaviour::GatedOn("", gate.clone()));
    let fx = fixture(&["alpha", "beta"], client);

    let handle = fx.engine.submit("hello").unwrap();
    tokio::task::yield_now().await;

    fx.engine.registry().set_active("alpha", false).unwrap();
    add_model(fx.engine.registry(), "gamma", "TEST_KEY");
    assert_eq!(fx.engine.snapshot().rows.len(), 2);

    gate.add_permits(1);
    handle.wait().await;
    let names: Vec<_> = fx
        .engine
        .snapshot()
        .rows
        .into_iter()
        .map(|r| r.model_name)
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn missing_credential_fails_only_its_row() {
    let fx = fixture(&["keyed"], ScriptedClient::default());
    add_model(fx.engine.registry(), "unkeyed", "ABSENT_KEY");

    let progress = fx.engine.submit("hi").unwrap().wait().await;
    assert_eq!((progress.succeeded, progress.failed), (1, 1));

    let snap = fx.engine.snapshot();
    let bad = snap.row("unkeyed").unwrap();
    assert_eq!(bad.status, RowStatus::Error);
    assert_eq!(bad.error_kind, Some(ErrorKind::Network));
    assert!(bad.response_text.contains("ABSENT_KEY"));
    assert_eq!(snap.row("keyed").unwrap().status, RowStatus::Success);
    assert_eq!(fx.client.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn hanging_call_times_out_at_thirty_seconds_not_earlier() {
    let fx = fixture(&["sloth"], ScriptedClient::default().with("sloth", Behaviour::Hang));
    let started = tokio::time::Instant::now();
    let handle = fx.engine.submit("anyone there?").unwrap();

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(fx.engine.snapshot().rows[0].status, RowStatus::Pending);

    handle.wait().await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    let row = fx.engine.snapshot().rows[0].clone();
    assert_eq!(row.status, RowStatus::Error);
    assert_eq!(row.error_kind, Some(ErrorKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn timeout_comes_from_settings() {
    let fx = fixture(&["sloth"], ScriptedClient::default().with("sloth", Behaviour::Hang));
    settings::set(&fx.pool.get().unwrap(), settings::KEY_REQUEST_TIMEOUT, "5").unwrap();
    let started = tokio::time::Instant::now();
    fx.engine.submit("quick?").unwrap().wait().await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(30));
}

#[tokio::test]
async fn superseded_cycle_never_leaks_into_new_table() {
    let gate = Arc::new(Semaphore::new(0));
    let client = ScriptedClient::default().with("m", Behaviour::GatedOn("A", gate.clone()));
    let fx = fixture(&["m"], client);

    let first = fx.engine.submit("A: first").unwrap();
    let first_cycle = first.cycle();
    tokio::task::yield_now().await;
    let second = fx.engine.submit("B: second").unwrap();

    assert!(first.wait().await.superseded);
    let progress = second.wait().await;
    assert!(progress.is_complete() && !progress.superseded);

    gate.add_permits(1);
    tokio::task::yield_now().await;
    fx.engine.shared.complete(first_cycle, "m", Ok("stale answer".into()));

    let snap = fx.engine.snapshot();
    assert_eq!(snap.rows.len(), 1);
    assert_eq!(snap.rows[0].response_text, "m: B: second");
}

#[tokio::test]
async fn terminal_rows_do_not_regress() {
    let fx = fixture(&["m"], ScriptedClient::default());
    let mut events = fx.engine.subscribe();
    let handle = fx.engine.submit("hi").unwrap();
    let cycle = handle.cycle();
    handle.wait().await;

    fx.engine.shared.complete(
        cycle,
        "m",
        Err(CallError::new(ErrorKind::Network, "late failure")),
    );
    let row = fx.engine.snapshot().rows[0].clone();
    assert_eq!(row.status, RowStatus::Success);

    assert_eq!(
        events.recv().await.unwrap(),
        RowEvent::CycleStarted {
            cycle,
            models: vec!["m".into()]
        }
    );
    match events.recv().await.unwrap() {
        RowEvent::RowUpdated { row, .. } => assert!(row.status.is_terminal()),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn rejected_submits_leave_table_untouched() {
    let fx = fixture(&["m"], ScriptedClient::default());
    fx.engine.submit("first").unwrap().wait().await;
    let before = fx.engine.snapshot();

    assert_eq!(fx.engine.submit("   ").unwrap_err(), ChatListError::EmptyPrompt);
    fx.engine.registry().set_active("m", false).unwrap();
    assert_eq!(
        fx.engine.submit("second").unwrap_err(),
        ChatListError::NoActiveModels
    );
    assert_eq!(fx.engine.snapshot(), before);
}

#[tokio::test]
async fn mixed_outcomes_save_only_successes() {
    let client = ScriptedClient::default().with("broken", Behaviour::Fail(ErrorKind::HttpStatus(500)));
    let fx = fixture(&["broken", "fine"], client);
    let progress = fx.engine.submit("go").unwrap().wait().await;
    assert!(progress.is_complete());
    assert_eq!(progress.failed, 1);

    let snap = fx.engine.snapshot();
    let broken = snap.row("broken").unwrap();
    assert_eq!(broken.error_kind, Some(ErrorKind::HttpStatus(500)));
    assert!(!broken.selected);

    let id = fx.engine.save(None).unwrap();
    let saved = fx.engine.gateway().results_for_prompt(id).unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].model_name, "fine");
}

#[tokio::test]
async fn save_rules() {
    let gate = Arc::new(Semaphore::new(0));
    let client = ScriptedClient::default()
        .with("slow", Behaviour::GatedOn("", gate.clone()))
        .with("broken", Behaviour::Fail(ErrorKind::MalformedResponse));
    let fx = fixture(&["slow", "broken"], client);

    assert_eq!(fx.engine.save(None), Err(ChatListError::NothingSelected));

    let handle = fx.engine.submit("p").unwrap();
    tokio::task::yield_now().await;
    assert_eq!(fx.engine.save(None), Err(ChatListError::SaveWhilePending));

    gate.add_permits(1);
    handle.wait().await;
    assert_eq!(
        fx.engine.set_selected("broken", true),
        Err(ChatListError::RowNotSelectable("broken".into()))
    );
    fx.engine.set_selected("slow", false).unwrap();
    assert_eq!(fx.engine.save(None), Err(ChatListError::NothingSelected));
    assert_eq!(count(&fx.pool, "prompts"), 0);
}

#[tokio::test]
async fn failed_save_keeps_table_for_retry() {
    let fx = fixture(&["a", "b"], ScriptedClient::default());
    fx.engine.submit("keep me").unwrap().wait().await;
    fx.pool
        .get()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_b BEFORE INSERT ON results WHEN NEW.model_name = 'b'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    let before = fx.engine.snapshot();
    let err = fx.engine.save(Some("t")).unwrap_err();
    assert!(matches!(err, ChatListError::Persistence(_)));
    assert_eq!(count(&fx.pool, "prompts"), 0);
    assert_eq!(count(&fx.pool, "results"), 0);
    assert_eq!(fx.engine.snapshot(), before);

    fx.pool
        .get()
        .unwrap()
        .execute_batch("DROP TRIGGER reject_b;")
        .unwrap();
    fx.engine.save(Some("t")).unwrap();
    assert_eq!(count(&fx.pool, "results"), 2);
}

#[tokio::test]
async fn clear_abandons_in_flight_calls() {
    let gate = Arc::new(Semaphore::new(0));
    let fx = fixture(&["m"], ScriptedClient::default().with("m", Behaviour::GatedOn("", gate.clone())));
    let handle = fx.engine.submit("p").unwrap();
    tokio::task::yield_now().await;

    fx.engine.clear();
    assert!(handle.wait().await.superseded);
    gate.add_permits(1);
    tokio::task::yield_now().await;

    let snap = fx.engine.snapshot();
    assert!(snap.rows.is_empty());
    assert!(snap.prompt.is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrency_is_capped_by_settings() {
    let client = ScriptedClient::default()
        .with("a", Behaviour::Sleep(Duration::from_millis(50)))
        .with("b", Behaviour::Sleep(Duration::from_millis(50)))
        .with("c", Behaviour::Sleep(Duration::from_millis(50)));
    let fx = fixture(&["a", "b", "c"], client);
    settings::set(&fx.pool.get().unwrap(), settings::KEY_MAX_CONCURRENCY, "1").unwrap();

    let progress = fx.engine.submit("p").unwrap().wait().await;
    assert_eq!(progress.succeeded, 3);
    assert_eq!(fx.client.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn calls_run_concurrently_by_default() {
    let client = ScriptedClient::default()
        .with("a", Behaviour::Sleep(Duration::from_secs(10)))
        .with("b", Behaviour::Sleep(Duration::from_secs(10)));
    let fx = fixture(&["a", "b"], client);
    let started = tokio::time::Instant::now();
    fx.engine.submit("p").unwrap().wait().await;
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(fx.client.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn local_runtime_urls_still_need_their_credential() {
    let fx = fixture_with_creds(&[], StaticCredentials::default(), ScriptedClient::default());
    fx.engine
        .registry()
        .create_model(NewModel {
            name: "local".into(),
            api_url: "http://127.0.0.1:11434/api/chat".into(),
            credential_ref: "OLLAMA_KEY".into(),
            is_active: true,
        })
        .unwrap();
    fx.engine.submit("hi").unwrap().wait().await;
    let row = fx.engine.snapshot().rows[0].clone();
    assert_eq!(row.status, RowStatus::Error);
    assert_eq!(row.error_kind, Some(ErrorKind::Network));
    assert_eq!(fx.client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_credential_does_not_queue_behind_slow_calls() {
    let fx = fixture(&["slow"], ScriptedClient::default().with("slow", Behaviour::Hang));
    add_model(fx.engine.registry(), "unkeyed", "ABSENT_KEY");
    settings::set(&fx.pool.get().unwrap(), settings::KEY_MAX_CONCURRENCY, "1").unwrap();

    let handle = fx.engine.submit("p").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snap = fx.engine.snapshot();
    assert_eq!(snap.row("slow").unwrap().status, RowStatus::Pending);
    let unkeyed = snap.row("unkeyed").unwrap();
    assert_eq!(unkeyed.status, RowStatus::Error);
    assert_eq!(unkeyed.error_kind, Some(ErrorKind::Network));
    assert_eq!(handle.progress().pending, 1);
}
