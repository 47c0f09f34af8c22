//! End-to-end pipeline tests with scripted assistant clients.
//!
//! These exercise the orchestrator against a real sqlite checkpoint store
//! and a real workbook on disk; only the browser is substituted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use autoquest::checkpoint::CheckpointStore;
use autoquest::config::AppConfig;
use autoquest::control::{Controller, StartRequest};
use autoquest::error::ExtractError;
use autoquest::input::{Entity, FieldKind, FieldTemplate};
use autoquest::orchestrator::BatchRunner;
use autoquest::output::ExcelWriter;
use autoquest::progress::{BatchStatus, ProgressReporter};
use autoquest::session::AssistantClient;

/// Scripted assistant: responds via a closure and counts exchanges.
struct ScriptedClient {
    respond: Box<dyn FnMut(&str) -> Result<String, ExtractError> + Send>,
    calls: Arc<AtomicU32>,
    in_flight: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
}

impl ScriptedClient {
    fn new(
        respond: impl FnMut(&str) -> Result<String, ExtractError> + Send + 'static,
    ) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let client = Self {
            respond: Box::new(respond),
            calls: Arc::clone(&calls),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapped: Arc::new(AtomicBool::new(false)),
        };
        (client, calls)
    }
}

impl AssistantClient for ScriptedClient {
    fn exchange(&mut self, prompt: &str) -> Result<String, ExtractError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let result = (self.respond)(prompt);
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

fn test_config(dir: &TempDir) -> AppConfig {
    let mut config: AppConfig = toml::from_str(autoquest::config::DEFAULT_CONFIG).unwrap();
    config.storage.db_path = dir
        .path()
        .join("progress.db")
        .to_string_lossy()
        .into_owned();
    config.storage.backup_dir = dir.path().join("backups").to_string_lossy().into_owned();
    // Keep retry sleeps out of the test wall clock
    config.retry.backoff_base_delay_ms = 1;
    config.retry.backoff_max_delay_ms = 2;
    config
}

fn entities(names: &[&str]) -> Vec<Entity> {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| Entity::new(i, *n))
        .collect()
}

fn templates(fields: &[&str]) -> Vec<FieldTemplate> {
    fields
        .iter()
        .map(|f| FieldTemplate {
            field: f.to_string(),
            template: format!("{f} of {{name}}"),
            kind: FieldKind::Text,
        })
        .collect()
}

struct Harness {
    dir: TempDir,
    config: AppConfig,
    output_path: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let output_path = dir.path().join("out.xlsx");
        Self {
            dir,
            config,
            output_path,
        }
    }

    fn store(&self) -> CheckpointStore {
        CheckpointStore::open(std::path::Path::new(&self.config.storage.db_path)).unwrap()
    }

    fn runner(
        &self,
        batch_id: &str,
        client: ScriptedClient,
        fields: &[&str],
        total: usize,
    ) -> (BatchRunner, ProgressReporter, CancellationToken) {
        let writer = ExcelWriter::create(
            &self.output_path,
            fields.iter().map(|f| f.to_string()).collect(),
            &self.config.storage,
        )
        .unwrap();
        let reporter = ProgressReporter::new(batch_id, total);
        let cancel = CancellationToken::new();
        let runner = BatchRunner::new(
            self.config.clone(),
            batch_id.to_string(),
            self.store(),
            writer,
            Arc::new(Mutex::new(
                Box::new(client) as Box<dyn AssistantClient>
            )),
            reporter.clone(),
            cancel.clone(),
        );
        (runner, reporter, cancel)
    }
}

#[tokio::test]
async fn test_full_batch_completes_and_writes_workbook() {
    let harness = Harness::new();
    let (client, calls) =
        ScriptedClient::new(|_| Ok("Berlin~https://src.example".to_string()));
    let fields = ["hq", "revenue"];
    let (runner, reporter, _cancel) = harness.runner("b1", client, &fields, 4);

    let status = runner
        .run(&entities(&["Acme", "Beta"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let counts = harness.store().counts("b1").unwrap();
    assert_eq!(counts.done, 4);
    assert_eq!(counts.failed, 0);
    assert_eq!(counts.pending, 0);

    let snap = reporter.snapshot();
    assert_eq!(snap.status, BatchStatus::Completed);
    assert_eq!(snap.done, 4);

    let bytes = std::fs::read(&harness.output_path).unwrap();
    assert_eq!(&bytes[..2], b"PK");
}

#[tokio::test]
async fn test_one_failing_task_does_not_sink_the_batch() {
    // 3 entities x 2 fields; "revenue of Beta" always fails with an
    // automation error. The other five tasks must complete and the batch
    // must still finish as completed.
    let harness = Harness::new();
    let (client, _calls) = ScriptedClient::new(|prompt: &str| {
        if prompt.contains("revenue of Beta") {
            Err(ExtractError::Automation("element went stale".into()))
        } else {
            Ok("value~https://src.example".to_string())
        }
    });
    let fields = ["hq", "revenue"];
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 6);

    let status = runner
        .run(&entities(&["Acme", "Beta", "Gamma"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    let counts = harness.store().counts("b1").unwrap();
    assert_eq!(counts.done, 5);
    assert_eq!(counts.failed, 1);

    let record = harness
        .store()
        .get("b1", "0001:Beta", "revenue")
        .unwrap()
        .unwrap();
    assert_eq!(record.state, autoquest::TaskState::Failed);
    assert!(record.last_error.unwrap().contains("element went stale"));
}

#[tokio::test]
async fn test_retry_budget_is_exactly_max_attempts() {
    let harness = Harness::new();
    let (client, calls) = ScriptedClient::new(|_| {
        Err(ExtractError::Automation("never works".into()))
    });
    let fields = ["hq"];
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 1);

    let status = runner
        .run(&entities(&["Acme"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(
        calls.load(Ordering::SeqCst),
        harness.config.retry.max_attempts
    );
    assert_eq!(harness.store().counts("b1").unwrap().failed, 1);
}

#[tokio::test]
async fn test_unparseable_responses_degrade_to_forced_null() {
    // "N/A" normalizes to zero parseable segments, so every exchange is a
    // parse failure. After the parse budget the task completes with an
    // explicit null rather than failing.
    let harness = Harness::new();
    let (client, calls) = ScriptedClient::new(|_| Ok("N/A".to_string()));
    let fields = ["hq"];
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 1);

    let status = runner
        .run(&entities(&["Acme"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), harness.config.retry.parse_attempts);

    let record = harness.store().get("b1", "0000:Acme", "hq").unwrap().unwrap();
    assert_eq!(record.state, autoquest::TaskState::Done);
    assert_eq!(record.value, None);
    assert_eq!(record.confidence, Some(autoquest::Confidence::Forced));
}

#[tokio::test]
async fn test_resume_skips_completed_tasks() {
    let harness = Harness::new();
    let fields = ["hq", "revenue"];

    // First run: revenue queries fail every time.
    let (client, _calls) = ScriptedClient::new(|prompt: &str| {
        if prompt.contains("revenue") {
            Err(ExtractError::Automation("flaky".into()))
        } else {
            Ok("Berlin~https://src.example".to_string())
        }
    });
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 4);
    runner
        .run(&entities(&["Acme", "Beta"]), &templates(&fields))
        .await
        .unwrap();
    let counts = harness.store().counts("b1").unwrap();
    assert_eq!(counts.done, 2);
    assert_eq!(counts.failed, 2);

    // Second run, same batch id, healthy client. The failed rows sit at the
    // old attempt ceiling, so raise it by one to let them requeue.
    let mut resume_config = harness.config.clone();
    resume_config.retry.max_attempts += 1;

    let (client, calls) = ScriptedClient::new(|_| Ok("42~https://src.example".to_string()));
    let writer = ExcelWriter::create(
        &harness.output_path,
        fields.iter().map(|f| f.to_string()).collect(),
        &resume_config.storage,
    )
    .unwrap();
    let reporter = ProgressReporter::new("b1", 4);
    let runner = BatchRunner::new(
        resume_config,
        "b1".to_string(),
        harness.store(),
        writer,
        Arc::new(Mutex::new(Box::new(client) as Box<dyn AssistantClient>)),
        reporter,
        CancellationToken::new(),
    );
    let status = runner
        .run(&entities(&["Acme", "Beta"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    // Only the two previously failed tasks hit the browser again.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let counts = harness.store().counts("b1").unwrap();
    assert_eq!(counts.done, 4);
    assert_eq!(counts.failed, 0);

    // The resumed values must not clobber the first run's results.
    let kept = harness.store().get("b1", "0000:Acme", "hq").unwrap().unwrap();
    assert_eq!(kept.value.as_deref(), Some("Berlin"));
}

#[tokio::test]
async fn test_attempts_accumulate_across_resumes() {
    let harness = Harness::new();
    let fields = ["hq"];

    let (client, _calls) =
        ScriptedClient::new(|_| Err(ExtractError::Automation("flaky".into())));
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 1);
    runner
        .run(&entities(&["Acme"]), &templates(&fields))
        .await
        .unwrap();

    let first = harness.store().get("b1", "0000:Acme", "hq").unwrap().unwrap();
    assert_eq!(first.state, autoquest::TaskState::Failed);
    assert_eq!(first.attempts, harness.config.retry.max_attempts);

    // Raise the ceiling so the row requeues, and keep failing.
    let mut resume_config = harness.config.clone();
    resume_config.retry.max_attempts += 1;
    let (client, calls) =
        ScriptedClient::new(|_| Err(ExtractError::Automation("flaky".into())));
    let writer = ExcelWriter::create(
        &harness.output_path,
        fields.iter().map(|f| f.to_string()).collect(),
        &resume_config.storage,
    )
    .unwrap();
    let runner = BatchRunner::new(
        resume_config.clone(),
        "b1".to_string(),
        harness.store(),
        writer,
        Arc::new(Mutex::new(Box::new(client) as Box<dyn AssistantClient>)),
        ProgressReporter::new("b1", 1),
        CancellationToken::new(),
    );
    runner
        .run(&entities(&["Acme"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), resume_config.retry.max_attempts);
    // The first run's attempts keep counting toward the requeue ceiling.
    let second = harness.store().get("b1", "0000:Acme", "hq").unwrap().unwrap();
    assert_eq!(second.state, autoquest::TaskState::Failed);
    assert_eq!(
        second.attempts,
        harness.config.retry.max_attempts + resume_config.retry.max_attempts
    );
}

#[tokio::test]
async fn test_rerunning_a_completed_batch_issues_no_queries() {
    let harness = Harness::new();
    let fields = ["hq"];

    let (client, _calls) = ScriptedClient::new(|_| Ok("x~https://src.example".to_string()));
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 2);
    runner
        .run(&entities(&["Acme", "Beta"]), &templates(&fields))
        .await
        .unwrap();

    let (client, calls) = ScriptedClient::new(|_| Ok("y~https://other.example".to_string()));
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 2);
    let status = runner
        .run(&entities(&["Acme", "Beta"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let record = harness.store().get("b1", "0000:Acme", "hq").unwrap().unwrap();
    assert_eq!(record.value.as_deref(), Some("x"));
}

#[tokio::test]
async fn test_cancellation_stops_between_tasks() {
    let harness = Harness::new();
    let (client, calls) = ScriptedClient::new(|_| Ok("x~https://src.example".to_string()));
    let fields = ["hq"];
    let (runner, reporter, cancel) = harness.runner("b1", client, &fields, 3);

    cancel.cancel();
    let status = runner
        .run(&entities(&["Acme", "Beta", "Gamma"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(reporter.snapshot().status, BatchStatus::Stopped);
    // Everything stays pending for a later resume.
    assert_eq!(harness.store().counts("b1").unwrap().pending, 3);
}

#[tokio::test]
async fn test_stop_mid_chunk_leaves_no_in_progress_rows() {
    // The client trips the cancel token during its first exchange and fails
    // retryably, so the stop lands while the chunk is marked in_progress.
    let harness = Harness::new();
    let fields = ["hq"];
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let (client, calls) = ScriptedClient::new(move |_| {
        trigger.cancel();
        Err(ExtractError::Automation("interrupted".into()))
    });
    let writer = ExcelWriter::create(
        &harness.output_path,
        fields.iter().map(|f| f.to_string()).collect(),
        &harness.config.storage,
    )
    .unwrap();
    let reporter = ProgressReporter::new("b1", 3);
    let runner = BatchRunner::new(
        harness.config.clone(),
        "b1".to_string(),
        harness.store(),
        writer,
        Arc::new(Mutex::new(Box::new(client) as Box<dyn AssistantClient>)),
        reporter.clone(),
        cancel,
    );

    let status = runner
        .run(&entities(&["Acme", "Beta", "Gamma"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The interrupted chunk is parked as pending, not left in_progress.
    let counts = harness.store().counts("b1").unwrap();
    assert_eq!(counts.in_progress, 0);
    assert_eq!(counts.pending, 3);
}

#[tokio::test]
async fn test_exchanges_never_overlap() {
    let harness = Harness::new();
    let (client, _calls) = ScriptedClient::new(|_| Ok("x~https://src.example".to_string()));
    let overlapped = Arc::clone(&client.overlapped);
    let fields = ["hq", "revenue", "founded"];
    let (runner, _reporter, _cancel) = harness.runner("b1", client, &fields, 9);

    runner
        .run(&entities(&["Acme", "Beta", "Gamma"]), &templates(&fields))
        .await
        .unwrap();

    assert!(!overlapped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_packed_fields_share_one_exchange() {
    let harness = Harness::new();
    let mut config = test_config(&harness.dir);
    config.query.fields_per_query = 2;

    let (client, calls) =
        ScriptedClient::new(|_| Ok("Berlin~https://a.example?5000~https://b.example".to_string()));
    let fields = ["hq", "headcount"];
    let writer = ExcelWriter::create(
        &harness.output_path,
        fields.iter().map(|f| f.to_string()).collect(),
        &config.storage,
    )
    .unwrap();
    let runner = BatchRunner::new(
        config,
        "b1".to_string(),
        harness.store(),
        writer,
        Arc::new(Mutex::new(Box::new(client) as Box<dyn AssistantClient>)),
        ProgressReporter::new("b1", 2),
        CancellationToken::new(),
    );

    let status = runner
        .run(&entities(&["Acme"]), &templates(&fields))
        .await
        .unwrap();

    assert_eq!(status, BatchStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let counts = harness.store().counts("b1").unwrap();
    assert_eq!(counts.done, 2);

    let hq = harness.store().get("b1", "0000:Acme", "hq").unwrap().unwrap();
    assert_eq!(hq.value.as_deref(), Some("Berlin"));
    let headcount = harness
        .store()
        .get("b1", "0000:Acme", "headcount")
        .unwrap()
        .unwrap();
    assert_eq!(headcount.value.as_deref(), Some("5000"));
}

#[tokio::test]
async fn test_controller_start_status_stop_download() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // Input files on disk, loaded through the real input path.
    let entities_path = dir.path().join("entities.csv");
    std::fs::write(&entities_path, "name\nAcme\nBeta\n").unwrap();
    let templates_path = dir.path().join("templates.csv");
    std::fs::write(&templates_path, "field,template\nhq,HQ of {name}\n").unwrap();
    let output_path = dir.path().join("out.xlsx");

    let factory: autoquest::control::ClientFactory = Arc::new(|_| {
        let (client, _calls) =
            ScriptedClient::new(|_| Ok("Berlin~https://src.example".to_string()));
        Ok(Box::new(client) as Box<dyn AssistantClient>)
    });
    let controller = Controller::with_factory(config, factory);

    let batch_id = controller
        .start(StartRequest {
            entities_path,
            templates_path,
            output_path,
            batch_id: None,
            debug_port: None,
        })
        .await
        .unwrap();
    assert!(!batch_id.is_empty());

    let status = controller.join(&batch_id).await.unwrap();
    assert_eq!(status, BatchStatus::Completed);

    let snap = controller.status(&batch_id).unwrap();
    assert_eq!(snap.batch_id, batch_id);
    assert_eq!(snap.done, 2);
    assert_eq!(snap.status, BatchStatus::Completed);

    // Stopping a finished batch is an error, downloading is not.
    assert!(controller.stop(&batch_id).is_err());
    let bytes = controller.download(&batch_id).unwrap();
    assert_eq!(&bytes[..2], b"PK");
}

#[tokio::test]
async fn test_controller_attach_failure_is_session_lost() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let entities_path = dir.path().join("entities.csv");
    std::fs::write(&entities_path, "name\nAcme\n").unwrap();
    let templates_path = dir.path().join("templates.csv");
    std::fs::write(&templates_path, "field,template\nhq,HQ of {name}\n").unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let factory: autoquest::control::ClientFactory = Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(ExtractError::SessionLost("no debug port".into()))
    });
    let attach_attempts = config.retry.attach_attempts;
    let controller = Controller::with_factory(config, factory);

    let result = controller
        .start(StartRequest {
            entities_path,
            templates_path,
            output_path: dir.path().join("out.xlsx"),
            batch_id: None,
            debug_port: None,
        })
        .await;

    assert!(matches!(result, Err(ExtractError::SessionLost(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), attach_attempts);
}

#[tokio::test]
async fn test_concurrent_batches_need_distinct_debug_ports() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let default_port = config.browser.debug_port;

    let entities_path = dir.path().join("entities.csv");
    std::fs::write(&entities_path, "name\nAcme\nBeta\n").unwrap();
    let templates_path = dir.path().join("templates.csv");
    std::fs::write(&templates_path, "field,template\nhq,HQ of {name}\n").unwrap();

    // Slow exchanges keep the first batch live while the others start.
    let factory: autoquest::control::ClientFactory = Arc::new(|_| {
        let (client, _calls) = ScriptedClient::new(|_| {
            std::thread::sleep(std::time::Duration::from_millis(150));
            Ok("Berlin~https://src.example".to_string())
        });
        Ok(Box::new(client) as Box<dyn AssistantClient>)
    });
    let controller = Controller::with_factory(config, factory);

    let first = controller
        .start(StartRequest {
            entities_path: entities_path.clone(),
            templates_path: templates_path.clone(),
            output_path: dir.path().join("first.xlsx"),
            batch_id: Some("first".to_string()),
            debug_port: None,
        })
        .await
        .unwrap();

    // Same port while the first batch is live: rejected, nothing registered.
    let clash = controller
        .start(StartRequest {
            entities_path: entities_path.clone(),
            templates_path: templates_path.clone(),
            output_path: dir.path().join("clash.xlsx"),
            batch_id: Some("clash".to_string()),
            debug_port: Some(default_port),
        })
        .await;
    assert!(matches!(clash, Err(ExtractError::Automation(_))));
    assert!(controller.status("clash").is_none());

    // A different port runs alongside.
    let second = controller
        .start(StartRequest {
            entities_path: entities_path.clone(),
            templates_path: templates_path.clone(),
            output_path: dir.path().join("second.xlsx"),
            batch_id: Some("second".to_string()),
            debug_port: Some(default_port + 1),
        })
        .await
        .unwrap();

    assert_eq!(controller.join(&first).await.unwrap(), BatchStatus::Completed);
    assert_eq!(controller.join(&second).await.unwrap(), BatchStatus::Completed);

    // The port frees up once its batch reaches a terminal state.
    let reused = controller
        .start(StartRequest {
            entities_path,
            templates_path,
            output_path: dir.path().join("reused.xlsx"),
            batch_id: Some("reused".to_string()),
            debug_port: None,
        })
        .await
        .unwrap();
    assert_eq!(controller.join(&reused).await.unwrap(), BatchStatus::Completed);
}
