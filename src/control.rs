//! Control surface: start, status, stop, download
//!
//! The controller is a registry of batch sessions keyed by batch id. Each
//! start loads the inputs, attaches a browser session (with its own retry
//! budget), and spawns an independent runner; status, stop, and download
//! address a session by id without blocking on it. Sessions share the
//! checkpoint database, which is contended only per composite task key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::AppConfig;
use crate::error::ExtractError;
use crate::input;
use crate::orchestrator::{BatchRunner, SharedClient};
use crate::output::ExcelWriter;
use crate::progress::{BatchStatus, ProgressReporter, ProgressSnapshot};
use crate::retry::RetryHelper;
use crate::session::{AssistantClient, BrowserSession};

/// Produces a fresh assistant client on a given Chrome debug port.
/// Production attaches Chrome; tests substitute scripted clients.
pub type ClientFactory =
    Arc<dyn Fn(u16) -> Result<Box<dyn AssistantClient>, ExtractError> + Send + Sync>;

/// Parameters for starting one batch.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub entities_path: PathBuf,
    pub templates_path: PathBuf,
    pub output_path: PathBuf,
    /// Reuse an earlier batch id to resume it; omit to start a new batch.
    pub batch_id: Option<String>,
    /// Chrome debug port for this batch; omit to use the configured one.
    /// Concurrent batches need distinct ports, one visible tab each.
    pub debug_port: Option<u16>,
}

struct ActiveBatch {
    reporter: ProgressReporter,
    cancel: CancellationToken,
    output_path: PathBuf,
    debug_port: u16,
    handle: Option<JoinHandle<Result<BatchStatus, ExtractError>>>,
}

pub struct Controller {
    config: AppConfig,
    factory: ClientFactory,
    batches: Mutex<HashMap<String, ActiveBatch>>,
}

impl Controller {
    /// Controller that attaches Chrome sessions over DevTools debug ports.
    pub fn new(config: AppConfig) -> Self {
        let browser = config.browser.clone();
        let factory: ClientFactory = Arc::new(move |port| {
            let mut browser = browser.clone();
            browser.debug_port = port;
            BrowserSession::attach(&browser).map(|s| Box::new(s) as Box<dyn AssistantClient>)
        });
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: AppConfig, factory: ClientFactory) -> Self {
        Self {
            config,
            factory,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or resume) a batch. Returns the batch id once the session is
    /// attached and the runner is spawned.
    pub async fn start(&self, request: StartRequest) -> Result<String, ExtractError> {
        let batch_id = request
            .batch_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let debug_port = request.debug_port.unwrap_or(self.config.browser.debug_port);

        {
            let batches = lock(&self.batches);
            if let Some(existing) = batches.get(&batch_id) {
                if !existing.reporter.snapshot().status.is_terminal() {
                    return Err(ExtractError::Automation(format!(
                        "batch {batch_id} is already running"
                    )));
                }
            }
            // Two batches on one port would fight over the same visible tab
            // and interleave each other's page text.
            for (id, batch) in batches.iter() {
                if batch.debug_port == debug_port
                    && !batch.reporter.snapshot().status.is_terminal()
                {
                    return Err(ExtractError::Automation(format!(
                        "debug port {debug_port} is already driving batch {id}"
                    )));
                }
            }
        }

        let entities = input::load_entities(&request.entities_path)
            .map_err(|e| ExtractError::Automation(format!("load entities: {e}")))?;
        let templates = input::load_templates(&request.templates_path)
            .map_err(|e| ExtractError::Automation(format!("load templates: {e}")))?;

        let store = CheckpointStore::open(Path::new(&self.config.storage.db_path))?;
        let fields: Vec<String> = templates.iter().map(|t| t.field.clone()).collect();
        let writer = ExcelWriter::create(&request.output_path, fields, &self.config.storage)?;

        let client = self.attach_client(debug_port).await?;

        let total = entities.len() * templates.len();
        let reporter = ProgressReporter::new(&batch_id, total);
        let cancel = CancellationToken::new();

        let runner = BatchRunner::new(
            self.config.clone(),
            batch_id.clone(),
            store,
            writer,
            client,
            reporter.clone(),
            cancel.clone(),
        );

        info!(
            batch = %batch_id,
            entities = entities.len(),
            fields_per_entity = templates.len(),
            debug_port,
            "starting batch"
        );
        let handle = tokio::spawn(async move { runner.run(&entities, &templates).await });

        let mut batches = lock(&self.batches);
        batches.insert(
            batch_id.clone(),
            ActiveBatch {
                reporter,
                cancel,
                output_path: request.output_path,
                debug_port,
                handle: Some(handle),
            },
        );
        Ok(batch_id)
    }

    /// Attach the assistant session, retrying per the attach budget.
    async fn attach_client(&self, debug_port: u16) -> Result<SharedClient, ExtractError> {
        let helper = RetryHelper::with_budget(&self.config.retry, self.config.retry.attach_attempts);
        let cancel = CancellationToken::new();
        let client = helper
            .with_retry(&cancel, |_| {
                let factory = Arc::clone(&self.factory);
                async move {
                    task::spawn_blocking(move || {
                        // Attach failures are SessionLost (fatal); soften to
                        // retryable here so the budget applies, and restore
                        // the final classification after exhaustion.
                        factory(debug_port).map_err(|e| ExtractError::Automation(e.to_string()))
                    })
                    .await
                    .map_err(|e| ExtractError::Automation(format!("attach task: {e}")))?
                }
            })
            .await
            .map_err(|e| ExtractError::SessionLost(e.to_string()))?;
        Ok(Arc::new(Mutex::new(client)))
    }

    /// Snapshot of one batch by id.
    pub fn status(&self, batch_id: &str) -> Option<ProgressSnapshot> {
        lock(&self.batches)
            .get(batch_id)
            .map(|b| b.reporter.snapshot())
    }

    /// Request a graceful stop. The runner finishes its in-flight exchange
    /// bookkeeping and parks remaining work as pending.
    pub fn stop(&self, batch_id: &str) -> Result<(), ExtractError> {
        let batches = lock(&self.batches);
        let Some(batch) = batches.get(batch_id) else {
            return Err(ExtractError::Automation(format!(
                "no batch {batch_id} to stop"
            )));
        };
        if batch.reporter.snapshot().status.is_terminal() {
            return Err(ExtractError::Automation(format!(
                "batch {batch_id} already finished"
            )));
        }
        info!(batch = %batch_id, "stop requested");
        batch.reporter.set_status(BatchStatus::Stopping);
        batch.cancel.cancel();
        Ok(())
    }

    /// Wait for a batch to reach a terminal state. Consumes the join handle;
    /// a second join on the same batch is an error.
    pub async fn join(&self, batch_id: &str) -> Result<BatchStatus, ExtractError> {
        let handle = {
            let mut batches = lock(&self.batches);
            let Some(batch) = batches.get_mut(batch_id) else {
                return Err(ExtractError::Automation(format!(
                    "no batch {batch_id} to join"
                )));
            };
            match batch.handle.take() {
                Some(handle) => handle,
                None => {
                    return Err(ExtractError::Automation(format!(
                        "batch {batch_id} already joined"
                    )))
                }
            }
        };
        handle
            .await
            .map_err(|e| ExtractError::Automation(format!("batch task: {e}")))?
    }

    /// Bytes of a batch's output workbook.
    pub fn download(&self, batch_id: &str) -> Result<Vec<u8>, ExtractError> {
        let path = {
            let batches = lock(&self.batches);
            let Some(batch) = batches.get(batch_id) else {
                return Err(ExtractError::Automation(format!(
                    "no batch {batch_id} output available"
                )));
            };
            batch.output_path.clone()
        };
        std::fs::read(&path)
            .map_err(|e| ExtractError::Persistence(format!("read workbook {path:?}: {e}")))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
