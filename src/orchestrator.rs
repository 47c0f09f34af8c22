//! Batch orchestration: entities outer, fields inner, checkpoint everywhere
//!
//! The runner walks entities in input order and their fields in template
//! order, packing up to `fields_per_query` consecutive pending fields of one
//! entity into a single browser exchange. Each task is marked in the
//! checkpoint store before its exchange starts and finalized (with the
//! workbook commit) immediately after, so the process can die at any point
//! and resume without repeating completed work.
//!
//! Failure handling is per-task: an exchange that exhausts its retry budget
//! fails only the fields it carried, and the batch keeps going. Only fatal
//! errors (persistence, session loss) abort the whole run; cancellation
//! finishes nothing new and parks in-flight tasks back as pending.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{CheckpointStore, TaskState};
use crate::config::AppConfig;
use crate::error::ExtractError;
use crate::input::{Entity, FieldTemplate};
use crate::output::ExcelWriter;
use crate::parser::{self, Confidence, ParsedField};
use crate::progress::{BatchStatus, ProgressReporter};
use crate::retry::RetryHelper;
use crate::session::AssistantClient;
use crate::template;

/// Shared handle to the single assistant session. The mutex is what keeps
/// exchanges strictly sequential.
pub type SharedClient = Arc<Mutex<Box<dyn AssistantClient>>>;

/// Outcome of one packed exchange.
enum ExchangeOutcome {
    Parsed(Vec<ParsedField>),
    /// Parse budget exhausted: fields complete with null forced values.
    ParseExhausted,
}

pub struct BatchRunner {
    config: AppConfig,
    batch_id: String,
    store: CheckpointStore,
    writer: ExcelWriter,
    client: SharedClient,
    reporter: ProgressReporter,
    cancel: CancellationToken,
    /// Last successful exchange; a session idle past the activity timeout
    /// is presumed wedged and treated as lost.
    last_activity: Instant,
}

impl BatchRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        batch_id: String,
        store: CheckpointStore,
        writer: ExcelWriter,
        client: SharedClient,
        reporter: ProgressReporter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            batch_id,
            store,
            writer,
            client,
            reporter,
            cancel,
            last_activity: Instant::now(),
        }
    }

    /// Run the batch to a terminal state.
    pub async fn run(
        mut self,
        entities: &[Entity],
        templates: &[FieldTemplate],
    ) -> Result<BatchStatus, ExtractError> {
        self.prepare(entities, templates)?;
        self.reporter.set_status(BatchStatus::Running);
        self.reporter.log(format!(
            "batch started: {} entities x {} fields",
            entities.len(),
            templates.len()
        ));

        let mut stopped = false;

        'entities: for entity in entities {
            let pending = self.pending_fields(entity, templates)?;
            if pending.is_empty() {
                continue;
            }

            for chunk in pending.chunks(self.config.query.fields_per_query) {
                if self.cancel.is_cancelled() {
                    stopped = true;
                    break 'entities;
                }

                if self.last_activity.elapsed() > self.config.browser.activity_timeout() {
                    let e = ExtractError::SessionLost(format!(
                        "no successful exchange in {:?}",
                        self.config.browser.activity_timeout()
                    ));
                    error!(error = %e, "session idle too long, aborting batch");
                    self.reporter.set_last_error(e.to_string());
                    self.reporter.log(format!("fatal: {e}"));
                    self.reporter.set_status(BatchStatus::Failed);
                    self.refresh_counts()?;
                    return Err(e);
                }

                match self.run_chunk(entity, chunk).await {
                    Ok(()) => {
                        self.last_activity = Instant::now();
                    }
                    Err(e) if e.is_fatal() => {
                        // In-flight rows stay in_progress; the next resume
                        // requeues them.
                        error!(entity = %entity.name, error = %e, "fatal error, aborting batch");
                        self.reporter.set_last_error(e.to_string());
                        self.reporter.log(format!("fatal: {e}"));
                        self.reporter.set_status(BatchStatus::Failed);
                        self.refresh_counts()?;
                        return Err(e);
                    }
                    Err(ExtractError::Cancelled) => {
                        // Park the interrupted chunk for the next resume; a
                        // stopped batch must not report in-flight work.
                        self.store.requeue_crashed(&self.batch_id)?;
                        stopped = true;
                        break 'entities;
                    }
                    Err(e) => {
                        // Retry budget exhausted: fail just these fields. The
                        // stored attempt count already includes prior runs,
                        // so add the calls this run burned on top of it.
                        warn!(entity = %entity.name, error = %e, "task failed, continuing batch");
                        self.reporter.set_last_error(e.to_string());
                        for field in chunk {
                            let attempts = self
                                .store
                                .get(&self.batch_id, &entity.key(), &field.field)?
                                .map(|r| r.attempts)
                                .unwrap_or(1)
                                + self.config.retry.max_attempts
                                - 1;
                            self.store.mark_failed(
                                &self.batch_id,
                                &entity.key(),
                                &field.field,
                                attempts,
                                &e.to_string(),
                            )?;
                        }
                        self.reporter.log(format!("{}: {} failed: {e}", entity.name, chunk_names(chunk)));
                    }
                }
                self.refresh_counts()?;
            }
        }

        self.reporter.clear_current();
        let counts = self.store.counts(&self.batch_id)?;
        let status = if stopped {
            info!(batch = %self.batch_id, "batch stopped on request");
            BatchStatus::Stopped
        } else {
            info!(
                batch = %self.batch_id,
                done = counts.done,
                failed = counts.failed,
                "batch completed"
            );
            BatchStatus::Completed
        };
        self.reporter.set_status(status);
        self.reporter.log(format!(
            "batch {}: {} done, {} failed, {} pending",
            if stopped { "stopped" } else { "completed" },
            counts.done,
            counts.failed,
            counts.pending
        ));
        Ok(status)
    }

    /// Register tasks, reclaim interrupted and under-budget failed rows,
    /// and rebuild the workbook grid from completed checkpoints.
    fn prepare(
        &mut self,
        entities: &[Entity],
        templates: &[FieldTemplate],
    ) -> Result<(), ExtractError> {
        for entity in entities {
            for template in templates {
                self.store
                    .ensure_task(&self.batch_id, &entity.key(), &entity.name, &template.field)?;
            }
        }

        self.store.requeue_crashed(&self.batch_id)?;
        self.store
            .requeue_failed_below(&self.batch_id, self.config.retry.max_attempts)?;

        self.writer.seed_entities(entities);
        let done = self.store.list_done(&self.batch_id)?;
        if !done.is_empty() {
            info!(resumed = done.len(), "restoring completed tasks from checkpoint");
            self.writer.restore(&done);
        }
        self.writer.flush()?;
        self.refresh_counts()
    }

    fn refresh_counts(&self) -> Result<(), ExtractError> {
        self.reporter.set_counts(self.store.counts(&self.batch_id)?);
        Ok(())
    }

    /// Fields of this entity still pending, in template order.
    fn pending_fields<'t>(
        &self,
        entity: &Entity,
        templates: &'t [FieldTemplate],
    ) -> Result<Vec<&'t FieldTemplate>, ExtractError> {
        let mut pending = Vec::new();
        for template in templates {
            let record = self.store.get(&self.batch_id, &entity.key(), &template.field)?;
            if matches!(record.map(|r| r.state), Some(TaskState::Pending)) {
                pending.push(template);
            }
        }
        Ok(pending)
    }

    /// One packed exchange: mark in_progress, query, parse, commit.
    async fn run_chunk(
        &mut self,
        entity: &Entity,
        chunk: &[&FieldTemplate],
    ) -> Result<(), ExtractError> {
        let entity_key = entity.key();
        self.reporter.set_current(&entity.name, &chunk_names(chunk));

        for field in chunk {
            // Attempts carried over from earlier runs count toward the
            // requeue ceiling, so a resumed task continues its tally.
            let prior = self
                .store
                .get(&self.batch_id, &entity_key, &field.field)?
                .map(|r| r.attempts)
                .unwrap_or(0);
            self.store
                .mark_in_progress(&self.batch_id, &entity_key, &field.field, prior + 1)?;
        }

        let owned: Vec<FieldTemplate> = chunk.iter().map(|t| (*t).clone()).collect();
        let prompt = template::render_group(&owned, entity);

        let outcome = self.exchange_and_parse(&entity_key, &prompt, chunk.len()).await?;

        match outcome {
            ExchangeOutcome::Parsed(fields) => {
                for (field, parsed) in chunk.iter().zip(fields.iter()) {
                    self.commit(entity, field, parsed)?;
                }
                self.reporter
                    .log(format!("{}: {} done", entity.name, chunk_names(chunk)));
            }
            ExchangeOutcome::ParseExhausted => {
                // Complete rather than fail: a value the assistant cannot
                // format is recorded as an explicit forced null.
                let null = ParsedField {
                    value: None,
                    url: None,
                    confidence: Confidence::Forced,
                };
                for field in chunk {
                    self.commit(entity, field, &null)?;
                }
                self.reporter.log(format!(
                    "{}: {} unparseable, recorded as forced null",
                    entity.name,
                    chunk_names(chunk)
                ));
            }
        }
        Ok(())
    }

    /// Drive the exchange through both retry budgets.
    ///
    /// The inner helper bounds browser attempts per exchange; the outer loop
    /// re-issues the whole exchange when the response text parses to
    /// nothing, up to `parse_attempts` times, then degrades to forced nulls.
    async fn exchange_and_parse(
        &self,
        entity_key: &str,
        prompt: &str,
        expected: usize,
    ) -> Result<ExchangeOutcome, ExtractError> {
        let exchange_retry = RetryHelper::new(&self.config.retry);

        for parse_attempt in 1..=self.config.retry.parse_attempts {
            let response = exchange_retry
                .with_retry(&self.cancel, |attempt| {
                    let client = Arc::clone(&self.client);
                    let prompt = prompt.to_string();
                    async move {
                        task::spawn_blocking(move || {
                            let mut client = match client.lock() {
                                Ok(guard) => guard,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            if attempt > 1 {
                                client.recover()?;
                            }
                            client.exchange(&prompt)
                        })
                        .await
                        .map_err(|e| ExtractError::Automation(format!("exchange task: {e}")))?
                    }
                })
                .await?;

            match parser::parse(&response, expected) {
                Ok(fields) => {
                    self.store
                        .log_query(&self.batch_id, entity_key, prompt, &response, "parsed")?;
                    return Ok(ExchangeOutcome::Parsed(fields));
                }
                Err(e) => {
                    self.store.log_query(
                        &self.batch_id,
                        entity_key,
                        prompt,
                        &response,
                        "unparseable",
                    )?;
                    warn!(
                        parse_attempt,
                        budget = self.config.retry.parse_attempts,
                        error = %e,
                        "response did not parse"
                    );
                }
            }
        }

        Ok(ExchangeOutcome::ParseExhausted)
    }

    /// Finalize one field: normalize, checkpoint, write to the workbook.
    /// Checkpoint first: a crash between the two repeats one cheap workbook
    /// rewrite on resume instead of one browser exchange.
    fn commit(
        &mut self,
        entity: &Entity,
        field: &FieldTemplate,
        parsed: &ParsedField,
    ) -> Result<(), ExtractError> {
        let value = parsed
            .value
            .as_deref()
            .and_then(|v| parser::normalize_value(field.kind, v));

        self.store.mark_done(
            &self.batch_id,
            &entity.key(),
            &field.field,
            value.as_deref(),
            parsed.url.as_deref(),
            parsed.confidence,
        )?;
        self.writer.commit_field(
            &entity.key(),
            &entity.name,
            &field.field,
            value.as_deref(),
            parsed.url.as_deref(),
            parsed.confidence,
        )?;
        Ok(())
    }
}

fn chunk_names(chunk: &[&FieldTemplate]) -> String {
    chunk
        .iter()
        .map(|t| t.field.as_str())
        .collect::<Vec<_>>()
        .join("+")
}
