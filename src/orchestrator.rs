use crate::{
    engine::Engine,
    error::RunError,
    location::{self, Mode, ObjectRef, RunTimestamp},
    pipeline::{ItemOutcome, ItemPipeline, ItemRecord},
    report::{PlanEntry, RunReport},
    stats::Stats,
    storage::ObjectStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Validating,
    Discovering,
    Processing,
    Finalizing,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_input_bytes: u64,
    pub run_timeout: Option<Duration>,
}

/// Drives a whole run: validate/discover inputs, push each through the item
/// pipeline in order, then derive the verdict from the accumulated stats.
pub struct Orchestrator<S: ObjectStore, E: Engine> {
    mode: Mode,
    store: S,
    engine: E,
    run_timestamp: RunTimestamp,
    options: RunOptions,
    interrupted: Arc<AtomicBool>,
}

impl<S: ObjectStore, E: Engine> Orchestrator<S, E> {
    pub fn new(mode: Mode, store: S, engine: E, run_timestamp: RunTimestamp) -> Self {
        Self {
            mode,
            store,
            engine,
            run_timestamp,
            options: RunOptions::default(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Flag polled between items; setting it aborts the run as interrupted.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupted = flag;
        self
    }

    pub fn run_timestamp(&self) -> &RunTimestamp {
        &self.run_timestamp
    }

    fn pipeline(&self) -> ItemPipeline<'_, S, E> {
        ItemPipeline::new(
            &self.store,
            &self.engine,
            &self.mode,
            &self.run_timestamp,
            self.options.max_input_bytes,
        )
    }

    pub fn run(&self) -> RunReport {
        let span = info_span!(
            "run",
            ts = %self.run_timestamp,
            mode = self.mode.name()
        );
        let _enter = span.enter();
        info!("document processing started");

        let mut stats = Stats::default();
        let mut items = Vec::new();

        let inputs = match self.collect_inputs() {
            Ok(inputs) => inputs,
            Err((phase, err)) => {
                error!(phase = ?phase, error = %err, "run aborted");
                return self.failed(phase, err, stats, items);
            }
        };
        stats.discover(inputs.len() as u64);

        info!(count = inputs.len(), "starting document processing");
        let started = Instant::now();
        let pipeline = self.pipeline();

        for (i, input) in inputs.iter().enumerate() {
            if let Err(err) = self.check_abort(started) {
                warn!(
                    remaining = inputs.len() - i,
                    error = %err,
                    "aborting run before all documents were processed"
                );
                return self.failed(Phase::Processing, err, stats, items);
            }

            debug!(index = i, source = %input, "dispatching item");
            let record = pipeline.process(input);
            stats.record(&record.outcome);
            items.push(record);
        }

        self.finalize(stats, items)
    }

    /// Validating + Discovering without fetching, converting or publishing.
    pub fn plan(&self) -> Result<Vec<PlanEntry>, RunError> {
        let inputs = self.collect_inputs().map_err(|(_, err)| err)?;
        Ok(inputs
            .into_iter()
            .map(|input| {
                let output = location::resolve(&input, &self.mode, &self.run_timestamp);
                PlanEntry { input, output }
            })
            .collect())
    }

    fn collect_inputs(&self) -> Result<Vec<ObjectRef>, (Phase, RunError)> {
        match &self.mode {
            Mode::Single { source } => {
                self.validate_single(source)
                    .map_err(|err| (Phase::Validating, err))?;
                Ok(vec![source.clone()])
            }
            Mode::Batch {
                input_container, ..
            } => self
                .discover(input_container)
                .map_err(|err| (Phase::Discovering, err)),
        }
    }

    fn failed(&self, phase: Phase, err: RunError, stats: Stats, items: Vec<ItemRecord>) -> RunReport {
        RunReport::failed(
            self.run_timestamp.clone(),
            Some(self.mode.clone()),
            phase,
            err,
            stats,
            items,
        )
    }

    fn validate_single(&self, source: &ObjectRef) -> Result<(), RunError> {
        info!(source = %source, "validating source object");
        match self.pipeline().validate(source) {
            Ok(_) => Ok(()),
            Err(ItemOutcome::NotFound) => Err(RunError::Validation {
                target: source.to_string(),
                reason: "object does not exist".to_string(),
            }),
            Err(ItemOutcome::Skipped { reason }) => Err(RunError::Validation {
                target: source.to_string(),
                reason,
            }),
            Err(other) => Err(RunError::Validation {
                target: source.to_string(),
                reason: format!("{other:?}"),
            }),
        }
    }

    fn discover(&self, container: &str) -> Result<Vec<ObjectRef>, RunError> {
        info!(container, "listing PDF objects");
        let listed = self
            .store
            .list(container, None)
            .map_err(|err| RunError::Discovery(err.to_string()))?;

        let inputs: Vec<ObjectRef> = listed
            .into_iter()
            .filter(|o| location::is_pdf_key(&o.path))
            .map(|o| ObjectRef::new(container, o.path))
            .collect();

        if inputs.is_empty() {
            warn!(container, "no PDF files found");
            return Err(RunError::Discovery(format!(
                "no PDF files found in container '{container}'"
            )));
        }
        info!(container, count = inputs.len(), "found PDF files");
        Ok(inputs)
    }

    fn check_abort(&self, started: Instant) -> Result<(), RunError> {
        if self.interrupted.load(Ordering::SeqCst) {
            return Err(RunError::Interrupted);
        }
        if let Some(limit) = self.options.run_timeout {
            if started.elapsed() > limit {
                return Err(RunError::TimedOut {
                    seconds: limit.as_secs(),
                });
            }
        }
        Ok(())
    }

    fn finalize(&self, stats: Stats, items: Vec<ItemRecord>) -> RunReport {
        if self.interrupted.load(Ordering::SeqCst) {
            return self.failed(Phase::Finalizing, RunError::Interrupted, stats, items);
        }

        info!(
            discovered = stats.discovered,
            converted = stats.converted,
            uploaded = stats.uploaded,
            conversion_failures = stats.conversion_failures,
            upload_failures = stats.upload_failures,
            skipped = stats.skipped,
            "document processing completed"
        );

        if stats.uploaded == 0 {
            error!("no markdown files were successfully uploaded");
            let err = RunError::NoUploads {
                discovered: stats.discovered,
            };
            return self.failed(Phase::Finalizing, err, stats, items);
        }

        let warning = stats.has_failures().then(|| {
            let failed = stats.conversion_failures + stats.upload_failures + stats.skipped;
            warn!(failed, "some files failed to process");
            format!(
                "{failed} of {} documents failed (conversion: {}, upload: {}, skipped: {})",
                stats.discovered, stats.conversion_failures, stats.upload_failures, stats.skipped
            )
        });

        debug_assert!(stats.discovered > 0, "uploads without discovered inputs");
        if let Some(rate) = stats.success_rate() {
            info!(
                success_rate = %format!("{:.2}%", rate * 100.0),
                total_found = stats.discovered,
                successfully_uploaded = stats.uploaded,
                "processing summary"
            );
        }

        RunReport::succeeded(
            self.run_timestamp.clone(),
            self.mode.clone(),
            stats,
            items,
            warning,
        )
    }
}
