use crate::{
    engine::{Engine, MetaValue},
    location::{self, Mode, ObjectRef, RunTimestamp},
    storage::{ObjectMeta, ObjectStore},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown";

/// Terminal result of driving one document through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Processed { markdown_length: usize },
    ConversionFailed { reason: String },
    UploadFailed { reason: String },
    NotFound,
    Skipped { reason: String },
}

impl ItemOutcome {
    pub fn is_processed(&self) -> bool {
        matches!(self, ItemOutcome::Processed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub source: ObjectRef,
    pub output: Option<ObjectRef>,
    pub outcome: ItemOutcome,
}

/// fetch → convert → publish for a single object. Never retries, never
/// propagates: every exit point is an [`ItemOutcome`].
pub struct ItemPipeline<'a, S: ObjectStore, E: Engine> {
    store: &'a S,
    engine: &'a E,
    mode: &'a Mode,
    run_timestamp: &'a RunTimestamp,
    max_input_bytes: u64,
}

impl<'a, S: ObjectStore, E: Engine> ItemPipeline<'a, S, E> {
    pub fn new(
        store: &'a S,
        engine: &'a E,
        mode: &'a Mode,
        run_timestamp: &'a RunTimestamp,
        max_input_bytes: u64,
    ) -> Self {
        Self {
            store,
            engine,
            mode,
            run_timestamp,
            max_input_bytes,
        }
    }

    /// Existence and type check used in single-item mode.
    pub fn validate(&self, input: &ObjectRef) -> Result<ObjectMeta, ItemOutcome> {
        let meta = match self.store.head(&input.container, &input.path) {
            Ok(meta) => meta,
            Err(err) if err.is_not_found() => {
                error!(source = %input, "source object does not exist");
                return Err(ItemOutcome::NotFound);
            }
            Err(err) => {
                error!(source = %input, error = %err, "existence probe failed");
                return Err(ItemOutcome::Skipped {
                    reason: format!("existence probe failed: {err}"),
                });
            }
        };

        if !location::is_pdf_key(&input.path) {
            warn!(source = %input, "source is not a .pdf object");
            return Err(ItemOutcome::Skipped {
                reason: format!("not a PDF: {}", input.filename()),
            });
        }

        debug!(source = %input, size = meta.size, "source validated");
        Ok(meta)
    }

    pub fn process(&self, input: &ObjectRef) -> ItemRecord {
        let started = Instant::now();
        let (output, outcome) = self.run_steps(input);
        info!(
            source = %input,
            output = %output.as_ref().map(ToString::to_string).unwrap_or_default(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = ?outcome,
            "item finished"
        );
        ItemRecord {
            source: input.clone(),
            output,
            outcome,
        }
    }

    /// Enforces `max_input_bytes` from the object's stored size, before any
    /// bytes are fetched.
    fn check_size(&self, input: &ObjectRef, known_size: Option<u64>) -> Result<(), ItemOutcome> {
        if self.max_input_bytes == 0 {
            return Ok(());
        }
        let size = match known_size {
            Some(size) => size,
            None => match self.store.head(&input.container, &input.path) {
                Ok(meta) => meta.size,
                Err(err) if err.is_not_found() => {
                    warn!(source = %input, "document disappeared before fetch");
                    return Err(ItemOutcome::NotFound);
                }
                Err(err) => {
                    error!(source = %input, error = %err, "failed to read document size");
                    return Err(ItemOutcome::ConversionFailed {
                        reason: err.to_string(),
                    });
                }
            },
        };
        if size > self.max_input_bytes {
            warn!(
                source = %input,
                bytes = size,
                limit = self.max_input_bytes,
                "document exceeds max_input_bytes"
            );
            return Err(ItemOutcome::Skipped {
                reason: format!(
                    "document exceeds max_input_bytes ({size} > {})",
                    self.max_input_bytes
                ),
            });
        }
        Ok(())
    }

    fn run_steps(&self, input: &ObjectRef) -> (Option<ObjectRef>, ItemOutcome) {
        let mut known_size = None;
        if self.mode.is_single() {
            match self.validate(input) {
                Ok(meta) => known_size = Some(meta.size),
                Err(outcome) => return (None, outcome),
            }
        }

        info!(source = %input, "processing document");
        if let Err(outcome) = self.check_size(input, known_size) {
            return (None, outcome);
        }

        let bytes = match self.store.get(&input.container, &input.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(source = %input, error = %err, "failed to fetch document");
                return (
                    None,
                    ItemOutcome::ConversionFailed {
                        reason: err.to_string(),
                    },
                );
            }
        };

        let size_mb = bytes.len() as f64 / (1024.0 * 1024.0);
        info!(source = %input, size_mb = %format!("{size_mb:.2}"), "document fetched");

        let converted = self.engine.convert(&bytes);
        drop(bytes);

        let conversion = match converted {
            Ok(c) => c,
            Err(err) => {
                error!(source = %input, error = %format!("{err:#}"), "conversion failed");
                return (
                    None,
                    ItemOutcome::ConversionFailed {
                        reason: format!("{err:#}"),
                    },
                );
            }
        };

        let markdown = match conversion.markdown.as_deref() {
            Some(text) if !text.is_empty() => text,
            _ => {
                error!(source = %input, "no markdown content generated");
                return (
                    None,
                    ItemOutcome::ConversionFailed {
                        reason: "no content produced".to_string(),
                    },
                );
            }
        };
        info!(source = %input, markdown_length = markdown.len(), "document converted");

        let output = location::resolve(input, self.mode, self.run_timestamp);
        let metadata = publish_metadata(self.run_timestamp, input, &conversion.metadata);

        info!(
            output = %output,
            content_length = markdown.len(),
            "uploading markdown"
        );
        match self.store.put(
            &output.container,
            &output.path,
            markdown.as_bytes(),
            MARKDOWN_CONTENT_TYPE,
            &metadata,
        ) {
            Ok(()) => {
                info!(output = %output, "markdown uploaded");
                let markdown_length = markdown.chars().count();
                (Some(output), ItemOutcome::Processed { markdown_length })
            }
            Err(err) => {
                error!(output = %output, error = %err, "failed to upload markdown");
                (
                    Some(output),
                    ItemOutcome::UploadFailed {
                        reason: err.to_string(),
                    },
                )
            }
        }
    }
}

/// Metadata attached to every published markdown object. Only scalar engine
/// fields are forwarded, as `engine-<key>`.
pub fn publish_metadata(
    run_timestamp: &RunTimestamp,
    input: &ObjectRef,
    engine_meta: &BTreeMap<String, MetaValue>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    out.insert(
        "processing-timestamp".to_string(),
        run_timestamp.to_string(),
    );
    out.insert("original-source-key".to_string(), input.to_string());
    out.insert(
        "original-filename".to_string(),
        input.filename().to_string(),
    );
    out.insert(
        "content-type".to_string(),
        MARKDOWN_CONTENT_TYPE.to_string(),
    );
    for (key, value) in engine_meta {
        match value.as_scalar_string() {
            Some(s) => {
                out.insert(format!("engine-{key}"), s);
            }
            None => debug!(key = key.as_str(), "dropping non-scalar engine metadata"),
        }
    }
    out
}
