use anyhow::{anyhow, Result};
use doc_reader::{
    engine::{Conversion, Engine, EngineDiag, MetaValue},
    error::RunError,
    location::{Mode, ObjectRef, OutputPrefix, RunTimestamp},
    orchestrator::{Orchestrator, Phase, RunOptions},
    pipeline::{ItemOutcome, ItemPipeline},
    report::Verdict,
    storage::{ListedObject, ObjectMeta, ObjectStore, StorageError},
};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use time::macros::datetime;

#[derive(Default)]
struct MemStore {
    objects: RefCell<BTreeMap<(String, String), (Vec<u8>, ObjectMeta)>>,
    fail_puts: bool,
    fail_list: bool,
    fail_gets: bool,
    puts: Cell<usize>,
    gets: Cell<usize>,
}

impl MemStore {
    fn with(objects: &[(&str, &str, &str)]) -> Self {
        let store = MemStore::default();
        for (container, path, body) in objects {
            store.insert(container, path, body.as_bytes());
        }
        store
    }

    fn insert(&self, container: &str, path: &str, body: &[u8]) {
        self.objects.borrow_mut().insert(
            (container.to_string(), path.to_string()),
            (
                body.to_vec(),
                ObjectMeta {
                    size: body.len() as u64,
                    content_type: None,
                    metadata: BTreeMap::new(),
                },
            ),
        );
    }

    fn object(&self, container: &str, path: &str) -> Option<(Vec<u8>, ObjectMeta)> {
        self.objects
            .borrow()
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }
}

fn not_found(container: &str, path: &str) -> StorageError {
    StorageError::NotFound {
        container: container.to_string(),
        path: path.to_string(),
    }
}

impl ObjectStore for MemStore {
    fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<ListedObject>, StorageError> {
        if self.fail_list {
            return Err(StorageError::Io {
                op: "list",
                target: container.to_string(),
                source: std::io::Error::other("listing unavailable"),
            });
        }
        Ok(self
            .objects
            .borrow()
            .iter()
            .filter(|((c, p), _)| c == container && prefix.is_none_or(|pre| p.starts_with(pre)))
            .map(|((_, p), (body, _))| ListedObject {
                path: p.clone(),
                size: body.len() as u64,
            })
            .collect())
    }

    fn head(&self, container: &str, path: &str) -> Result<ObjectMeta, StorageError> {
        self.object(container, path)
            .map(|(_, meta)| meta)
            .ok_or_else(|| not_found(container, path))
    }

    fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, StorageError> {
        self.gets.set(self.gets.get() + 1);
        if self.fail_gets {
            return Err(StorageError::Io {
                op: "get",
                target: format!("{container}/{path}"),
                source: std::io::Error::other("connection reset"),
            });
        }
        self.object(container, path)
            .map(|(body, _)| body)
            .ok_or_else(|| not_found(container, path))
    }

    fn put(
        &self,
        container: &str,
        path: &str,
        body: &[u8],
        content_type: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        if self.fail_puts {
            return Err(StorageError::Io {
                op: "put",
                target: format!("{container}/{path}"),
                source: std::io::Error::other("access denied"),
            });
        }
        self.puts.set(self.puts.get() + 1);
        self.objects.borrow_mut().insert(
            (container.to_string(), path.to_string()),
            (
                body.to_vec(),
                ObjectMeta {
                    size: body.len() as u64,
                    content_type: Some(content_type.to_string()),
                    metadata: metadata.clone(),
                },
            ),
        );
        Ok(())
    }
}

/// Body `good...` converts, `fail` errors, `empty`/`none` yield no text,
/// `slow` converts after a short pause.
#[derive(Default)]
struct ScriptedEngine {
    calls: Cell<usize>,
}

impl Engine for ScriptedEngine {
    fn doctor(&self) -> Result<EngineDiag> {
        Ok(EngineDiag {
            ok: true,
            engine: Some("scripted".into()),
            version: None,
            error: None,
        })
    }

    fn convert(&self, document: &[u8]) -> Result<Conversion> {
        self.calls.set(self.calls.get() + 1);
        match document {
            b"fail" => Err(anyhow!("model crashed")),
            b"empty" => Ok(Conversion {
                markdown: Some(String::new()),
                metadata: BTreeMap::new(),
            }),
            b"none" => Ok(Conversion::default()),
            b"slow" => {
                std::thread::sleep(Duration::from_millis(50));
                Ok(Conversion {
                    markdown: Some("# slow".into()),
                    metadata: BTreeMap::new(),
                })
            }
            body => {
                let mut metadata = BTreeMap::new();
                metadata.insert("pages".to_string(), MetaValue::Integer(3));
                metadata.insert("title".to_string(), MetaValue::Text("Report".into()));
                metadata.insert(
                    "toc".to_string(),
                    MetaValue::Other(serde_json::json!([{"title": "Intro"}])),
                );
                Ok(Conversion {
                    markdown: Some(format!("# {}", String::from_utf8_lossy(body))),
                    metadata,
                })
            }
        }
    }
}

fn ts() -> RunTimestamp {
    RunTimestamp::at(datetime!(2025-01-02 03:04:05 UTC)).unwrap()
}

fn batch_mode() -> Mode {
    Mode::Batch {
        input_container: "inputs".into(),
        output: OutputPrefix::parse("outputs").unwrap(),
    }
}

fn single_mode(uri: &str) -> Mode {
    Mode::Single {
        source: ObjectRef::parse_uri(uri).unwrap(),
    }
}

#[test]
fn partial_conversion_failure_still_succeeds_with_warning() {
    let store = MemStore::with(&[("inputs", "a.pdf", "good a"), ("inputs", "b.pdf", "fail")]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();

    assert_eq!(report.stats.discovered, 2);
    assert_eq!(report.stats.converted, 1);
    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(report.stats.conversion_failures, 1);
    assert_eq!(report.stats.upload_failures, 0);
    assert!(report.is_success());
    assert!(report.warning().is_some());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.success_rate, Some(0.5));

    let (body, meta) = store
        .object(
            "outputs",
            "doc-reader-outputs/2025-01-02-03-04-05/a-2025-01-02-03-04-05.md",
        )
        .expect("markdown published");
    assert_eq!(body, b"# good a");
    assert_eq!(meta.content_type.as_deref(), Some("text/markdown"));
}

#[test]
fn published_metadata_forwards_only_scalars() {
    let store = MemStore::with(&[("inputs", "docs/a.pdf", "good")]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();
    assert!(report.is_success());

    let output = report.items[0].output.clone().expect("output location");
    let (_, meta) = store.object(&output.container, &output.path).unwrap();
    let md = &meta.metadata;
    assert_eq!(md["processing-timestamp"], "2025-01-02-03-04-05");
    assert_eq!(md["original-source-key"], "storage://inputs/docs/a.pdf");
    assert_eq!(md["original-filename"], "a.pdf");
    assert_eq!(md["content-type"], "text/markdown");
    assert_eq!(md["engine-pages"], "3");
    assert_eq!(md["engine-title"], "Report");
    assert!(!md.contains_key("engine-toc"));
}

#[test]
fn all_uploads_failing_is_a_failed_run() {
    let mut store = MemStore::with(&[("inputs", "a.pdf", "good a"), ("inputs", "b.pdf", "good b")]);
    store.fail_puts = true;
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();

    assert_eq!(report.stats.converted, report.stats.discovered);
    assert_eq!(report.stats.uploaded, 0);
    assert_eq!(report.stats.upload_failures, 2);
    assert!(!report.is_success());
    assert_eq!(report.error, Some(RunError::NoUploads { discovered: 2 }));
    assert_eq!(report.exit_code(), 1);
    assert!(matches!(
        report.verdict,
        Verdict::Failed {
            phase: Phase::Finalizing,
            ..
        }
    ));
}

#[test]
fn empty_discovery_is_fatal_without_processing() {
    let store = MemStore::with(&[("inputs", "notes.txt", "good"), ("other", "x.pdf", "good")]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();

    assert!(!report.is_success());
    assert!(matches!(report.error, Some(RunError::Discovery(_))));
    assert!(matches!(
        report.verdict,
        Verdict::Failed {
            phase: Phase::Discovering,
            ..
        }
    ));
    assert_eq!(engine.calls.get(), 0);
    assert_eq!(report.stats.discovered, 0);
    assert!(report.items.is_empty());
}

#[test]
fn listing_failure_is_a_discovery_error() {
    let mut store = MemStore::with(&[("inputs", "a.pdf", "good")]);
    store.fail_list = true;
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();
    assert!(matches!(report.error, Some(RunError::Discovery(_))));
    assert_eq!(engine.calls.get(), 0);
}

#[test]
fn discovery_filters_pdf_suffix_case_insensitively() {
    let store = MemStore::with(&[
        ("inputs", "a.PDF", "good"),
        ("inputs", "b.pdf", "good"),
        ("inputs", "c.docx", "good"),
    ]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();
    assert_eq!(report.stats.discovered, 2);
    assert_eq!(report.stats.uploaded, 2);
    assert_eq!(report.warning(), None);
}

#[test]
fn empty_markdown_counts_as_conversion_failure() {
    let store = MemStore::with(&[
        ("inputs", "a.pdf", "empty"),
        ("inputs", "b.pdf", "none"),
        ("inputs", "c.pdf", "good"),
    ]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();
    assert_eq!(report.stats.conversion_failures, 2);
    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(
        report.items[0].outcome,
        ItemOutcome::ConversionFailed {
            reason: "no content produced".into()
        }
    );
    assert_eq!(store.puts.get(), 1);
}

#[test]
fn single_mode_writes_markdown_beside_source() {
    let store = MemStore::with(&[("bucket", "docs/report.pdf", "good")]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(
        single_mode("storage://bucket/docs/report.pdf"),
        &store,
        &engine,
        ts(),
    )
    .run();

    assert!(report.is_success());
    assert_eq!(report.stats.discovered, 1);
    assert_eq!(
        report.items[0].output.as_ref().map(ToString::to_string).as_deref(),
        Some("storage://bucket/docs/report.md")
    );
    assert!(store.object("bucket", "docs/report.md").is_some());
}

#[test]
fn single_mode_missing_object_fails_validation() {
    let store = MemStore::default();
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(
        single_mode("storage://bucket/docs/missing.pdf"),
        &store,
        &engine,
        ts(),
    )
    .run();

    assert!(matches!(report.error, Some(RunError::Validation { .. })));
    assert!(matches!(
        report.verdict,
        Verdict::Failed {
            phase: Phase::Validating,
            ..
        }
    ));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(engine.calls.get(), 0);
}

#[test]
fn single_mode_wrong_extension_fails_validation() {
    let store = MemStore::with(&[("bucket", "docs/report.docx", "good")]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(
        single_mode("storage://bucket/docs/report.docx"),
        &store,
        &engine,
        ts(),
    )
    .run();

    assert!(matches!(report.error, Some(RunError::Validation { .. })));
    assert_eq!(engine.calls.get(), 0);
    assert_eq!(store.puts.get(), 0);
}

#[test]
fn pipeline_validate_classifies_outcomes() {
    let store = MemStore::with(&[("bucket", "a.txt", "x"), ("bucket", "b.pdf", "x")]);
    let engine = ScriptedEngine::default();
    let mode = single_mode("storage://bucket/b.pdf");
    let stamp = ts();
    let pipeline = ItemPipeline::new(&store, &engine, &mode, &stamp, 0);

    assert_eq!(
        pipeline.validate(&ObjectRef::new("bucket", "nope.pdf")).unwrap_err(),
        ItemOutcome::NotFound
    );
    assert!(matches!(
        pipeline.validate(&ObjectRef::new("bucket", "a.txt")).unwrap_err(),
        ItemOutcome::Skipped { .. }
    ));
    assert_eq!(pipeline.validate(&ObjectRef::new("bucket", "b.pdf")).unwrap().size, 1);
}

#[test]
fn oversized_documents_are_skipped() {
    let store = MemStore::with(&[("inputs", "big.pdf", "good and long"), ("inputs", "s.pdf", "good")]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts())
        .with_options(RunOptions {
            max_input_bytes: 8,
            run_timeout: None,
        })
        .run();

    assert_eq!(report.stats.skipped, 1);
    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(engine.calls.get(), 1);
    // The oversized document is never fetched.
    assert_eq!(store.gets.get(), 1);
    assert!(report.warning().is_some());
}

#[test]
fn interrupt_flag_aborts_with_130() {
    let store = MemStore::with(&[("inputs", "a.pdf", "good")]);
    let engine = ScriptedEngine::default();
    let flag = Arc::new(AtomicBool::new(true));

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts())
        .with_interrupt_flag(flag)
        .run();

    assert_eq!(report.error, Some(RunError::Interrupted));
    assert_eq!(report.exit_code(), 130);
    assert_eq!(engine.calls.get(), 0);
}

#[test]
fn plan_resolves_outputs_without_side_effects() {
    let store = MemStore::with(&[("inputs", "a.pdf", "good"), ("inputs", "b.txt", "good")]);
    let engine = ScriptedEngine::default();

    let entries = Orchestrator::new(batch_mode(), &store, &engine, ts())
        .plan()
        .unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].input, ObjectRef::new("inputs", "a.pdf"));
    assert_eq!(entries[0].output.container, "outputs");
    assert_eq!(engine.calls.get(), 0);
    assert_eq!(store.puts.get(), 0);
}

#[test]
fn summary_serializes_verdict_inline() {
    let store = MemStore::with(&[("inputs", "a.pdf", "good")]);
    let engine = ScriptedEngine::default();
    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["verdict"], "succeeded");
    assert_eq!(json["stats"]["uploaded"], 1);
    assert_eq!(json["items"][0]["outcome"]["status"], "processed");
}

#[test]
fn fetch_failure_is_a_conversion_failure_without_upload() {
    let mut store = MemStore::with(&[("inputs", "a.pdf", "good")]);
    store.fail_gets = true;
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts()).run();

    assert_eq!(report.stats.conversion_failures, 1);
    assert_eq!(report.stats.converted, 0);
    match &report.items[0].outcome {
        ItemOutcome::ConversionFailed { reason } => {
            assert!(reason.contains("connection reset"), "{reason}")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(engine.calls.get(), 0);
    assert_eq!(store.puts.get(), 0);
    assert_eq!(report.error, Some(RunError::NoUploads { discovered: 1 }));
}

#[test]
fn run_timeout_stops_before_the_next_item() {
    let store = MemStore::with(&[("inputs", "a.pdf", "slow"), ("inputs", "b.pdf", "good")]);
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(batch_mode(), &store, &engine, ts())
        .with_options(RunOptions {
            max_input_bytes: 0,
            run_timeout: Some(Duration::from_millis(10)),
        })
        .run();

    assert!(matches!(report.error, Some(RunError::TimedOut { .. })));
    assert!(matches!(
        report.verdict,
        Verdict::Failed {
            phase: Phase::Processing,
            ..
        }
    ));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(engine.calls.get(), 1);
    assert_eq!(report.items.len(), 1);
}

#[test]
fn single_mode_upload_failure_fails_the_run() {
    let mut store = MemStore::with(&[("bucket", "docs/report.pdf", "good")]);
    store.fail_puts = true;
    let engine = ScriptedEngine::default();

    let report = Orchestrator::new(
        single_mode("storage://bucket/docs/report.pdf"),
        &store,
        &engine,
        ts(),
    )
    .run();

    assert_eq!(report.stats.converted, 1);
    assert_eq!(report.stats.upload_failures, 1);
    assert_eq!(report.error, Some(RunError::NoUploads { discovered: 1 }));
    assert!(matches!(
        report.verdict,
        Verdict::Failed {
            phase: Phase::Finalizing,
            ..
        }
    ));
    assert_eq!(report.exit_code(), 1);
}
