//! Sequential task orchestration.
//!
//! A pipeline owns an ordered list of tasks plus the shared result cache,
//! runs documents through them in place, and dumps/restores itself via
//! [`PipelineConfig`] records.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use crate::cache::TaskCache;
use crate::config::{ConfigError, PipelineConfig, TaskOverrides, TaskRegistry};
use crate::doc::Document;
use crate::task::{Task, TaskError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Duplicate task id '{task_id}'")]
    DuplicateTaskId { task_id: String },

    #[error("Task '{task_id}' failed: {source}")]
    Task {
        task_id: String,
        #[source]
        source: TaskError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug)]
pub struct Pipeline {
    tasks: Vec<Box<dyn Task>>,
    cache: TaskCache,
}

impl Pipeline {
    /// Build a pipeline with the default in-memory cache. Task ids must be
    /// unique; results and meta are keyed by them.
    pub fn new(tasks: Vec<Box<dyn Task>>) -> Result<Self, PipelineError> {
        Self::with_cache(tasks, TaskCache::in_memory())
    }

    pub fn with_cache(tasks: Vec<Box<dyn Task>>, cache: TaskCache) -> Result<Self, PipelineError> {
        let mut seen = HashSet::new();
        for task in &tasks {
            if !seen.insert(task.id().to_string()) {
                return Err(PipelineError::DuplicateTaskId {
                    task_id: task.id().to_string(),
                });
            }
        }
        Ok(Self { tasks, cache })
    }

    /// Append a task, keeping ids unique.
    pub fn push(&mut self, task: Box<dyn Task>) -> Result<(), PipelineError> {
        if self.tasks.iter().any(|t| t.id() == task.id()) {
            return Err(PipelineError::DuplicateTaskId {
                task_id: task.id().to_string(),
            });
        }
        self.tasks.push(task);
        Ok(())
    }

    /// Append several tasks, keeping ids unique.
    pub fn add_tasks(&mut self, tasks: Vec<Box<dyn Task>>) -> Result<(), PipelineError> {
        for task in tasks {
            self.push(task)?;
        }
        Ok(())
    }

    /// Join two pipelines into one, preserving order. The left cache is kept.
    pub fn concat(mut self, other: Pipeline) -> Result<Self, PipelineError> {
        for task in other.tasks {
            self.push(task)?;
        }
        Ok(self)
    }

    pub fn get(&self, task_id: &str) -> Option<&dyn Task> {
        self.tasks
            .iter()
            .find(|t| t.id() == task_id)
            .map(|t| t.as_ref())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &dyn Task> {
        self.tasks.iter().map(|t| t.as_ref())
    }

    pub fn cache(&self) -> &TaskCache {
        &self.cache
    }

    /// Run every task over the documents, in order. A task error stops the
    /// pipeline; results written by earlier tasks stay on the documents.
    pub fn run(&self, docs: &mut [Document]) -> Result<(), PipelineError> {
        tracing::info!(tasks = self.tasks.len(), documents = docs.len(), "Pipeline started");
        for task in &self.tasks {
            let started = Instant::now();
            task.run(docs, &self.cache)
                .map_err(|source| PipelineError::Task {
                    task_id: task.id().to_string(),
                    source,
                })?;
            tracing::info!(
                task_id = %task.id(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task finished"
            );
        }
        Ok(())
    }

    /// Declarative form of this pipeline: one record per task, in order.
    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::new(self.tasks.iter().map(|t| t.record()).collect())
    }

    pub fn dump(&self, path: &Path) -> Result<(), PipelineError> {
        self.config().dump(path)?;
        Ok(())
    }

    /// Restore from a config. `overrides` supplies runtime objects for
    /// placeholder fields, keyed by task id; a placeholder with no override
    /// is a [`ConfigError::MissingOverride`].
    pub fn from_config(
        config: &PipelineConfig,
        registry: &TaskRegistry,
        overrides: &HashMap<String, TaskOverrides>,
    ) -> Result<Self, PipelineError> {
        config.check_version()?;
        let none = TaskOverrides::new();
        let mut tasks = Vec::with_capacity(config.tasks.len());
        for record in &config.tasks {
            let task_id = record.task_id()?;
            let task_overrides = overrides.get(&task_id).unwrap_or(&none);
            tasks.push(registry.build(record, task_overrides)?);
        }
        Self::new(tasks)
    }

    pub fn load(
        path: &Path,
        registry: &TaskRegistry,
        overrides: &HashMap<String, TaskOverrides>,
    ) -> Result<Self, PipelineError> {
        let config = PipelineConfig::load(path)?;
        Self::from_config(&config, registry, overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use crate::chunk::SlidingWindowChunker;
    use crate::doc::{ChunkSpan, TaskResult, TaskState};
    use crate::engine::{Engine, MockEngine};
    use crate::task::{
        condition, ChunkingTask, Classification, ClassificationMode, CleaningTask,
        PredictiveParams, Summarization,
    };

    fn classification(engine: Arc<dyn Engine>, params: PredictiveParams) -> Classification {
        Classification::new(
            params,
            vec!["urgent".into(), "routine".into()],
            BTreeMap::new(),
            ClassificationMode::MultiLabel,
            engine,
        )
    }

    #[test]
    fn duplicate_task_ids_are_rejected() {
        let err = Pipeline::new(vec![
            Box::new(CleaningTask::new("same")),
            Box::new(CleaningTask::new("same")),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateTaskId { .. }));

        let mut pipeline = Pipeline::new(vec![Box::new(CleaningTask::new("clean"))]).unwrap();
        assert!(pipeline.push(Box::new(CleaningTask::new("clean"))).is_err());
    }

    #[test]
    fn concat_preserves_order_and_uniqueness() {
        let left = Pipeline::new(vec![Box::new(CleaningTask::new("clean"))]).unwrap();
        let right = Pipeline::new(vec![Box::new(ChunkingTask::new(
            "chunk",
            Arc::new(SlidingWindowChunker::new(100, 10)),
        ))])
        .unwrap();

        let joined = left.concat(right).unwrap();
        let ids: Vec<_> = joined.tasks().map(|t| t.id().to_string()).collect();
        assert_eq!(ids, vec!["clean", "chunk"]);
        assert!(joined.get("chunk").is_some());
        assert!(joined.get("missing").is_none());
    }

    #[test]
    fn conditional_task_skips_gated_documents() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "urgent", "score": 0.9}, {"label": "routine", "score": 0.1}]}"#
                .into(),
        ]));
        let gated = classification(
            Arc::clone(&engine) as Arc<dyn Engine>,
            PredictiveParams::new("triage").condition(condition(|d: &Document| {
                d.text().is_some_and(|t| t.contains("help"))
            })),
        );
        let pipeline = Pipeline::new(vec![Box::new(gated)]).unwrap();

        let mut docs = vec![
            Document::new("please send help now"),
            Document::new("weekly status update"),
        ];
        pipeline.run(&mut docs).unwrap();

        assert_eq!(docs[0].task_state("triage"), Some(TaskState::Done));
        assert!(docs[0].results.contains_key("triage"));
        assert_eq!(docs[1].task_state("triage"), Some(TaskState::Skipped));
        assert!(!docs[1].results.contains_key("triage"));
        assert_eq!(engine.requests_seen(), 1);
    }

    #[test]
    fn skipped_documents_still_flow_to_later_tasks_in_order() {
        // Middle document fails the gate; the follow-on task must still see
        // all three, in input order.
        let triage_engine = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "urgent", "score": 0.9}, {"label": "routine", "score": 0.1}]}"#
                .into(),
            r#"{"labels": [{"label": "urgent", "score": 0.8}, {"label": "routine", "score": 0.2}]}"#
                .into(),
        ]));
        let summary_engine = Arc::new(MockEngine::new(vec![
            r#"{"summary": "Fire."}"#.into(),
            r#"{"summary": "Memo."}"#.into(),
            r#"{"summary": "Flood."}"#.into(),
        ]));

        let gated = classification(
            Arc::clone(&triage_engine) as Arc<dyn Engine>,
            PredictiveParams::new("triage").condition(condition(|d: &Document| {
                d.text().is_some_and(|t| !t.contains("routine"))
            })),
        );
        let pipeline = Pipeline::new(vec![
            Box::new(gated),
            Box::new(Summarization::new(
                PredictiveParams::new("summary"),
                None,
                false,
                Arc::clone(&summary_engine) as Arc<dyn Engine>,
            )),
        ])
        .unwrap();

        let texts = ["fire in the building", "routine weekly memo", "flood warning issued"];
        let mut docs: Vec<_> = texts.iter().map(|t| Document::new(*t)).collect();
        pipeline.run(&mut docs).unwrap();

        // Order and count untouched.
        let seen: Vec<_> = docs.iter().map(|d| d.text().unwrap()).collect();
        assert_eq!(seen, texts);

        // Gated task: results for docs 1 and 3, no entry for doc 2.
        assert!(docs[0].results.contains_key("triage"));
        assert!(docs[2].results.contains_key("triage"));
        assert!(!docs[1].results.contains_key("triage"));
        assert_eq!(docs[1].task_state("triage"), Some(TaskState::Skipped));
        assert_eq!(triage_engine.requests_seen(), 2);

        // Follow-on task processed every document, skipped one included.
        assert_eq!(summary_engine.requests_seen(), 3);
        for doc in &docs {
            assert_eq!(doc.task_state("summary"), Some(TaskState::Done));
        }
        assert_eq!(
            crate::task::result_text(&docs[1].results["summary"]),
            Some("Memo.")
        );
    }

    #[test]
    fn chunked_document_consolidates_across_engine_outputs() {
        // Four chunks, one of them unparseable → counted in the average.
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "urgent", "score": 1.0}, {"label": "routine", "score": 0.0}]}"#.into(),
            "not json at all".into(),
            r#"{"labels": [{"label": "urgent", "score": 0.5}, {"label": "routine", "score": 0.5}]}"#.into(),
            r#"{"labels": [{"label": "urgent", "score": 0.5}, {"label": "routine", "score": 0.1}]}"#.into(),
        ]));
        let task = classification(engine, PredictiveParams::new("triage"));
        let pipeline = Pipeline::new(vec![Box::new(task)]).unwrap();

        let mut doc = Document::new("aaaa bbbb cccc dddd");
        doc.set_chunks(vec![
            ChunkSpan::new(0, 4),
            ChunkSpan::new(5, 9),
            ChunkSpan::new(10, 14),
            ChunkSpan::new(15, 19),
        ]);
        let mut docs = vec![doc];
        pipeline.run(&mut docs).unwrap();

        let TaskResult::Labels { labels: scores } = &docs[0].results["triage"] else {
            panic!("expected label scores");
        };
        assert_eq!(scores[0].label, "urgent");
        assert!((scores[0].score - 0.5).abs() < 1e-9);
        assert!((scores[1].score - 0.15).abs() < 1e-9);
    }

    #[test]
    fn rerun_on_unchanged_documents_is_idempotent() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "urgent", "score": 0.7}, {"label": "routine", "score": 0.3}]}"#
                .into(),
        ]));
        let task = classification(Arc::clone(&engine) as Arc<dyn Engine>, PredictiveParams::new("triage"));
        let pipeline = Pipeline::new(vec![Box::new(task)]).unwrap();

        let mut docs = vec![Document::new("the server is on fire")];
        pipeline.run(&mut docs).unwrap();
        let first = docs[0].results["triage"].clone();

        let mut docs_again = vec![Document::new("the server is on fire")];
        pipeline.run(&mut docs_again).unwrap();

        assert_eq!(engine.calls(), 1);
        assert!(docs_again[0].meta["triage"].cached);
        assert_eq!(docs_again[0].results["triage"], first);
    }

    #[test]
    fn failed_task_preserves_earlier_results() {
        let good = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "urgent", "score": 0.9}, {"label": "routine", "score": 0.1}]}"#
                .into(),
        ]));
        let bad = Arc::new(MockEngine::new(vec!["unused".into()]));
        bad.fail_with("backend unavailable");

        let pipeline = Pipeline::new(vec![
            Box::new(classification(good, PredictiveParams::new("triage"))),
            Box::new(Summarization::new(
                PredictiveParams::new("summary"),
                None,
                false,
                bad,
            )),
        ])
        .unwrap();

        let mut docs = vec![Document::new("some incident report")];
        let err = pipeline.run(&mut docs).unwrap_err();

        assert!(matches!(err, PipelineError::Task { ref task_id, .. } if task_id == "summary"));
        assert!(docs[0].results.contains_key("triage"));
        assert!(!docs[0].results.contains_key("summary"));
    }

    #[test]
    fn dump_and_load_restore_an_equivalent_runnable_pipeline() {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "urgent", "score": 0.9}, {"label": "routine", "score": 0.1}]}"#
                .into(),
        ]));
        let chunker: Arc<dyn crate::chunk::Chunker> = Arc::new(SlidingWindowChunker::new(200, 20));

        let pipeline = Pipeline::new(vec![
            Box::new(CleaningTask::new("clean")),
            Box::new(ChunkingTask::new("chunk", Arc::clone(&chunker))),
            Box::new(classification(
                Arc::clone(&engine),
                PredictiveParams::new("triage"),
            )),
        ])
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        pipeline.dump(&path).unwrap();

        let registry = TaskRegistry::builtin();
        let overrides = HashMap::from([
            (
                "chunk".to_string(),
                TaskOverrides::new().with_chunker("chunker", chunker),
            ),
            (
                "triage".to_string(),
                TaskOverrides::new().with_engine("engine", engine),
            ),
        ]);
        let restored = Pipeline::load(&path, &registry, &overrides).unwrap();

        let ids: Vec<_> = restored.tasks().map(|t| t.id().to_string()).collect();
        assert_eq!(ids, vec!["clean", "chunk", "triage"]);
        assert_eq!(
            restored.config().tasks[2].fingerprint(),
            pipeline.config().tasks[2].fingerprint()
        );

        // Restored pipeline must actually run, not just deserialize.
        let mut docs = vec![Document::new("server   room is\n\n\n\non fire")];
        restored.run(&mut docs).unwrap();

        assert_eq!(docs[0].text(), Some("server room is\n\non fire"));
        assert_eq!(docs[0].task_state("triage"), Some(TaskState::Done));
        let TaskResult::Labels { labels } = &docs[0].results["triage"] else {
            panic!("expected label scores");
        };
        assert_eq!(labels[0].label, "urgent");
        assert!((labels[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn load_without_required_override_fails() {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new(vec![]));
        let pipeline = Pipeline::new(vec![Box::new(classification(
            engine,
            PredictiveParams::new("triage"),
        ))])
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        pipeline.dump(&path).unwrap();

        let err = Pipeline::load(&path, &TaskRegistry::builtin(), &HashMap::new()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::MissingOverride { .. })
        ));
    }
}
