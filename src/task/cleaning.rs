//! Deterministic text cleanup ahead of model-backed tasks.

use std::sync::OnceLock;

use regex::Regex;

use crate::cache::TaskCache;
use crate::config::{ConfigError, FieldValue, TaskOverrides, TaskRecord};
use crate::doc::{Document, ResultKind, TaskMeta, TaskState};
use crate::task::{Task, TaskError};

pub struct CleaningTask {
    task_id: String,
}

impl CleaningTask {
    pub const CLASS_ID: &'static str = "docsieve.Cleaning";

    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
        }
    }

    pub fn from_record(
        record: &TaskRecord,
        _overrides: &TaskOverrides,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            task_id: record.literal("task_id")?,
        })
    }
}

/// Collapse whitespace runs, strip control characters and normalize line
/// endings. Tabs become spaces; blank-line runs collapse to one blank line.
pub fn normalize_text(text: &str) -> String {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static TRAILING: OnceLock<Regex> = OnceLock::new();
    static BLANK_RUNS: OnceLock<Regex> = OnceLock::new();

    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let stripped: String = unified
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect();

    let spaces = SPACES.get_or_init(|| Regex::new(r"[ \t]+").expect("valid regex"));
    let trailing = TRAILING.get_or_init(|| Regex::new(r" +\n").expect("valid regex"));
    let blank_runs = BLANK_RUNS.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let collapsed = spaces.replace_all(&stripped, " ");
    let no_trailing = trailing.replace_all(&collapsed, "\n");
    blank_runs.replace_all(&no_trailing, "\n\n").trim().to_string()
}

impl Task for CleaningTask {
    fn id(&self) -> &str {
        &self.task_id
    }

    fn result_kind(&self) -> Option<ResultKind> {
        None
    }

    fn run(&self, docs: &mut [Document], _cache: &TaskCache) -> Result<(), TaskError> {
        for doc in docs.iter_mut() {
            let Some(text) = doc.text() else {
                return Err(TaskError::MissingText {
                    identity: doc.identity(),
                });
            };
            let cleaned = normalize_text(text);
            // Only rewrite on change: set_text recomputes identity, which
            // would invalidate cached results for an already-clean document.
            if cleaned != text {
                tracing::debug!(
                    task_id = %self.task_id,
                    identity = %doc.identity(),
                    "Text normalized, identity recomputed"
                );
                doc.set_text(cleaned);
            }
            doc.meta
                .insert(self.task_id.clone(), TaskMeta::with_state(TaskState::Done));
        }
        Ok(())
    }

    fn record(&self) -> TaskRecord {
        TaskRecord::new(Self::CLASS_ID).with_field("task_id", FieldValue::literal(&self.task_id))
    }
}
