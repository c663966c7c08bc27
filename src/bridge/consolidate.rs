//! Consolidation policies.
//!
//! Reducing N per-chunk partials into one per-document result is
//! task-specific business logic, so the rule is a pluggable policy value
//! each bridge carries rather than behavior baked into the driver. All
//! policies share the contract: one well-formed result per offset range,
//! with a neutral result when every partial in the range is `None`.

use std::collections::HashMap;

use crate::doc::{Entity, LabelScore, TaskResult};

use super::{validate_offsets, BridgeError, ChunkOffset};

/// Aggregation rule applied per document offset range.
#[derive(Debug, Clone)]
pub enum Consolidation {
    /// Per-label score sums averaged over the range's chunk count, sorted
    /// by score descending. Neutral: every label at 0.0.
    LabelScores { labels: Vec<String> },
    /// Set union of entities, deduplicated by (text, label), with scores
    /// averaged across duplicates. Neutral: no entities.
    EntityUnion,
    /// Chunk texts joined with a separator, scores averaged. Neutral: empty
    /// text with no score.
    TextJoin { separator: String },
}

impl Consolidation {
    pub fn consolidate(
        &self,
        partials: &[Option<TaskResult>],
        offsets: &[ChunkOffset],
    ) -> Result<Vec<TaskResult>, BridgeError> {
        validate_offsets(offsets, partials.len())?;

        let mut results = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let range = &partials[offset.start..offset.end];
            results.push(match self {
                Consolidation::LabelScores { labels } => {
                    consolidate_labels(labels, range, offset.len())
                }
                Consolidation::EntityUnion => consolidate_entities(range),
                Consolidation::TextJoin { separator } => consolidate_text(separator, range),
            });
        }
        Ok(results)
    }
}

fn consolidate_labels(labels: &[String], range: &[Option<TaskResult>], n_chunks: usize) -> TaskResult {
    let mut sums: HashMap<&str, f64> = labels.iter().map(|l| (l.as_str(), 0.0)).collect();

    for partial in range.iter().flatten() {
        if let TaskResult::Labels { labels: scored } = partial {
            for ls in scored {
                if let Some(sum) = sums.get_mut(ls.label.as_str()) {
                    // Unknown labels are dropped; scores clamped to [0, 1].
                    *sum += ls.score.clamp(0.0, 1.0);
                }
            }
        }
    }

    let mut averaged: Vec<LabelScore> = labels
        .iter()
        .map(|label| LabelScore {
            label: label.clone(),
            score: sums[label.as_str()] / n_chunks as f64,
        })
        .collect();
    // Stable sort keeps declared label order on ties.
    averaged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    TaskResult::Labels { labels: averaged }
}

fn consolidate_entities(range: &[Option<TaskResult>]) -> TaskResult {
    // (text, label) → (first-seen index, collected scores)
    let mut seen: HashMap<(String, String), (usize, Vec<f64>)> = HashMap::new();
    let mut order: Vec<(String, String)> = Vec::new();

    for partial in range.iter().flatten() {
        if let TaskResult::Entities { entities } = partial {
            for entity in entities {
                let key = (entity.text.clone(), entity.label.clone());
                let entry = seen.entry(key.clone()).or_insert_with(|| {
                    order.push(key);
                    (order.len() - 1, Vec::new())
                });
                if let Some(score) = entity.score {
                    entry.1.push(score);
                }
            }
        }
    }

    let entities = order
        .into_iter()
        .map(|(text, label)| {
            let (_, scores) = &seen[&(text.clone(), label.clone())];
            let score = if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            };
            Entity { text, label, score }
        })
        .collect();

    TaskResult::Entities { entities }
}

fn consolidate_text(separator: &str, range: &[Option<TaskResult>]) -> TaskResult {
    let mut texts: Vec<&str> = Vec::new();
    let mut scores: Vec<f64> = Vec::new();

    for partial in range.iter().flatten() {
        if let TaskResult::Text { text, score } = partial {
            if !text.is_empty() {
                texts.push(text);
            }
            if let Some(s) = score {
                scores.push(*s);
            }
        }
    }

    TaskResult::Text {
        text: texts.join(separator).trim().to_string(),
        score: if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        },
    }
}
