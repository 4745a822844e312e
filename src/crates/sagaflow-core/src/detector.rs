//! Loop detector - windowed scoring over recent progress
//!
//! The detector watches the last W progress entries (default 5) and scores
//! four weighted signals: exact action repetition, semantic similarity of
//! outputs, lack of progress, and frustration signals. An auxiliary
//! oscillation score catches period-p action cycles (A,B,A,B,...). The
//! decision rule short-circuits on saturated cheap scores before paying for
//! the semantic similarity calculator.
//!
//! One quirk is preserved deliberately: the exact-repetition and no-progress
//! early returns floor confidence at the recovery threshold even when the
//! weighted score alone would sit below it. That is a thresholding
//! convention, not a calibrated probability.

use serde::{Deserialize, Serialize};

use sagaflow_journal::{LoopKind, RecoveryStrategy};

use crate::error::{Result, WorkflowError};
use crate::ledger::{ProgressEntry, ProgressSignal};

const SATURATION_EPSILON: f64 = 1e-6;

/// Pluggable similarity oracle over step outputs
///
/// Implementations typically embed the outputs and return the maximum
/// pairwise cosine similarity. The detector only consults it when the cheap
/// scores have not already saturated.
pub trait SemanticSimilarityCalculator: Send + Sync {
    fn max_pairwise_similarity(&self, outputs: &[String]) -> f64;
}

/// Similarity oracle that reports nothing; semantic detection is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSimilarity;

impl SemanticSimilarityCalculator for NullSimilarity {
    fn max_pairwise_similarity(&self, _outputs: &[String]) -> f64 {
        0.0
    }
}

/// Cosine similarity between two embedding vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Similarity oracle over a caller-provided embedding function
pub struct EmbeddingSimilarity<F>
where
    F: Fn(&str) -> Vec<f32> + Send + Sync,
{
    embed: F,
}

impl<F> EmbeddingSimilarity<F>
where
    F: Fn(&str) -> Vec<f32> + Send + Sync,
{
    pub fn new(embed: F) -> Self {
        Self { embed }
    }
}

impl<F> SemanticSimilarityCalculator for EmbeddingSimilarity<F>
where
    F: Fn(&str) -> Vec<f32> + Send + Sync,
{
    fn max_pairwise_similarity(&self, outputs: &[String]) -> f64 {
        let embeddings: Vec<Vec<f32>> = outputs.iter().map(|o| (self.embed)(o)).collect();
        let mut max = 0.0f64;
        for i in 0..embeddings.len() {
            for j in (i + 1)..embeddings.len() {
                let sim = cosine_similarity(&embeddings[i], &embeddings[j]);
                if sim > max {
                    max = sim;
                }
            }
        }
        max
    }
}

/// Component weights; must sum to 1.0
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectorWeights {
    pub repetition: f64,
    pub semantic: f64,
    pub no_progress: f64,
    pub frustration: f64,
}

impl Default for DetectorWeights {
    fn default() -> Self {
        Self {
            repetition: 0.4,
            semantic: 0.3,
            no_progress: 0.2,
            frustration: 0.1,
        }
    }
}

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Observation window W
    pub window: usize,
    pub similarity_threshold: f64,
    pub recovery_threshold: f64,
    pub oscillation_threshold: f64,
    pub weights: DetectorWeights,
    /// Recovery attempts before the engine aborts with a loop-detection
    /// failure
    pub max_resets: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: 5,
            similarity_threshold: 0.85,
            recovery_threshold: 0.7,
            oscillation_threshold: 0.8,
            weights: DetectorWeights::default(),
            max_resets: 3,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(WorkflowError::Validation(
                "detector window must be at least 2".to_string(),
            ));
        }
        let sum = self.weights.repetition
            + self.weights.semantic
            + self.weights.no_progress
            + self.weights.frustration;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(WorkflowError::Validation(format!(
                "detector weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

/// Outcome of one detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopVerdict {
    pub detected: bool,
    pub loop_kind: Option<LoopKind>,
    pub confidence: f64,
    pub strategy: Option<RecoveryStrategy>,
    pub diagnostic: String,
}

impl LoopVerdict {
    fn none(diagnostic: impl Into<String>, confidence: f64) -> Self {
        Self {
            detected: false,
            loop_kind: None,
            confidence,
            strategy: None,
            diagnostic: diagnostic.into(),
        }
    }

    fn detected(kind: LoopKind, confidence: f64, diagnostic: impl Into<String>) -> Self {
        Self {
            detected: true,
            loop_kind: Some(kind),
            confidence,
            strategy: Some(default_strategy(kind)),
            diagnostic: diagnostic.into(),
        }
    }
}

/// Default loop-kind to recovery-strategy mapping
pub fn default_strategy(kind: LoopKind) -> RecoveryStrategy {
    match kind {
        LoopKind::ExactRepetition => RecoveryStrategy::InjectVariation,
        LoopKind::SemanticRepetition => RecoveryStrategy::ForceRotation,
        LoopKind::Oscillation => RecoveryStrategy::Synthesize,
        LoopKind::NoProgress => RecoveryStrategy::Decompose,
    }
}

/// Windowed loop detector
pub struct LoopDetector {
    config: DetectorConfig,
    similarity: Box<dyn SemanticSimilarityCalculator>,
}

impl LoopDetector {
    pub fn new(
        config: DetectorConfig,
        similarity: Box<dyn SemanticSimilarityCalculator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, similarity })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: DetectorConfig::default(),
            similarity: Box::new(NullSimilarity),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Run the decision rule over the most recent entries
    pub fn detect(&self, recent: &[ProgressEntry]) -> LoopVerdict {
        let w = self.config.window;
        if recent.len() < w {
            return LoopVerdict::none(
                format!("insufficient data: {} of {w} entries", recent.len()),
                0.0,
            );
        }
        let window = &recent[recent.len() - w..];

        let repetition = repetition_score(window);
        let no_progress = no_progress_score(window);
        let frustration = frustration_score(window);

        // Semantic similarity is the expensive component; skip it when a
        // cheap score has already saturated.
        let cheap_saturated = repetition >= 1.0 - SATURATION_EPSILON
            || no_progress >= 1.0 - SATURATION_EPSILON;
        let semantic = if cheap_saturated {
            0.0
        } else {
            let outputs: Vec<String> = window.iter().map(|e| e.output.clone()).collect();
            self.similarity.max_pairwise_similarity(&outputs)
        };

        let weights = &self.config.weights;
        let weighted = weights.repetition * repetition
            + weights.semantic * semantic
            + weights.no_progress * no_progress
            + weights.frustration * frustration;

        if repetition >= 1.0 - SATURATION_EPSILON {
            return LoopVerdict::detected(
                LoopKind::ExactRepetition,
                weighted.max(self.config.recovery_threshold),
                format!("all {w} recent actions identical"),
            );
        }
        if no_progress >= 1.0 - SATURATION_EPSILON {
            return LoopVerdict::detected(
                LoopKind::NoProgress,
                weighted.max(self.config.recovery_threshold),
                format!("no progress across {w} recent entries"),
            );
        }

        let oscillation = oscillation_score(window);
        if oscillation >= self.config.oscillation_threshold {
            return LoopVerdict::detected(
                LoopKind::Oscillation,
                oscillation,
                format!("periodic action cycle, score {oscillation:.2}"),
            );
        }

        if semantic >= self.config.similarity_threshold {
            return LoopVerdict::detected(
                LoopKind::SemanticRepetition,
                semantic,
                format!("output similarity {semantic:.2} above threshold"),
            );
        }

        if weighted >= self.config.recovery_threshold {
            let kind = if repetition >= no_progress && repetition >= semantic {
                LoopKind::ExactRepetition
            } else if no_progress >= semantic {
                LoopKind::NoProgress
            } else {
                LoopKind::SemanticRepetition
            };
            return LoopVerdict::detected(
                kind,
                weighted,
                format!("weighted score {weighted:.2} above recovery threshold"),
            );
        }

        LoopVerdict::none(
            format!(
                "no loop: repetition {repetition:.2}, semantic {semantic:.2}, \
                 no_progress {no_progress:.2}, frustration {frustration:.2}"
            ),
            weighted,
        )
    }
}

/// Fraction of the window occupied by the most common action
fn repetition_score(window: &[ProgressEntry]) -> f64 {
    let mut best = 0usize;
    for entry in window {
        let count = window.iter().filter(|e| e.action == entry.action).count();
        if count > best {
            best = count;
        }
    }
    best as f64 / window.len() as f64
}

fn no_progress_score(window: &[ProgressEntry]) -> f64 {
    let stalled = window.iter().filter(|e| !e.progress_made).count();
    stalled as f64 / window.len() as f64
}

fn frustration_score(window: &[ProgressEntry]) -> f64 {
    let frustrated = window
        .iter()
        .filter(|e| {
            matches!(
                e.signal,
                Some(ProgressSignal::HelpNeeded) | Some(ProgressSignal::Failure)
            )
        })
        .count();
    frustrated as f64 / window.len() as f64
}

/// Max over periods p in [2, W/2] of the fraction of positions i >= p whose
/// action matches action[i mod p]
fn oscillation_score(window: &[ProgressEntry]) -> f64 {
    let w = window.len();
    let mut best = 0.0f64;
    for period in 2..=(w / 2) {
        let positions = w - period;
        if positions == 0 {
            continue;
        }
        let matching = (period..w)
            .filter(|&i| window[i].action == window[i % period].action)
            .count();
        let score = matching as f64 / positions as f64;
        if score > best {
            best = score;
        }
    }
    best
}
