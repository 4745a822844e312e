//! Agent selector - Thompson sampling over (agent, task-category) beliefs
//!
//! Each (agent, category) pair carries a Beta(α, β) belief, weakly
//! informative at Beta(2, 2). Selection classifies the task description into
//! a category, draws θ ~ Beta(α, β) for every non-excluded candidate, and
//! picks the largest draw; ties break by encounter order. Observations feed
//! back through a compare-and-swap loop so concurrent recorders never lose
//! updates.
//!
//! Beta sampling follows Marsaglia–Tsang: θ = Γ(α) / (Γ(α) + Γ(β)), with
//! the shape-boost Γ(α) = Γ(α+1) · U^(1/α) below shape 1, and standard
//! normals from the Box–Muller transform.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use sagaflow_journal::{BeliefCell, BeliefStore, Clock};

use crate::error::{Result, WorkflowError};

/// Coarse task category driving belief lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    CodeGeneration,
    DataAnalysis,
    WebSearch,
    FileOperation,
    Reasoning,
    TextGeneration,
    General,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::CodeGeneration => "code_generation",
            TaskCategory::DataAnalysis => "data_analysis",
            TaskCategory::WebSearch => "web_search",
            TaskCategory::FileOperation => "file_operation",
            TaskCategory::Reasoning => "reasoning",
            TaskCategory::TextGeneration => "text_generation",
            TaskCategory::General => "general",
        }
    }
}

/// Ordered keyword table; earlier categories win on multi-matches, so
/// "analyze the code" classifies as code generation and "search the data"
/// as data analysis. The order is normative, not inferrable from keyword
/// semantics.
const KEYWORDS: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::CodeGeneration,
        &[
            "code", "implement", "function", "program", "script", "compile", "refactor", "debug",
        ],
    ),
    (
        TaskCategory::DataAnalysis,
        &[
            "data", "analyz", "analys", "statistic", "dataset", "chart", "metric",
        ],
    ),
    (
        TaskCategory::WebSearch,
        &["search", "web", "browse", "lookup", "online"],
    ),
    (
        TaskCategory::FileOperation,
        &["file", "directory", "folder", "copy", "move", "rename"],
    ),
    (
        TaskCategory::Reasoning,
        &["reason", "plan", "decide", "evaluate", "solve", "think"],
    ),
    (
        TaskCategory::TextGeneration,
        &["write", "summar", "draft", "translate", "compose", "essay"],
    ),
];

/// Classify a task description; first keyword match wins, blank input is
/// general
pub fn classify_task(description: &str) -> TaskCategory {
    let normalized = description.trim().to_lowercase();
    if normalized.is_empty() {
        return TaskCategory::General;
    }
    for (category, keywords) in KEYWORDS {
        if keywords.iter().any(|kw| normalized.contains(kw)) {
            return *category;
        }
    }
    TaskCategory::General
}

/// Observed outcome of an agent's attempt at a task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Partial credit in [0, 1]; overrides the success/failure unit update
    pub confidence: Option<f64>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            success: true,
            confidence: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            confidence: None,
        }
    }

    pub fn partial(confidence: f64) -> Self {
        Self {
            success: confidence >= 0.5,
            confidence: Some(confidence),
        }
    }

    fn credit(&self) -> f64 {
        match self.confidence {
            Some(c) => c.clamp(0.0, 1.0),
            None => {
                if self.success {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Inputs to a selection round
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub candidates: Vec<String>,
    pub description: String,
    pub excluded: Vec<String>,
}

/// Chosen agent plus the evidence behind the choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSelection {
    pub agent_id: String,
    pub category: TaskCategory,
    /// The winning posterior draw
    pub theta: f64,
    /// Observation-count ramp: min(1, observations / 20)
    pub confidence: f64,
}

/// Thompson-sampling selector over a persistent belief store
pub struct AgentSelector {
    beliefs: Arc<dyn BeliefStore>,
    clock: Arc<dyn Clock>,
    prior_alpha: f64,
    prior_beta: f64,
}

impl AgentSelector {
    pub fn new(beliefs: Arc<dyn BeliefStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            beliefs,
            clock,
            prior_alpha: 2.0,
            prior_beta: 2.0,
        }
    }

    fn prior_cell(&self, agent_id: &str, category: TaskCategory) -> BeliefCell {
        BeliefCell {
            agent_id: agent_id.to_string(),
            category: category.as_str().to_string(),
            alpha: self.prior_alpha,
            beta: self.prior_beta,
            observations: 0,
            updated_at: self.clock.now(),
        }
    }

    /// Select among candidates for the described task
    pub async fn select(&self, ctx: &SelectionContext) -> Result<AgentSelection> {
        self.select_with_rng(ctx, &mut StdRng::from_entropy()).await
    }

    /// Deterministic variant for tests
    pub async fn select_with_rng<R: Rng>(
        &self,
        ctx: &SelectionContext,
        rng: &mut R,
    ) -> Result<AgentSelection> {
        let category = classify_task(&ctx.description);
        let mut best: Option<(String, f64, u64)> = None;

        for candidate in &ctx.candidates {
            if ctx.excluded.contains(candidate) {
                continue;
            }
            let cell = self
                .beliefs
                .get(candidate, category.as_str())
                .await?
                .unwrap_or_else(|| self.prior_cell(candidate, category));
            let theta = sample_beta(cell.alpha, cell.beta, rng);
            // Strict comparison keeps the first of equal draws (encounter
            // order breaks ties).
            let better = match &best {
                Some((_, best_theta, _)) => theta > *best_theta,
                None => true,
            };
            if better {
                best = Some((candidate.clone(), theta, cell.observations));
            }
        }

        let (agent_id, theta, observations) = best.ok_or_else(|| {
            WorkflowError::Validation("no selectable candidate agents".to_string())
        })?;
        Ok(AgentSelection {
            agent_id,
            category,
            theta,
            confidence: (observations as f64 / 20.0).min(1.0),
        })
    }

    /// Fold an observed outcome into the belief cell
    ///
    /// Safe under concurrency: a compare-and-swap loop retries until the
    /// update lands on a consistent snapshot.
    pub async fn record_outcome(
        &self,
        agent_id: &str,
        category: TaskCategory,
        outcome: Outcome,
    ) -> Result<BeliefCell> {
        let credit = outcome.credit();
        loop {
            let current = self.beliefs.get(agent_id, category.as_str()).await?;
            let cell = current
                .clone()
                .unwrap_or_else(|| self.prior_cell(agent_id, category));
            let next = BeliefCell {
                agent_id: cell.agent_id.clone(),
                category: cell.category.clone(),
                alpha: cell.alpha + credit,
                beta: cell.beta + (1.0 - credit),
                observations: cell.observations + 1,
                updated_at: self.clock.now(),
            };
            if self
                .beliefs
                .compare_and_put(current.as_ref(), next.clone())
                .await?
            {
                return Ok(next);
            }
        }
    }

    /// Posterior mean α / (α + β)
    pub async fn mean(&self, agent_id: &str, category: TaskCategory) -> Result<f64> {
        let cell = self
            .beliefs
            .get(agent_id, category.as_str())
            .await?
            .unwrap_or_else(|| self.prior_cell(agent_id, category));
        Ok(cell.alpha / (cell.alpha + cell.beta))
    }

    /// Posterior variance αβ / ((α+β)²(α+β+1))
    pub async fn variance(&self, agent_id: &str, category: TaskCategory) -> Result<f64> {
        let cell = self
            .beliefs
            .get(agent_id, category.as_str())
            .await?
            .unwrap_or_else(|| self.prior_cell(agent_id, category));
        let total = cell.alpha + cell.beta;
        Ok(cell.alpha * cell.beta / (total * total * (total + 1.0)))
    }
}

/// Standard normal draw via Box–Muller
fn sample_standard_normal<R: Rng>(rng: &mut R) -> f64 {
    loop {
        let u1: f64 = rng.gen();
        if u1 <= f64::EPSILON {
            continue;
        }
        let u2: f64 = rng.gen();
        return (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    }
}

/// Gamma(shape, 1) draw via Marsaglia–Tsang
fn sample_gamma<R: Rng>(shape: f64, rng: &mut R) -> f64 {
    if shape < 1.0 {
        // Shape boost: Γ(a) = Γ(a + 1) · U^(1/a)
        let u: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
        return sample_gamma(shape + 1.0, rng) * u.powf(1.0 / shape);
    }
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (3.0 * d.sqrt());
    loop {
        let x = sample_standard_normal(rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }
        let u: f64 = rng.gen();
        if u < 1.0 - 0.0331 * x.powi(4) {
            return d * v;
        }
        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

/// Beta(α, β) draw as Γ(α) / (Γ(α) + Γ(β))
fn sample_beta<R: Rng>(alpha: f64, beta: f64, rng: &mut R) -> f64 {
    let x = sample_gamma(alpha, rng);
    let y = sample_gamma(beta, rng);
    if x + y == 0.0 {
        return 0.5;
    }
    x / (x + y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_journal::{MemoryJournal, SystemClock};

    fn selector() -> (AgentSelector, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new());
        let selector = AgentSelector::new(journal.clone(), Arc::new(SystemClock));
        (selector, journal)
    }

    #[test]
    fn test_classifier_priority_order() {
        assert_eq!(classify_task("Analyze the code"), TaskCategory::CodeGeneration);
        assert_eq!(classify_task("search the data warehouse"), TaskCategory::DataAnalysis);
        assert_eq!(classify_task("search the web for papers"), TaskCategory::WebSearch);
        assert_eq!(classify_task("move the file into place"), TaskCategory::FileOperation);
        assert_eq!(classify_task("decide between options"), TaskCategory::Reasoning);
        assert_eq!(classify_task("draft an announcement"), TaskCategory::TextGeneration);
        assert_eq!(classify_task("IMPLEMENT A PARSER"), TaskCategory::CodeGeneration);
        assert_eq!(classify_task("   "), TaskCategory::General);
        assert_eq!(classify_task(""), TaskCategory::General);
        assert_eq!(classify_task("make it nicer"), TaskCategory::General);
    }

    #[test]
    fn test_beta_samples_stay_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        for &(a, b) in &[(2.0, 2.0), (0.5, 0.5), (30.0, 1.0), (1.0, 30.0)] {
            for _ in 0..200 {
                let theta = sample_beta(a, b, &mut rng);
                assert!((0.0..=1.0).contains(&theta), "theta {theta} for ({a}, {b})");
            }
        }
    }

    #[test]
    fn test_gamma_mean_tracks_shape() {
        let mut rng = StdRng::seed_from_u64(11);
        let shape = 4.0;
        let n = 4000;
        let mean: f64 = (0..n).map(|_| sample_gamma(shape, &mut rng)).sum::<f64>() / n as f64;
        assert!((mean - shape).abs() < 0.3, "gamma mean {mean} far from {shape}");
    }

    #[tokio::test]
    async fn test_heavy_winner_is_selected_with_high_probability() {
        let (selector, _journal) = selector();
        for _ in 0..100 {
            selector
                .record_outcome("veteran", TaskCategory::CodeGeneration, Outcome::success())
                .await
                .unwrap();
        }

        let ctx = SelectionContext {
            candidates: vec!["rookie".to_string(), "veteran".to_string()],
            description: "implement the parser".to_string(),
            excluded: vec![],
        };

        let mut rng = StdRng::seed_from_u64(42);
        let mut veteran_wins = 0;
        for _ in 0..200 {
            let selection = selector.select_with_rng(&ctx, &mut rng).await.unwrap();
            if selection.agent_id == "veteran" {
                veteran_wins += 1;
            }
        }
        // 100 successes against a Beta(2,2) prior should dominate a
        // prior-only candidate well beyond 95% of draws.
        assert!(veteran_wins > 190, "veteran won only {veteran_wins}/200");
    }

    #[tokio::test]
    async fn test_excluded_candidates_are_skipped() {
        let (selector, _journal) = selector();
        let ctx = SelectionContext {
            candidates: vec!["a".to_string(), "b".to_string()],
            description: String::new(),
            excluded: vec!["a".to_string()],
        };
        let mut rng = StdRng::seed_from_u64(3);
        let selection = selector.select_with_rng(&ctx, &mut rng).await.unwrap();
        assert_eq!(selection.agent_id, "b");
    }

    #[tokio::test]
    async fn test_no_candidates_is_validation_error() {
        let (selector, _journal) = selector();
        let ctx = SelectionContext {
            candidates: vec![],
            description: String::new(),
            excluded: vec![],
        };
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            selector.select_with_rng(&ctx, &mut rng).await,
            Err(WorkflowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_belief_updates_are_monotonic() {
        let (selector, _journal) = selector();

        let after_success = selector
            .record_outcome("agent", TaskCategory::General, Outcome::success())
            .await
            .unwrap();
        assert_eq!(after_success.alpha, 3.0);
        assert_eq!(after_success.beta, 2.0);
        assert_eq!(after_success.observations, 1);

        let after_failure = selector
            .record_outcome("agent", TaskCategory::General, Outcome::failure())
            .await
            .unwrap();
        assert_eq!(after_failure.alpha, 3.0);
        assert_eq!(after_failure.beta, 3.0);

        let after_partial = selector
            .record_outcome("agent", TaskCategory::General, Outcome::partial(0.25))
            .await
            .unwrap();
        assert_eq!(after_partial.alpha, 3.25);
        assert_eq!(after_partial.beta, 3.75);

        // observations == (alpha + beta) - prior sum
        let prior_sum = 4.0;
        assert_eq!(
            after_partial.observations as f64,
            after_partial.alpha + after_partial.beta - prior_sum
        );
    }

    #[tokio::test]
    async fn test_concurrent_outcome_recording_loses_nothing() {
        let (selector, journal) = selector();
        let selector = Arc::new(selector);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let selector = selector.clone();
            handles.push(tokio::spawn(async move {
                selector
                    .record_outcome("agent", TaskCategory::General, Outcome::success())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let cell = journal
            .get("agent", TaskCategory::General.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cell.observations, 16);
        assert_eq!(cell.alpha, 18.0);
        assert_eq!(cell.beta, 2.0);
    }

    #[tokio::test]
    async fn test_posterior_moments() {
        let (selector, _journal) = selector();
        // Prior Beta(2,2): mean 0.5, variance 2*2 / (16 * 5) = 0.05.
        let mean = selector.mean("x", TaskCategory::General).await.unwrap();
        let variance = selector.variance("x", TaskCategory::General).await.unwrap();
        assert!((mean - 0.5).abs() < 1e-12);
        assert!((variance - 0.05).abs() < 1e-12);
    }
}
