use crate::types::{Confidence, ScenarioResult, ScenarioScore, ScenarioStatus, VerificationResult};
use assay_core::Priority;
use assay_resilience::GuardedLlm;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Score variance below which a clean run is reported with high confidence.
pub const DEFAULT_VARIANCE_THRESHOLD: f64 = 0.04;

const COMMENTARY_SYSTEM_PROMPT: &str = "You review QA verification results. \
Reply with at most three sentences on how well the results support the stated \
business goals. Do not restate scores.";

/// Aggregates settled scenario results into a quality verdict.
///
/// Scoring is deterministic. An optional model adds free-text commentary,
/// which never changes the score.
pub struct VerificationEngine {
    llm: Option<Arc<GuardedLlm>>,
    variance_threshold: f64,
}

impl VerificationEngine {
    pub fn new() -> Self {
        Self {
            llm: None,
            variance_threshold: DEFAULT_VARIANCE_THRESHOLD,
        }
    }

    pub fn with_llm(mut self, llm: Arc<GuardedLlm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_variance_threshold(mut self, threshold: f64) -> Self {
        self.variance_threshold = threshold;
        self
    }

    /// Score the results and, if a model is configured, attach commentary.
    pub async fn verify(
        &self,
        results: &[ScenarioResult],
        business_goals: &[String],
    ) -> VerificationResult {
        let mut verdict = self.score(results, business_goals);
        if let Some(llm) = &self.llm {
            let prompt = commentary_prompt(&verdict, results, business_goals);
            match llm.complete(Some(COMMENTARY_SYSTEM_PROMPT), &prompt).await {
                Ok(text) => verdict.commentary = Some(text.trim().to_string()),
                Err(e) => warn!(error = %e, "Verification commentary unavailable"),
            }
        }
        verdict
    }

    /// Deterministic verdict: priority-weighted mean where failed and
    /// timed-out scenarios score zero and are flagged.
    pub fn score(&self, results: &[ScenarioResult], business_goals: &[String]) -> VerificationResult {
        let mut per_scenario_scores = BTreeMap::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for r in results {
            let flagged = r.status.is_failure();
            let score = if flagged {
                0.0
            } else {
                r.score.unwrap_or(0.0).clamp(0.0, 1.0)
            };
            let weight = r.priority.weight();
            weighted += score * weight;
            total_weight += weight;
            per_scenario_scores.insert(
                r.scenario_id,
                ScenarioScore {
                    score,
                    priority: r.priority,
                    flagged,
                },
            );
        }

        let overall_score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };
        let scores: Vec<f64> = per_scenario_scores.values().map(|s| s.score).collect();
        let confidence = self.confidence(results, variance(&scores));
        debug!(overall_score, %confidence, scenarios = results.len(), "Verdict computed");

        VerificationResult {
            overall_score,
            confidence,
            business_alignment: business_alignment(overall_score, results, business_goals),
            per_scenario_scores,
            commentary: None,
        }
    }

    fn confidence(&self, results: &[ScenarioResult], variance: f64) -> Confidence {
        if results.is_empty() {
            return Confidence::Low;
        }
        let failures: Vec<&ScenarioResult> =
            results.iter().filter(|r| r.status.is_failure()).collect();
        if failures.is_empty() && variance < self.variance_threshold {
            Confidence::High
        } else if failures.iter().all(|r| r.priority <= Priority::Medium) {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

impl Default for VerificationEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Population variance.
fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

fn business_alignment(overall: f64, results: &[ScenarioResult], goals: &[String]) -> String {
    if results.is_empty() {
        return "No scenarios were executed; business alignment cannot be assessed.".into();
    }
    let count = |status: ScenarioStatus| results.iter().filter(|r| r.status == status).count();
    let mut text = format!(
        "{} of {} scenarios passed ({} failed, {} timed out); weighted score {:.2}.",
        count(ScenarioStatus::Succeeded),
        results.len(),
        count(ScenarioStatus::Failed),
        count(ScenarioStatus::TimedOut),
        overall
    );

    let blocking: Vec<&str> = results
        .iter()
        .filter(|r| r.status.is_failure() && r.priority >= Priority::High)
        .map(|r| r.title.as_str())
        .collect();
    if goals.is_empty() {
        text.push_str(" No business goals were stated.");
    } else if blocking.is_empty() {
        text.push_str(&format!(
            " All high-priority scenarios passed for goals: {}.",
            goals.join("; ")
        ));
    } else {
        text.push_str(&format!(
            " Goals at risk ({}) due to high-priority failures: {}.",
            goals.join("; "),
            blocking.join(", ")
        ));
    }
    text
}

fn commentary_prompt(
    verdict: &VerificationResult,
    results: &[ScenarioResult],
    goals: &[String],
) -> String {
    let mut prompt = format!(
        "Business goals: {}\nOverall: {:.2} ({} confidence)\nScenarios:\n",
        if goals.is_empty() {
            "none stated".to_string()
        } else {
            goals.join("; ")
        },
        verdict.overall_score,
        verdict.confidence
    );
    for r in results {
        prompt.push_str(&format!(
            "- [{}] {} → {:?}{}\n",
            r.priority,
            r.title,
            r.status,
            r.detail
                .as_deref()
                .map(|d| format!(": {d}"))
                .unwrap_or_default()
        ));
    }
    prompt
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use assay_core::{AssayError, AssayResult};
    use assay_resilience::{CircuitBreaker, LlmBackend, RetryPolicy};
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    fn result(priority: Priority, status: ScenarioStatus, score: Option<f64>) -> ScenarioResult {
        ScenarioResult {
            scenario_id: Uuid::new_v4(),
            title: format!("{priority} scenario"),
            priority,
            capability: Some("test-design".into()),
            status,
            score,
            detail: None,
            failure: None,
            duration_ms: 5,
        }
    }

    #[test]
    fn weighted_mean_with_failures() {
        let results = vec![
            result(Priority::Critical, ScenarioStatus::Succeeded, Some(0.9)),
            result(Priority::High, ScenarioStatus::TimedOut, None),
            result(Priority::Low, ScenarioStatus::Failed, None),
        ];
        let verdict = VerificationEngine::new().score(&results, &[]);
        // (4 * 0.9 + 3 * 0 + 1 * 0) / 8
        assert!((verdict.overall_score - 0.45).abs() < 1e-9);
        assert_eq!(verdict.confidence, Confidence::Low);
        assert_eq!(verdict.flagged().len(), 2);
        assert!(verdict.per_scenario_scores[&results[1].scenario_id].flagged);
    }

    #[test]
    fn clean_consistent_run_is_high_confidence() {
        let results = vec![
            result(Priority::High, ScenarioStatus::Succeeded, Some(0.9)),
            result(Priority::Medium, ScenarioStatus::Succeeded, Some(0.85)),
        ];
        let verdict = VerificationEngine::new().score(&results, &["fast checkout".into()]);
        assert_eq!(verdict.confidence, Confidence::High);
        assert!(verdict.business_alignment.contains("fast checkout"));
        assert!(verdict.flagged().is_empty());
    }

    #[test]
    fn high_variance_clean_run_is_medium() {
        let results = vec![
            result(Priority::High, ScenarioStatus::Succeeded, Some(1.0)),
            result(Priority::High, ScenarioStatus::Succeeded, Some(0.2)),
        ];
        let verdict = VerificationEngine::new().score(&results, &[]);
        assert_eq!(verdict.confidence, Confidence::Medium);
    }

    #[test]
    fn low_priority_failure_is_medium() {
        let results = vec![
            result(Priority::Critical, ScenarioStatus::Succeeded, Some(1.0)),
            result(Priority::Low, ScenarioStatus::Failed, None),
        ];
        let verdict = VerificationEngine::new().score(&results, &["uptime".into()]);
        assert_eq!(verdict.confidence, Confidence::Medium);
        assert!(verdict.business_alignment.contains("All high-priority scenarios passed"));
    }

    #[test]
    fn empty_results() {
        let verdict = VerificationEngine::new().score(&[], &[]);
        assert_eq!(verdict.overall_score, 0.0);
        assert_eq!(verdict.confidence, Confidence::Low);
        assert!(verdict.per_scenario_scores.is_empty());
    }

    #[test]
    fn variance_of_constant_is_zero() {
        assert_eq!(variance(&[0.5, 0.5, 0.5]), 0.0);
        assert!((variance(&[0.0, 1.0]) - 0.25).abs() < 1e-12);
    }

    struct FixedBackend(AssayResult<String>);

    #[async_trait]
    impl LlmBackend for FixedBackend {
        async fn complete(&self, _system: Option<&str>, _prompt: &str) -> AssayResult<String> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(AssayError::Config(e.to_string())),
            }
        }
    }

    fn guarded(backend: FixedBackend) -> Arc<GuardedLlm> {
        Arc::new(GuardedLlm::new(
            Arc::new(backend),
            Arc::new(CircuitBreaker::default()),
            RetryPolicy::none(),
            Duration::from_secs(5),
        ))
    }

    #[tokio::test]
    async fn commentary_does_not_change_score() {
        let results = vec![result(Priority::High, ScenarioStatus::Succeeded, Some(0.8))];
        let plain = VerificationEngine::new().score(&results, &[]);
        let engine = VerificationEngine::new()
            .with_llm(guarded(FixedBackend(Ok("  Looks solid.  ".into()))));
        let verdict = engine.verify(&results, &[]).await;
        assert_eq!(verdict.overall_score, plain.overall_score);
        assert_eq!(verdict.confidence, plain.confidence);
        assert_eq!(verdict.commentary.as_deref(), Some("Looks solid."));
    }

    #[tokio::test]
    async fn commentary_failure_is_tolerated() {
        let results = vec![result(Priority::High, ScenarioStatus::Succeeded, Some(0.8))];
        let engine = VerificationEngine::new()
            .with_llm(guarded(FixedBackend(Err(AssayError::Config("rejected".into())))));
        let verdict = engine.verify(&results, &[]).await;
        assert!(verdict.commentary.is_none());
        assert!((verdict.overall_score - 0.8).abs() < 1e-9);
    }
}
