use crate::registry::CapabilityRegistry;
use crate::types::{ExecutionMode, FailureReason, Requirement, Scenario, ScenarioStatus};
use assay_core::{AssayError, AssayResult, ComplexityClass, Priority};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

const MARKER_PATTERN: &str =
    r"(?i)^\s*(?:[-*]\s*)?scenario(?:\s*\d+)?\s*(?:[:)]|[.-]\s)\s*(.+)$";
const TAG_PATTERN: &str = r"\[\s*([^\[\]]+?)\s*\]";

/// Keywords that indicate the change touches code with wide blast radius.
const CODE_CHANGE_KEYWORDS: &[&str] = &[
    "refactor",
    "migration",
    "schema",
    "database",
    "concurrency",
    "rewrite",
    "upgrade",
    "api change",
];

/// Keywords that indicate direct business impact.
const BUSINESS_IMPACT_KEYWORDS: &[&str] = &[
    "payment",
    "checkout",
    "billing",
    "auth",
    "login",
    "security",
    "personal data",
    "pii",
    "compliance",
];

/// Risk in `[0, 1]` from priority plus keyword heuristics over the text.
pub fn risk_score(priority: Priority, text: &str) -> f64 {
    let baseline = match priority {
        Priority::Critical => 0.6,
        Priority::High => 0.45,
        Priority::Medium => 0.3,
        Priority::Low => 0.15,
    };
    let lower = text.to_lowercase();
    let hits = |words: &[&str]| words.iter().filter(|w| lower.contains(*w)).count() as f64;
    let code_change = (hits(CODE_CHANGE_KEYWORDS) * 0.1).min(0.2);
    let business = (hits(BUSINESS_IMPACT_KEYWORDS) * 0.15).min(0.3);
    (baseline + code_change + business).clamp(0.0, 1.0)
}

/// A scenario as parsed from text, before routing.
#[derive(Debug, Default)]
struct Draft {
    title: String,
    body: Vec<String>,
    capability: Option<String>,
    priority: Option<Priority>,
    after_previous: bool,
}

/// Turns requirements into routed scenarios.
pub struct DelegationEngine {
    registry: Arc<CapabilityRegistry>,
    marker: Regex,
    tag: Regex,
}

impl DelegationEngine {
    pub fn new(registry: Arc<CapabilityRegistry>) -> AssayResult<Self> {
        let compile = |p: &str| Regex::new(p).map_err(|e| AssayError::Config(e.to_string()));
        Ok(Self {
            registry,
            marker: compile(MARKER_PATTERN)?,
            tag: compile(TAG_PATTERN)?,
        })
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Decompose a requirement into scenarios and route each one.
    ///
    /// Scenarios that cannot be routed are returned with status `failed` and
    /// an `unroutable` failure reason; they are never dispatched.
    pub fn decompose(&self, requirement: &Requirement) -> Vec<Scenario> {
        let mut drafts = self.parse_markers(&requirement.description);
        if drafts.is_empty() {
            drafts = implicit_drafts(requirement);
        } else if let [only] = requirement.target_capabilities.as_slice() {
            for draft in drafts.iter_mut().filter(|d| d.capability.is_none()) {
                draft.capability = Some(only.clone());
            }
        }

        let scenarios: Vec<Scenario> = drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| self.route(draft, requirement, i == 0))
            .collect();

        debug!(
            title = %requirement.title,
            scenarios = scenarios.len(),
            unroutable = scenarios.iter().filter(|s| !s.is_routable()).count(),
            "Requirement decomposed"
        );
        scenarios
    }

    fn parse_markers(&self, description: &str) -> Vec<Draft> {
        let mut drafts: Vec<Draft> = Vec::new();
        for line in description.lines() {
            if let Some(caps) = self.marker.captures(line) {
                let raw = caps.get(1).map_or("", |m| m.as_str());
                drafts.push(self.parse_tags(raw));
            } else if let Some(current) = drafts.last_mut() {
                let text = line.trim();
                if !text.is_empty() {
                    current.body.push(text.to_string());
                }
            }
        }
        drafts
    }

    fn parse_tags(&self, raw: &str) -> Draft {
        let mut draft = Draft::default();
        for caps in self.tag.captures_iter(raw) {
            let Some(tag) = caps.get(1).map(|m| m.as_str().trim()) else {
                continue;
            };
            let lower = tag.to_lowercase();
            if let Some(cap) = tag.strip_prefix('@') {
                draft.capability = Some(cap.trim().to_string());
            } else if matches!(lower.as_str(), "after-previous" | "after previous" | "sequential")
            {
                draft.after_previous = true;
            } else if let Some((name, value)) = tag.split_once([':', '=']) {
                match name.trim().to_lowercase().as_str() {
                    "capability" | "cap" | "agent" => {
                        draft.capability = Some(value.trim().to_string());
                    }
                    "priority" => match Priority::parse(value) {
                        Some(p) => draft.priority = Some(p),
                        None => warn!(tag, "Ignoring unknown priority tag"),
                    },
                    _ => debug!(tag, "Ignoring unknown scenario tag"),
                }
            } else if let Some(p) = Priority::parse(tag) {
                draft.priority = Some(p);
            } else {
                debug!(tag, "Ignoring unknown scenario tag");
            }
        }
        let stripped = self.tag.replace_all(raw, " ");
        draft.title = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
        draft
    }

    fn route(&self, draft: Draft, requirement: &Requirement, first: bool) -> Scenario {
        let priority = draft.priority.unwrap_or(requirement.priority);
        let title = if draft.title.is_empty() {
            requirement.title.clone()
        } else {
            draft.title
        };
        let description = if draft.body.is_empty() {
            title.clone()
        } else {
            draft.body.join("\n")
        };
        let risk = risk_score(priority, &format!("{title}\n{description}"));
        let complexity = ComplexityClass::from_risk(risk);

        let resolved = match draft.capability.as_deref() {
            Some(tag) => self.registry.resolve(tag),
            None => self.registry.resolve_for_complexity(complexity),
        };
        let (assigned, status, failure) = match resolved {
            Ok(agent) => (Some(agent.key.clone()), ScenarioStatus::Pending, None),
            Err(e) => {
                let err = AssayError::Unroutable {
                    scenario: title.clone(),
                    reason: e.to_string(),
                };
                warn!(scenario = %title, reason = %e, "Scenario is unroutable");
                (None, ScenarioStatus::Failed, Some(FailureReason::from_error(&err)))
            }
        };

        Scenario {
            id: Uuid::new_v4(),
            title,
            description,
            priority,
            requested_capability: draft.capability,
            assigned_capability: assigned,
            risk_score: risk,
            complexity,
            mode: if draft.after_previous && !first {
                ExecutionMode::AfterPrevious
            } else {
                ExecutionMode::Parallel
            },
            status,
            failure,
        }
    }
}

/// One scenario per target capability, or a single untagged one.
fn implicit_drafts(requirement: &Requirement) -> Vec<Draft> {
    let description = requirement.description.trim();
    let body = if description.is_empty() {
        Vec::new()
    } else {
        vec![description.to_string()]
    };
    if requirement.target_capabilities.is_empty() {
        return vec![Draft {
            title: requirement.title.clone(),
            body,
            ..Draft::default()
        }];
    }
    requirement
        .target_capabilities
        .iter()
        .map(|cap| Draft {
            title: format!("{} ({})", requirement.title, cap.trim()),
            body: body.clone(),
            capability: Some(cap.clone()),
            ..Draft::default()
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn engine() -> DelegationEngine {
        DelegationEngine::new(Arc::new(CapabilityRegistry::with_defaults().unwrap())).unwrap()
    }

    fn requirement(description: &str) -> Requirement {
        Requirement {
            title: "Checkout flow".into(),
            description: description.into(),
            priority: Priority::Medium,
            ..Requirement::default()
        }
    }

    #[test]
    fn test_markers_with_tags() {
        let req = requirement(
            "Background text\n\
             Scenario 1: Card payment succeeds [capability: security-scan] [priority: critical]\n\
             Cardholder data never logged.\n\
             - scenario: Page loads under 2s [@perf] [high]\n\
             * Scenario 3) Old receipts still render [after-previous]",
        );
        let scenarios = engine().decompose(&req);
        assert_eq!(scenarios.len(), 3);

        assert_eq!(scenarios[0].title, "Card payment succeeds");
        assert_eq!(scenarios[0].priority, Priority::Critical);
        assert_eq!(scenarios[0].assigned_capability.as_deref(), Some("security-scan"));
        assert_eq!(scenarios[0].description, "Cardholder data never logged.");

        assert_eq!(scenarios[1].priority, Priority::High);
        assert_eq!(
            scenarios[1].assigned_capability.as_deref(),
            Some("performance-profile")
        );
        assert_eq!(scenarios[1].mode, ExecutionMode::Parallel);

        assert_eq!(scenarios[2].mode, ExecutionMode::AfterPrevious);
        assert_eq!(scenarios[2].priority, Priority::Medium);
        assert!(scenarios[2].is_routable());
    }

    #[test]
    fn test_prose_mentioning_scenarios_is_not_a_marker() {
        let scenarios = engine().decompose(&requirement(
            "Scenario-based testing covers login.\nScenario.based review is optional.",
        ));
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].title, "Checkout flow");

        let scenarios = engine().decompose(&requirement(
            "Scenario 2 - Refund issued [@regression]\nScenario 3. Receipt emailed [@regression]",
        ));
        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[0].title, "Refund issued");
        assert_eq!(scenarios[1].title, "Receipt emailed");
    }

    #[test]
    fn test_first_scenario_never_after_previous() {
        let scenarios = engine().decompose(&requirement("Scenario: a [after-previous]"));
        assert_eq!(scenarios[0].mode, ExecutionMode::Parallel);
    }

    #[test]
    fn test_unknown_tag_is_unroutable() {
        let scenarios = engine().decompose(&requirement(
            "Scenario: fuzz inputs [capability: chaos-monkey]\nScenario: smoke [@regression]",
        ));
        assert_eq!(scenarios.len(), 2);
        assert!(!scenarios[0].is_routable());
        assert_eq!(scenarios[0].status, ScenarioStatus::Failed);
        assert_eq!(scenarios[0].failure.as_ref().unwrap().kind, "unroutable");
        assert_eq!(scenarios[0].requested_capability.as_deref(), Some("chaos-monkey"));
        assert_eq!(scenarios[1].assigned_capability.as_deref(), Some("regression-run"));
    }

    #[test]
    fn test_no_markers_one_per_target() {
        let mut req = requirement("Users can pay with saved cards.");
        req.target_capabilities = vec!["security".into(), "test-design".into()];
        let scenarios = engine().decompose(&req);
        assert_eq!(scenarios.len(), 2);
        assert_eq!(scenarios[0].assigned_capability.as_deref(), Some("security-scan"));
        assert_eq!(scenarios[1].assigned_capability.as_deref(), Some("test-design"));
        assert_eq!(scenarios[0].description, "Users can pay with saved cards.");
    }

    #[test]
    fn test_no_markers_no_targets_uses_complexity() {
        let mut req = requirement("Tweak footer copy.");
        req.priority = Priority::Low;
        let scenarios = engine().decompose(&req);
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].complexity, ComplexityClass::Low);
        assert_eq!(scenarios[0].assigned_capability.as_deref(), Some("regression-run"));
    }

    #[test]
    fn test_single_target_applies_to_untagged_markers() {
        let mut req = requirement("Scenario: one\nScenario: two [@risk]");
        req.target_capabilities = vec!["test-design".into()];
        let scenarios = engine().decompose(&req);
        assert_eq!(scenarios[0].assigned_capability.as_deref(), Some("test-design"));
        assert_eq!(scenarios[1].assigned_capability.as_deref(), Some("risk-assessment"));
    }

    #[test]
    fn test_risk_score_heuristics() {
        assert!((risk_score(Priority::Low, "rename a label") - 0.15).abs() < 1e-9);
        let risky = risk_score(
            Priority::Critical,
            "database migration for payment and login",
        );
        assert!((risky - 1.0).abs() < 1e-9);
        let medium = risk_score(Priority::Medium, "refactor the checkout page");
        assert!((medium - 0.55).abs() < 1e-9);
        assert_eq!(ComplexityClass::from_risk(medium), ComplexityClass::Medium);
    }
}
