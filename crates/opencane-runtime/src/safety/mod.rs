//! Safety gate for outbound text.
//!
//! A deterministic, priority-ordered rule chain rewrites or downgrades every
//! user-visible string before it is dispatched. Evaluation is a pure function
//! of its inputs; the caller records the audit event.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Risk tier attached to outbound text and vision results.
/// P0 is immediate danger, P3 is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    P0,
    P1,
    P2,
    P3,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::P0 => "P0",
            RiskLevel::P1 => "P1",
            RiskLevel::P2 => "P2",
            RiskLevel::P3 => "P3",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "P0" => Some(RiskLevel::P0),
            "P1" => Some(RiskLevel::P1),
            "P2" => Some(RiskLevel::P2),
            "P3" => Some(RiskLevel::P3),
            _ => None,
        }
    }

    /// The more severe of the two (P0 outranks P3).
    pub fn escalate(self, other: RiskLevel) -> RiskLevel {
        self.min(other)
    }
}

const P0_KEYWORDS: &[&str] = &[
    "oncoming traffic",
    "moving vehicle",
    "gas leak",
    "fire",
    "open pit",
    "drop-off",
    "live wire",
    "electric shock",
];

const P1_KEYWORDS: &[&str] = &[
    "stairs",
    "steps down",
    "crosswalk",
    "intersection",
    "construction",
    "obstacle",
    "crowd",
    "curb",
];

const P2_KEYWORDS: &[&str] = &["maybe", "perhaps", "uncertain", "unclear", "possibly"];

const DIRECTIONAL_KEYWORDS: &[&str] = &[
    "go straight",
    "keep walking",
    "walk forward",
    "turn left",
    "turn right",
    "cross now",
];

const CAUTION_PREFIXES: &[&str] = &["caution", "warning", "stop first", "please stop", "stop now"];

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_lowercase();
    keywords.iter().any(|kw| lower.contains(kw))
}

fn has_conflicting_directions(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("turn left") && lower.contains("turn right")
}

fn has_caution_prefix(text: &str) -> bool {
    let lower = text.to_lowercase();
    CAUTION_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Truncate on a sentence boundary where one exists before the cap.
fn truncate_on_sentence(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }
    let window = &chars[..max_chars];
    let boundary = window
        .iter()
        .rposition(|c| matches!(c, '.' | '!' | '?' | '。' | '！' | '？'));
    match boundary {
        Some(idx) if idx + 1 > max_chars / 2 => window[..=idx].iter().collect(),
        _ => {
            let cut: String = chars[..max_chars.saturating_sub(3)].iter().collect();
            format!("{}...", cut.trim_end())
        }
    }
}

fn clamp_confidence(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Session context the gate needs for conflict detection.
#[derive(Debug, Clone, Default)]
pub struct SafetyContext {
    pub source: String,
    /// Milliseconds since the session last saw a P0 hint, if any.
    pub recent_p0_age_ms: Option<u64>,
    pub extra: Map<String, Value>,
}

/// Output of one gate evaluation.
#[derive(Debug, Clone)]
pub struct SafetyDecision {
    pub text: String,
    pub source: String,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub downgraded: bool,
    pub reason: String,
    pub rule_ids: Vec<String>,
    pub policy_version: String,
    pub evidence: Map<String, Value>,
}

impl SafetyDecision {
    pub fn to_audit_payload(&self, trace_id: &str) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("trace_id".into(), json!(trace_id));
        payload.insert("source".into(), json!(self.source));
        payload.insert("reason".into(), json!(self.reason));
        payload.insert("rule_ids".into(), json!(self.rule_ids));
        payload.insert("downgraded".into(), json!(self.downgraded));
        payload.insert("risk_level".into(), json!(self.risk_level.as_str()));
        payload.insert("policy_version".into(), json!(self.policy_version));
        payload.insert("evidence".into(), Value::Object(self.evidence.clone()));
        payload
    }
}

#[derive(Debug, Clone)]
pub struct SafetyGateConfig {
    pub enabled: bool,
    pub low_confidence_threshold: f64,
    pub directional_confidence_threshold: f64,
    pub max_output_chars: usize,
    pub prepend_caution_for_risk: bool,
    /// Window for the recent-P0 conflict rule.
    pub conflict_window_ms: u64,
}

impl Default for SafetyGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_confidence_threshold: 0.55,
            directional_confidence_threshold: 0.85,
            max_output_chars: 320,
            prepend_caution_for_risk: true,
            conflict_window_ms: 10_000,
        }
    }
}

const POLICY_VERSION: &str = "v1.1";
const P0_PREAMBLE: &str = "Stop and stay where you are. ";

pub struct SafetyGate {
    config: SafetyGateConfig,
}

impl SafetyGate {
    pub fn new(config: SafetyGateConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn fallback_message(risk: RiskLevel) -> &'static str {
        match risk {
            RiskLevel::P0 => {
                "I am not confident about the surroundings. Stop immediately, \
                 confirm it is safe, and ask someone nearby for help."
            }
            RiskLevel::P1 => {
                "My reading is not stable right now. Please stop, check ahead \
                 with your cane, then move carefully."
            }
            _ => "I am not certain right now. Please stop and confirm your surroundings first.",
        }
    }

    fn infer_risk(text: &str, declared: RiskLevel) -> RiskLevel {
        if contains_any(text, P0_KEYWORDS) {
            declared.escalate(RiskLevel::P0)
        } else if contains_any(text, P1_KEYWORDS) {
            declared.escalate(RiskLevel::P1)
        } else if contains_any(text, P2_KEYWORDS) {
            declared.escalate(RiskLevel::P2)
        } else {
            declared
        }
    }

    /// Evaluate one outbound text. Deterministic: identical inputs always
    /// produce identical decisions.
    pub fn evaluate(
        &self,
        text: &str,
        confidence: f64,
        risk_level: RiskLevel,
        context: &SafetyContext,
    ) -> SafetyDecision {
        let raw = text.trim();
        let confidence = clamp_confidence(confidence);
        let risk = Self::infer_risk(raw, risk_level);
        let directional = contains_any(raw, DIRECTIONAL_KEYWORDS);
        let conflicting = has_conflicting_directions(raw);
        let recent_p0 = context
            .recent_p0_age_ms
            .is_some_and(|age| age <= self.config.conflict_window_ms);

        let mut out = raw.to_string();
        let mut rule_ids: Vec<String> = Vec::new();
        let mut downgraded = false;
        let mut reason = "ok".to_string();

        let mut evidence = Map::new();
        evidence.insert("input_risk_level".into(), json!(risk_level.as_str()));
        evidence.insert("inferred_risk_level".into(), json!(risk.as_str()));
        evidence.insert("directional".into(), json!(directional));
        evidence.insert("conflict_direction".into(), json!(conflicting));
        evidence.insert("recent_p0_hint".into(), json!(recent_p0));

        if out.is_empty() {
            out = Self::fallback_message(risk).to_string();
            rule_ids.push("empty_output".into());
            downgraded = true;
            reason = "empty_output".into();
        }

        if self.config.enabled {
            if confidence < self.config.low_confidence_threshold {
                out = Self::fallback_message(risk).to_string();
                rule_ids.push("low_confidence".into());
                downgraded = true;
                reason = "low_confidence".into();
            } else if self.config.prepend_caution_for_risk
                && matches!(risk, RiskLevel::P0 | RiskLevel::P1)
                && !has_caution_prefix(&out)
            {
                let prefix = if risk == RiskLevel::P0 {
                    P0_PREAMBLE
                } else {
                    "Caution. "
                };
                out = format!("{prefix}{out}");
                rule_ids.push("caution_prefix_added".into());
            }

            if !downgraded {
                if conflicting || (directional && recent_p0) {
                    out = Self::fallback_message(risk).to_string();
                    rule_ids.push("semantic_guard_conflict".into());
                    downgraded = true;
                    reason = "semantic_guard_conflict".into();
                } else if matches!(risk, RiskLevel::P0 | RiskLevel::P1)
                    && directional
                    && confidence < self.config.directional_confidence_threshold
                {
                    out = Self::fallback_message(risk).to_string();
                    rule_ids.push("semantic_guard_directional".into());
                    downgraded = true;
                    reason = "semantic_guard_directional".into();
                }
            }
        }

        if out.chars().count() > self.config.max_output_chars {
            out = truncate_on_sentence(&out, self.config.max_output_chars);
            rule_ids.push("output_truncated".into());
        }

        SafetyDecision {
            text: out,
            source: context.source.clone(),
            risk_level: risk,
            confidence,
            downgraded,
            reason,
            rule_ids,
            policy_version: POLICY_VERSION.to_string(),
            evidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> SafetyGate {
        SafetyGate::new(SafetyGateConfig::default())
    }

    fn ctx(source: &str) -> SafetyContext {
        SafetyContext {
            source: source.into(),
            ..Default::default()
        }
    }

    #[test]
    fn risk_ordering_escalates_toward_p0() {
        assert_eq!(RiskLevel::P3.escalate(RiskLevel::P0), RiskLevel::P0);
        assert_eq!(RiskLevel::P1.escalate(RiskLevel::P2), RiskLevel::P1);
    }

    #[test]
    fn p0_text_gets_stop_preamble() {
        let decision = gate().evaluate(
            "There is oncoming traffic to your left.",
            0.95,
            RiskLevel::P3,
            &ctx("vision_reply"),
        );
        assert_eq!(decision.risk_level, RiskLevel::P0);
        assert!(decision.text.starts_with("Stop and stay where you are."));
        assert!(decision.rule_ids.contains(&"caution_prefix_added".to_string()));
        assert!(!decision.downgraded);
    }

    #[test]
    fn low_confidence_softens_and_downgrades() {
        let decision = gate().evaluate(
            "The path ahead looks clear.",
            0.3,
            RiskLevel::P3,
            &ctx("agent_reply"),
        );
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "low_confidence");
        assert!(decision.text.contains("not certain"));
    }

    #[test]
    fn directional_suppressed_below_threshold_at_elevated_risk() {
        let decision = gate().evaluate(
            "There are stairs ahead, turn left now.",
            0.7,
            RiskLevel::P1,
            &ctx("vision_reply"),
        );
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "semantic_guard_directional");
    }

    #[test]
    fn directional_allowed_with_high_confidence() {
        let decision = gate().evaluate(
            "There are stairs ahead, turn left now.",
            0.95,
            RiskLevel::P1,
            &ctx("vision_reply"),
        );
        assert!(!decision.downgraded);
        assert!(decision.text.contains("turn left"));
    }

    #[test]
    fn conflicting_directions_replaced() {
        let decision = gate().evaluate(
            "Turn left then turn right immediately.",
            0.99,
            RiskLevel::P3,
            &ctx("agent_reply"),
        );
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "semantic_guard_conflict");
    }

    #[test]
    fn directional_conflicts_with_recent_p0_hint() {
        let context = SafetyContext {
            source: "task_update".into(),
            recent_p0_age_ms: Some(4_000),
            ..Default::default()
        };
        let decision = gate().evaluate("Cross now while it is quiet.", 0.99, RiskLevel::P3, &context);
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "semantic_guard_conflict");

        let stale = SafetyContext {
            source: "task_update".into(),
            recent_p0_age_ms: Some(60_000),
            ..Default::default()
        };
        let decision = gate().evaluate("Cross now while it is quiet.", 0.99, RiskLevel::P3, &stale);
        assert!(!decision.downgraded);
    }

    #[test]
    fn long_output_truncates_on_sentence_boundary() {
        let text = format!("{} Second sentence here. {}", "a".repeat(200), "b".repeat(300));
        let decision = gate().evaluate(&text, 0.99, RiskLevel::P3, &ctx("agent_reply"));
        assert!(decision.text.chars().count() <= 320);
        assert!(decision.rule_ids.contains(&"output_truncated".to_string()));
        assert!(decision.text.ends_with('.'));
    }

    #[test]
    fn empty_input_becomes_conservative_fallback() {
        let decision = gate().evaluate("   ", 1.0, RiskLevel::P3, &ctx("runtime"));
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "empty_output");
        assert!(!decision.text.is_empty());
    }

    #[test]
    fn determinism() {
        let a = gate().evaluate("Obstacle ahead.", 0.9, RiskLevel::P2, &ctx("vision_reply"));
        let b = gate().evaluate("Obstacle ahead.", 0.9, RiskLevel::P2, &ctx("vision_reply"));
        assert_eq!(a.text, b.text);
        assert_eq!(a.rule_ids, b.rule_ids);
    }
}
