//! Deterministic per-relationship confidence scoring.
//!
//! Four factor scores are extracted from the relationship tuple and its
//! evidence set, combined by configurable weights, discounted by an
//! anti-pattern penalty and an evidence-count uncertainty term, and mapped
//! to a level. Everything here is pure arithmetic over the inputs: no
//! clock, no randomness, no I/O.

use serde::{Deserialize, Serialize};

use crate::config::ConfidenceConfig;
use crate::store::{EvidenceRecord, Poi, Relationship};

/// Evidence-type tags produced by syntactic rules; these score highest on
/// the syntax factor.
const SYNTACTIC_RULES: &[&str] = &[
    "function-call-pattern",
    "import-export-match",
    "class-reference-pattern",
];

/// Confidence bands over the final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLevel {
    fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Self::High
        } else if score >= 0.65 {
            Self::Medium
        } else if score >= 0.45 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

/// The four factor scores, each in [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub syntax: f64,
    pub semantic: f64,
    pub context: f64,
    pub cross_ref: f64,
}

impl FactorScores {
    fn all_finite(&self) -> bool {
        self.syntax.is_finite()
            && self.semantic.is_finite()
            && self.context.is_finite()
            && self.cross_ref.is_finite()
    }
}

/// Everything the scorer looks at for one relationship.
pub struct ScoringInput<'a> {
    pub relationship: &'a Relationship,
    pub source: &'a Poi,
    pub target: &'a Poi,
    pub evidence: &'a [EvidenceRecord],
}

/// Full decomposition of one scoring pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub factors: FactorScores,
    pub weighted: f64,
    pub penalty: f64,
    pub uncertainty: f64,
    pub final_score: f64,
    pub level: ConfidenceLevel,
    pub escalate: bool,
}

/// Deterministic confidence scorer.
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    /// Score one relationship against its evidence set.
    pub fn calculate(&self, input: &ScoringInput<'_>) -> ScoreBreakdown {
        let factors = self.extract_factors(input);
        let weights = self.config.weights;

        let weighted = weights.syntax * factors.syntax
            + weights.semantic * factors.semantic
            + weights.context * factors.context
            + weights.cross_ref * factors.cross_ref;

        let penalty = self.penalty(input);
        let uncertainty = self.uncertainty(input.evidence.len());
        let final_score = (weighted * penalty * uncertainty).clamp(0.0, 1.0);

        let escalate = !factors.all_finite()
            || !final_score.is_finite()
            || final_score < self.config.escalation_threshold;

        ScoreBreakdown {
            factors,
            weighted,
            penalty,
            uncertainty,
            final_score,
            level: ConfidenceLevel::from_score(final_score),
            escalate,
        }
    }

    /// Score with a factor-emphasis profile; used by triangulation
    /// subagents so each agent type examines the tuple through its own lens.
    ///
    /// Subagent votes judge the tuple itself, so the evidence-count
    /// uncertainty discount does not apply here: agreement between agents
    /// replaces it.
    pub fn calculate_with_emphasis(
        &self,
        input: &ScoringInput<'_>,
        emphasis: &FactorScores,
    ) -> ScoreBreakdown {
        let base = self.extract_factors(input);
        let raw = FactorScores {
            syntax: (base.syntax * emphasis.syntax).clamp(0.0, 1.0),
            semantic: (base.semantic * emphasis.semantic).clamp(0.0, 1.0),
            context: (base.context * emphasis.context).clamp(0.0, 1.0),
            cross_ref: (base.cross_ref * emphasis.cross_ref).clamp(0.0, 1.0),
        };
        let weights = self.config.weights;
        let weighted = weights.syntax * raw.syntax
            + weights.semantic * raw.semantic
            + weights.context * raw.context
            + weights.cross_ref * raw.cross_ref;
        let penalty = self.penalty(input);
        let final_score = (weighted * penalty).clamp(0.0, 1.0);

        ScoreBreakdown {
            factors: raw,
            weighted,
            penalty,
            uncertainty: 1.0,
            final_score,
            level: ConfidenceLevel::from_score(final_score),
            escalate: false,
        }
    }

    fn extract_factors(&self, input: &ScoringInput<'_>) -> FactorScores {
        FactorScores {
            syntax: syntax_factor(input),
            semantic: semantic_factor(input),
            context: context_factor(input),
            cross_ref: cross_ref_factor(input),
        }
    }

    fn penalty(&self, input: &ScoringInput<'_>) -> f64 {
        let rel = input.relationship;
        let mut penalty = 1.0;
        // Self-edges are almost always extraction noise.
        if rel.source_poi_id == rel.target_poi_id {
            penalty *= 0.3;
        }
        // A catch-all type carries little signal.
        if rel.rel_type == "RELATED_TO" || rel.rel_type == "REFERENCES" {
            penalty *= 0.9;
        }
        penalty
    }

    fn uncertainty(&self, evidence_count: usize) -> f64 {
        1.0 - 1.0 / (1.0 + evidence_count as f64).powf(self.config.alpha)
    }
}

/// How strongly the evidence tags point at a recognized syntactic rule.
fn syntax_factor(input: &ScoringInput<'_>) -> f64 {
    let mut score: f64 = 0.3;
    if SYNTACTIC_RULES.contains(&input.relationship.evidence_type.as_str()) {
        score += 0.4;
    }
    let rel_type = &input.relationship.rel_type;
    if !rel_type.is_empty() && rel_type.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
        score += 0.2;
    }
    if input.evidence.iter().any(|e| {
        e.payload
            .get("rule")
            .and_then(|r| r.as_str())
            .is_some_and(|r| SYNTACTIC_RULES.contains(&r))
    }) {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}

/// Mean of the agents' own confidence plus the extractor quality scores.
fn semantic_factor(input: &ScoringInput<'_>) -> f64 {
    let mut parts: Vec<f64> = input
        .evidence
        .iter()
        .map(|e| e.agent_confidence)
        .filter(|c| c.is_finite())
        .collect();
    if let Some(q) = input.source.quality_score {
        parts.push(q);
    }
    if let Some(q) = input.target.quality_score {
        parts.push(q);
    }
    if parts.is_empty() {
        return 0.5;
    }
    (parts.iter().sum::<f64>() / parts.len() as f64).clamp(0.0, 1.0)
}

/// Locality: same-file edges with small line distance score highest,
/// directory-scope edges sit at a flat baseline.
fn context_factor(input: &ScoringInput<'_>) -> f64 {
    if input.source.file_path == input.target.file_path {
        let distance = input
            .source
            .start_line
            .abs_diff(input.target.start_line) as f64;
        (0.6 + 0.4 / (1.0 + distance / 100.0)).clamp(0.0, 1.0)
    } else {
        0.5
    }
}

/// Corroboration: distinct evidence rules and export visibility.
fn cross_ref_factor(input: &ScoringInput<'_>) -> f64 {
    let mut rules: Vec<&str> = input
        .evidence
        .iter()
        .filter_map(|e| e.payload.get("rule").and_then(|r| r.as_str()))
        .collect();
    rules.sort_unstable();
    rules.dedup();

    let mut score = (rules.len() as f64 / 3.0).min(0.6);
    if input.target.is_exported {
        score += 0.3;
    }
    if input.evidence.len() > 1 {
        score += 0.1;
    }
    score.clamp(0.0, 1.0)
}
