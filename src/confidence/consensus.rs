//! Weighted consensus over subagent votes.

use serde::{Deserialize, Serialize};

use crate::config::TriangulationConfig;

/// One subagent's vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentVote {
    pub agent_type: String,
    pub confidence: f64,
    pub weight: f64,
}

/// The consensus verdict for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusOutcome {
    Accept,
    Reject,
    Escalate,
}

impl ConsensusOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Reject => "REJECT",
            Self::Escalate => "ESCALATE",
        }
    }
}

/// Result of the consensus computation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub outcome: ConsensusOutcome,
    pub weighted_consensus: f64,
    pub conflict_detected: bool,
}

/// Combine subagent votes into a decision.
///
/// `weightedConsensus = sum(w_i * c_i) / sum(w_i)`; a spread between the
/// highest and lowest vote above the conflict threshold flags a conflict.
/// ACCEPT needs consensus at the accept threshold without conflict; REJECT
/// fires at the reject threshold; everything else escalates, bounded by
/// `max_escalations`, after which REJECT is forced.
pub fn decide_consensus(
    votes: &[SubagentVote],
    config: &TriangulationConfig,
    escalations_so_far: u32,
) -> ConsensusResult {
    let valid: Vec<&SubagentVote> = votes
        .iter()
        .filter(|v| v.confidence.is_finite() && v.weight.is_finite() && v.weight > 0.0)
        .collect();

    if valid.is_empty() {
        return ConsensusResult {
            outcome: forced_or(ConsensusOutcome::Escalate, escalations_so_far, config),
            weighted_consensus: 0.0,
            conflict_detected: false,
        };
    }

    let total_weight: f64 = valid.iter().map(|v| v.weight).sum();
    let weighted_consensus =
        valid.iter().map(|v| v.weight * v.confidence).sum::<f64>() / total_weight;

    let max = valid.iter().map(|v| v.confidence).fold(f64::MIN, f64::max);
    let min = valid.iter().map(|v| v.confidence).fold(f64::MAX, f64::min);
    let conflict_detected = max - min > config.conflict_threshold;

    let outcome = if weighted_consensus >= config.accept_threshold && !conflict_detected {
        ConsensusOutcome::Accept
    } else if weighted_consensus <= config.reject_threshold {
        ConsensusOutcome::Reject
    } else {
        forced_or(ConsensusOutcome::Escalate, escalations_so_far, config)
    };

    ConsensusResult {
        outcome,
        weighted_consensus: weighted_consensus.clamp(0.0, 1.0),
        conflict_detected,
    }
}

fn forced_or(
    outcome: ConsensusOutcome,
    escalations_so_far: u32,
    config: &TriangulationConfig,
) -> ConsensusOutcome {
    if escalations_so_far >= config.max_escalations {
        ConsensusOutcome::Reject
    } else {
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(agent: &str, confidence: f64, weight: f64) -> SubagentVote {
        SubagentVote {
            agent_type: agent.to_string(),
            confidence,
            weight,
        }
    }

    fn config() -> TriangulationConfig {
        TriangulationConfig::default()
    }

    #[test]
    fn agreement_above_accept_threshold_accepts() {
        let votes = vec![vote("a", 0.8, 1.0), vote("b", 0.75, 1.0)];
        let result = decide_consensus(&votes, &config(), 0);
        assert_eq!(result.outcome, ConsensusOutcome::Accept);
        assert!(!result.conflict_detected);
        assert!((result.weighted_consensus - 0.775).abs() < 1e-9);
    }

    #[test]
    fn weights_shift_the_consensus() {
        let votes = vec![vote("a", 1.0, 3.0), vote("b", 0.0, 1.0)];
        let result = decide_consensus(&votes, &config(), 0);
        assert!((result.weighted_consensus - 0.75).abs() < 1e-9);
    }

    #[test]
    fn low_consensus_rejects() {
        let votes = vec![vote("a", 0.2, 1.0), vote("b", 0.3, 1.0)];
        let result = decide_consensus(&votes, &config(), 0);
        assert_eq!(result.outcome, ConsensusOutcome::Reject);
    }

    #[test]
    fn conflict_blocks_acceptance_and_escalates() {
        // High consensus but a 0.55 spread: conflicted.
        let votes = vec![vote("a", 0.95, 1.0), vote("b", 0.4, 0.2)];
        let result = decide_consensus(&votes, &config(), 0);
        assert!(result.conflict_detected);
        assert_eq!(result.outcome, ConsensusOutcome::Escalate);
    }

    #[test]
    fn escalation_budget_forces_reject() {
        let votes = vec![vote("a", 0.95, 1.0), vote("b", 0.4, 0.2)];
        let result = decide_consensus(&votes, &config(), 1);
        assert_eq!(result.outcome, ConsensusOutcome::Reject);
    }

    #[test]
    fn non_finite_votes_are_ignored() {
        let votes = vec![vote("a", f64::NAN, 1.0), vote("b", 0.8, 1.0)];
        let result = decide_consensus(&votes, &config(), 0);
        assert!((result.weighted_consensus - 0.8).abs() < 1e-9);
    }

    #[test]
    fn no_valid_votes_escalates_then_rejects() {
        let votes = vec![vote("a", f64::NAN, 1.0)];
        assert_eq!(
            decide_consensus(&votes, &config(), 0).outcome,
            ConsensusOutcome::Escalate
        );
        assert_eq!(
            decide_consensus(&votes, &config(), 1).outcome,
            ConsensusOutcome::Reject
        );
    }
}
