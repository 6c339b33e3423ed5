//! Confidence scoring and multi-agent consensus arithmetic.

mod consensus;
mod scorer;

pub use consensus::{decide_consensus, ConsensusOutcome, ConsensusResult, SubagentVote};
pub use scorer::{ConfidenceLevel, ConfidenceScorer, FactorScores, ScoreBreakdown, ScoringInput};
