//! Baseline evaluation of a checkpoint.
//!
//! The score is always white-positive and built from per-side terms that only
//! depend on a piece's rank relative to its own side, so mirroring a position
//! (swap colours, flip ranks) negates the advantage exactly.

use serde::{Deserialize, Serialize};
use tpr_core::{square_file, square_rank, Checkpoint, Classification, PieceKind, Side};

/// Conventional material value in pawns; the king carries none.
pub fn material_value(kind: PieceKind) -> f64 {
    match kind {
        PieceKind::Pawn => 1.0,
        PieceKind::Knight | PieceKind::Bishop => 3.0,
        PieceKind::Rook => 5.0,
        PieceKind::Queen => 9.0,
        PieceKind::King => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// White-positive score in pawns.
    pub advantage: f64,
    pub class: Classification,
    pub confidence: f64,
}

/// Pure, deterministic function of a checkpoint.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, checkpoint: &Checkpoint) -> Evaluation;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// |advantage| at or above which the evaluator calls a winner. Applies to both sides.
    pub decisive_margin: f64,
    pub pawn_advance_bonus: f64,
    pub minor_center_bonus: f64,
    pub confidence_floor: f64,
    pub confidence_ceiling: f64,
    /// Advantage at which confidence has covered ~76% of the floor-to-ceiling range.
    pub confidence_scale: f64,
    pub confidence_cap: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            decisive_margin: 1.0,
            pawn_advance_bonus: 0.05,
            minor_center_bonus: 0.15,
            confidence_floor: 0.34,
            confidence_ceiling: 0.95,
            confidence_scale: 3.0,
            confidence_cap: 0.98,
        }
    }
}

impl EvaluatorConfig {
    pub fn classify(&self, advantage: f64) -> Classification {
        if advantage >= self.decisive_margin {
            Classification::White
        } else if advantage <= -self.decisive_margin {
            Classification::Black
        } else {
            Classification::Draw
        }
    }

    /// Monotonic in |advantage|, saturating at `confidence_ceiling`.
    pub fn confidence(&self, advantage: f64) -> f64 {
        let span = (self.confidence_ceiling - self.confidence_floor).max(0.0);
        let scale = self.confidence_scale.max(f64::EPSILON);
        let raw = self.confidence_floor + span * (advantage.abs() / scale).tanh();
        raw.clamp(0.0, self.confidence_cap.min(0.98))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEvaluator {
    config: EvaluatorConfig,
}

impl HeuristicEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Terms are summed in sorted order so a side's score does not depend on
    /// where its pieces sit in the placement list.
    fn side_score(&self, checkpoint: &Checkpoint, side: Side) -> f64 {
        let mut terms: Vec<f64> = checkpoint
            .pieces
            .iter()
            .filter(|p| p.piece.side == side)
            .map(|p| {
                let relative_rank = match side {
                    Side::White => square_rank(p.square),
                    Side::Black => 7 - square_rank(p.square),
                };
                let file = square_file(p.square);
                let mut score = material_value(p.piece.kind);
                match p.piece.kind {
                    PieceKind::Pawn => {
                        score += self.config.pawn_advance_bonus
                            * f64::from(relative_rank.saturating_sub(1));
                    }
                    PieceKind::Knight | PieceKind::Bishop => {
                        if (2..=5).contains(&file) && (2..=5).contains(&relative_rank) {
                            score += self.config.minor_center_bonus;
                        }
                    }
                    _ => {}
                }
                score
            })
            .collect();
        terms.sort_by(f64::total_cmp);
        terms.into_iter().sum()
    }
}

impl Evaluator for HeuristicEvaluator {
    fn evaluate(&self, checkpoint: &Checkpoint) -> Evaluation {
        let advantage =
            self.side_score(checkpoint, Side::White) - self.side_score(checkpoint, Side::Black);
        Evaluation {
            advantage,
            class: self.config.classify(advantage),
            confidence: self.config.confidence(advantage),
        }
    }
}
