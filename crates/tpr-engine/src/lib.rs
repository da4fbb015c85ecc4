//! Replay, feature extraction and classification for checkpoints.

pub mod board;
pub mod checkpoint;
pub mod evaluator;
pub mod predictor;
pub mod signature;

pub use board::{Board, MoveError, STARTING_FEN};
pub use checkpoint::{checkpoint_of, ExtractError, PositionExtractor};
pub use evaluator::{material_value, Evaluation, Evaluator, EvaluatorConfig, HeuristicEvaluator};
pub use predictor::{
    ArchetypeBoosts, HybridDecision, HybridPredictor, KindWeights, PredictorThresholds,
    BALANCED_TENSION_REASON, OVERRIDE_REASON_PREFIX,
};
pub use signature::SignatureExtractor;

pub const CRATE_NAME: &str = "tpr-engine";
