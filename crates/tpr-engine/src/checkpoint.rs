use thiserror::Error;
use tpr_core::{sha256_hex, Checkpoint, RawRecord};
use tracing::debug;

use crate::board::Board;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// Dropped, not an error in the pipeline sense: the game simply ended early.
    #[error("record has {available} moves, checkpoint needs {target}")]
    InsufficientLength { available: usize, target: u32 },
    #[error("only {applied} of {target} moves replayed ({skipped} skipped, first bad token {first_bad:?})")]
    Unparseable {
        applied: u32,
        skipped: usize,
        target: u32,
        first_bad: String,
    },
}

/// Replays a record's moves up to a target ply.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionExtractor;

impl PositionExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Tokens that fail to parse or are illegal in the current position are
    /// skipped and replay continues with the next one.
    pub fn extract(&self, raw: &RawRecord, target_ply: u32) -> Result<Checkpoint, ExtractError> {
        let tokens = raw.moves.tokens();
        if tokens.len() < target_ply as usize {
            return Err(ExtractError::InsufficientLength {
                available: tokens.len(),
                target: target_ply,
            });
        }

        let mut board = Board::starting();
        let mut skipped = 0usize;
        let mut first_bad: Option<String> = None;
        for (index, token) in tokens.iter().enumerate() {
            if board.ply() >= target_ply {
                break;
            }
            if let Err(err) = board.apply_token(token) {
                debug!(record_id = %raw.id, index, token = %token, error = %err, "skipping move");
                skipped += 1;
                first_bad.get_or_insert_with(|| token.clone());
            }
        }

        if board.ply() < target_ply {
            return Err(ExtractError::Unparseable {
                applied: board.ply(),
                skipped,
                target: target_ply,
                first_bad: first_bad.unwrap_or_default(),
            });
        }
        Ok(checkpoint_of(&board))
    }
}

/// Canonical checkpoint of a board. The FEN prefix is a function of placement
/// and game state only, so transpositions hash identically.
pub fn checkpoint_of(board: &Board) -> Checkpoint {
    let canonical_state = board.fen_prefix();
    Checkpoint {
        content_hash: sha256_hex(canonical_state.as_bytes()),
        canonical_state,
        ply_index: board.ply(),
        side_to_move: board.side_to_move(),
        pieces: board.pieces(),
    }
}
