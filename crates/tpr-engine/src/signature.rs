use std::collections::BTreeMap;

use tpr_core::{
    Checkpoint, PieceKind, Region, RegionOccupancy, Side, SignatureMode, SignatureProfile,
    TemporalPhase, TypeDominance,
};

use crate::board::Board;
use crate::evaluator::material_value;

/// Signed ratio `(a - b) / (a + b)`, 0.0 when both are zero.
pub(crate) fn signed_ratio(a: f64, b: f64) -> f64 {
    let total = a + b;
    if total > 0.0 {
        (a - b) / total
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureExtractor {
    mode: SignatureMode,
}

impl SignatureExtractor {
    pub fn new(mode: SignatureMode) -> Self {
        Self { mode }
    }

    pub fn enhanced(enabled: bool) -> Self {
        Self::new(if enabled {
            SignatureMode::Enhanced
        } else {
            SignatureMode::Basic
        })
    }

    pub fn mode(&self) -> SignatureMode {
        self.mode
    }

    pub fn extract(&self, checkpoint: &Checkpoint) -> SignatureProfile {
        let pieces = &checkpoint.pieces;
        let total = pieces.len() as f64;
        let share = |count: usize| if total > 0.0 { count as f64 / total } else { 0.0 };

        let mut per_region: BTreeMap<(u8, u8), (usize, usize)> = BTreeMap::new();
        let mut per_kind: BTreeMap<PieceKind, (usize, usize)> = BTreeMap::new();
        let mut material = (0.0, 0.0);
        for placed in pieces {
            let region = Region::of_square(placed.square, self.mode);
            let region_slot = per_region
                .entry((region.band, region.wing as u8))
                .or_default();
            let kind_slot = per_kind.entry(placed.piece.kind).or_default();
            let value = material_value(placed.piece.kind);
            match placed.piece.side {
                Side::White => {
                    region_slot.0 += 1;
                    kind_slot.0 += 1;
                    material.0 += value;
                }
                Side::Black => {
                    region_slot.1 += 1;
                    kind_slot.1 += 1;
                    material.1 += value;
                }
            }
        }

        let regions = Region::all(self.mode)
            .into_iter()
            .map(|region| {
                let (white, black) = per_region
                    .get(&(region.band, region.wing as u8))
                    .copied()
                    .unwrap_or_default();
                RegionOccupancy {
                    region,
                    fraction: share(white + black),
                    white: share(white),
                    black: share(black),
                    balance: signed_ratio(white as f64, black as f64),
                }
            })
            .collect();

        let dominance = PieceKind::ALL
            .iter()
            .map(|kind| {
                let (white, black) = per_kind.get(kind).copied().unwrap_or_default();
                TypeDominance {
                    kind: *kind,
                    share: share(white + black),
                    advantage: signed_ratio(white as f64, black as f64),
                }
            })
            .collect();

        SignatureProfile {
            mode: self.mode,
            phase: TemporalPhase::from_ply(checkpoint.ply_index),
            regions,
            dominance,
            material_balance: signed_ratio(material.0, material.1),
            tension: tension(checkpoint),
            total_units: pieces.len() as u32,
        }
    }
}

/// Share of units standing on a square attacked by an enemy unit.
fn tension(checkpoint: &Checkpoint) -> f64 {
    if checkpoint.pieces.is_empty() {
        return 0.0;
    }
    let board = Board::from_placement(&checkpoint.pieces, checkpoint.side_to_move);
    let attacked = checkpoint
        .pieces
        .iter()
        .filter(|p| board.is_attacked(p.square, p.piece.side.opposite()))
        .count();
    attacked as f64 / checkpoint.pieces.len() as f64
}
