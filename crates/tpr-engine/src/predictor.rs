//! Signature-driven predictor that may overrule the baseline evaluator when the
//! baseline is not confident.

use serde::{Deserialize, Serialize};
use tpr_core::{Archetype, Classification, PieceKind, Region, Side, SignatureMode, SignatureProfile};

use crate::evaluator::Evaluation;

pub const OVERRIDE_REASON_PREFIX: &str = "signature_override";
pub const BALANCED_TENSION_REASON: &str = "balanced_tension";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KindWeights {
    pub pawn: f64,
    pub knight: f64,
    pub bishop: f64,
    pub rook: f64,
    pub queen: f64,
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            pawn: 0.3,
            knight: 0.5,
            bishop: 0.5,
            rook: 0.6,
            queen: 0.8,
        }
    }
}

impl KindWeights {
    pub fn weight(&self, kind: PieceKind) -> f64 {
        match kind {
            PieceKind::Pawn => self.pawn,
            PieceKind::Knight => self.knight,
            PieceKind::Bishop => self.bishop,
            PieceKind::Rook => self.rook,
            PieceKind::Queen => self.queen,
            PieceKind::King => 0.0,
        }
    }
}

/// Multipliers applied to the bias by archetype when the profile was built in
/// enhanced mode. 1.0 leaves the bias untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchetypeBoosts {
    pub region_concentrated: f64,
    pub unit_type_dominant: f64,
    pub balanced: f64,
}

impl Default for ArchetypeBoosts {
    fn default() -> Self {
        Self {
            region_concentrated: 1.0,
            unit_type_dominant: 1.0,
            balanced: 1.0,
        }
    }
}

impl ArchetypeBoosts {
    fn factor(&self, archetype: &Archetype) -> f64 {
        match archetype {
            Archetype::RegionConcentrated(_) => self.region_concentrated,
            Archetype::UnitTypeDominant(_) => self.unit_type_dominant,
            Archetype::Balanced => self.balanced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorThresholds {
    /// Baseline |advantage| below this counts as "not confident".
    pub closeness: f64,
    /// |bias| above this may overrule a non-confident baseline.
    pub override_threshold: f64,
    pub override_base: f64,
    pub override_gain: f64,
    pub agreement_boost: f64,
    pub draw_bias_max: f64,
    pub draw_advantage_max: f64,
    pub draw_tension_min: f64,
    pub draw_confidence: f64,
    pub confidence_cap: f64,
    /// Regional weight for units on their own side of the board.
    pub home_weight: f64,
    /// Regional weight for units on the opponent's back ranks.
    pub invasion_weight: f64,
    pub material_weight: f64,
    pub kind_weights: KindWeights,
    pub archetype_boosts: ArchetypeBoosts,
    /// Minimum skew before a profile stops being "balanced".
    pub archetype_min_skew: f64,
}

impl Default for PredictorThresholds {
    fn default() -> Self {
        Self {
            closeness: 1.5,
            override_threshold: 0.25,
            override_base: 0.5,
            override_gain: 1.0,
            agreement_boost: 0.05,
            draw_bias_max: 0.05,
            draw_advantage_max: 0.3,
            draw_tension_min: 0.35,
            draw_confidence: 0.55,
            confidence_cap: 0.98,
            home_weight: 0.2,
            invasion_weight: 0.6,
            material_weight: 0.5,
            kind_weights: KindWeights::default(),
            archetype_boosts: ArchetypeBoosts::default(),
            archetype_min_skew: 0.3,
        }
    }
}

impl PredictorThresholds {
    fn clamp_confidence(&self, confidence: f64) -> f64 {
        confidence.clamp(0.0, self.confidence_cap.min(0.98))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HybridDecision {
    pub class: Classification,
    pub confidence: f64,
    pub archetype: Archetype,
    pub overrule_reason: Option<String>,
    /// White-positive signature bias in [-1, 1].
    pub bias: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HybridPredictor {
    thresholds: PredictorThresholds,
}

impl HybridPredictor {
    pub fn new(thresholds: PredictorThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &PredictorThresholds {
        &self.thresholds
    }

    pub fn predict(&self, profile: &SignatureProfile, baseline: &Evaluation) -> HybridDecision {
        let archetype = self.archetype(profile);
        let bias = self.bias(profile, &archetype);
        self.decide(bias, archetype, profile.tension, baseline)
    }

    /// Weighted sum of regional, dominance and material differentials.
    pub fn bias(&self, profile: &SignatureProfile, archetype: &Archetype) -> f64 {
        let t = &self.thresholds;
        let depth_weight =
            |depth: f64| t.home_weight * (1.0 - depth) + t.invasion_weight * depth;

        let regional: f64 = profile
            .regions
            .iter()
            .map(|r| {
                r.white * depth_weight(r.region.depth_for(Side::White))
                    - r.black * depth_weight(r.region.depth_for(Side::Black))
            })
            .sum();

        let dominance: f64 = profile
            .dominance
            .iter()
            .map(|d| t.kind_weights.weight(d.kind) * d.share * d.advantage)
            .sum();

        let mut bias = regional + dominance + t.material_weight * profile.material_balance;
        if profile.mode == SignatureMode::Enhanced {
            bias *= t.archetype_boosts.factor(archetype);
        }
        bias.clamp(-1.0, 1.0)
    }

    /// Dominant feature of the profile: the most over-populated region or the
    /// most lopsided piece kind, whichever skews further.
    pub fn archetype(&self, profile: &SignatureProfile) -> Archetype {
        let region_count = profile.regions.len().max(1) as f64;
        let region_pick = profile
            .regions
            .iter()
            .map(|r| (r.region, r.fraction * region_count - 1.0))
            .fold(None, |best: Option<(Region, f64)>, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            });

        let kind_pick = profile
            .dominance
            .iter()
            .filter(|d| d.kind != PieceKind::King && d.share > 0.0)
            .map(|d| (d.kind, d.advantage.abs()))
            .fold(None, |best: Option<(PieceKind, f64)>, cur| match best {
                Some(b) if b.1 >= cur.1 => Some(b),
                _ => Some(cur),
            });

        let min = self.thresholds.archetype_min_skew;
        match (region_pick, kind_pick) {
            (Some((region, rs)), Some((_, ks))) if rs >= min && rs >= ks => {
                Archetype::RegionConcentrated(region)
            }
            (Some((region, rs)), None) if rs >= min => Archetype::RegionConcentrated(region),
            (_, Some((kind, ks))) if ks >= min => Archetype::UnitTypeDominant(kind),
            _ => Archetype::Balanced,
        }
    }

    /// Decision rule applied to a precomputed bias.
    pub fn decide(
        &self,
        bias: f64,
        archetype: Archetype,
        tension: f64,
        baseline: &Evaluation,
    ) -> HybridDecision {
        let t = &self.thresholds;
        let advantage = baseline.advantage;

        if bias.abs() <= t.draw_bias_max
            && advantage.abs() <= t.draw_advantage_max
            && tension >= t.draw_tension_min
        {
            let overrule_reason = (baseline.class != Classification::Draw).then(|| {
                format!("{BALANCED_TENSION_REASON}: tension {tension:.3} with bias {bias:+.3}")
            });
            return HybridDecision {
                class: Classification::Draw,
                confidence: t.clamp_confidence(t.draw_confidence),
                archetype,
                overrule_reason,
                bias,
            };
        }

        if advantage.abs() < t.closeness && bias.abs() > t.override_threshold {
            return HybridDecision {
                class: Classification::from_sign(bias),
                confidence: t.clamp_confidence(t.override_base + t.override_gain * bias.abs()),
                archetype,
                overrule_reason: Some(format!(
                    "{OVERRIDE_REASON_PREFIX}: bias {bias:+.3} over baseline advantage {advantage:+.3}"
                )),
                bias,
            };
        }

        let agrees = match baseline.class {
            Classification::White => bias > 0.0,
            Classification::Black => bias < 0.0,
            Classification::Draw => false,
        };
        let confidence = if agrees {
            baseline.confidence + t.agreement_boost
        } else {
            baseline.confidence
        };
        HybridDecision {
            class: baseline.class,
            confidence: t.clamp_confidence(confidence),
            archetype,
            overrule_reason: None,
            bias,
        }
    }
}
