//! Core domain model for the TPR pipeline: record identity, raw records,
//! checkpoints, signature profiles and predictions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "tpr-core";

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    /// +1 for white, -1 for black. Positive scores always favour white.
    pub fn sign(self) -> f64 {
        match self {
            Side::White => 1.0,
            Side::Black => -1.0,
        }
    }

    pub fn fen_char(self) -> char {
        match self {
            Side::White => 'w',
            Side::Black => 'b',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PieceKind {
    Pawn,
    Knight,
    Bishop,
    Rook,
    Queen,
    King,
}

impl PieceKind {
    pub const ALL: [PieceKind; 6] = [
        PieceKind::Pawn,
        PieceKind::Knight,
        PieceKind::Bishop,
        PieceKind::Rook,
        PieceKind::Queen,
        PieceKind::King,
    ];

    pub fn symbol(self) -> char {
        match self {
            PieceKind::Pawn => 'p',
            PieceKind::Knight => 'n',
            PieceKind::Bishop => 'b',
            PieceKind::Rook => 'r',
            PieceKind::Queen => 'q',
            PieceKind::King => 'k',
        }
    }

    /// Parses an upper- or lowercase piece letter.
    pub fn from_symbol(ch: char) -> Option<Self> {
        match ch.to_ascii_lowercase() {
            'p' => Some(PieceKind::Pawn),
            'n' => Some(PieceKind::Knight),
            'b' => Some(PieceKind::Bishop),
            'r' => Some(PieceKind::Rook),
            'q' => Some(PieceKind::Queen),
            'k' => Some(PieceKind::King),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PieceKind::Pawn => "pawn",
            PieceKind::Knight => "knight",
            PieceKind::Bishop => "bishop",
            PieceKind::Rook => "rook",
            PieceKind::Queen => "queen",
            PieceKind::King => "king",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Piece {
    pub side: Side,
    pub kind: PieceKind,
}

impl Piece {
    pub fn new(side: Side, kind: PieceKind) -> Self {
        Self { side, kind }
    }

    pub fn fen_char(self) -> char {
        let c = self.kind.symbol();
        match self.side {
            Side::White => c.to_ascii_uppercase(),
            Side::Black => c,
        }
    }

    pub fn from_fen_char(ch: char) -> Option<Self> {
        let kind = PieceKind::from_symbol(ch)?;
        let side = if ch.is_ascii_uppercase() {
            Side::White
        } else {
            Side::Black
        };
        Some(Self { side, kind })
    }
}

/// Square index 0..64, a1 = 0, h8 = 63.
pub type Square = u8;

pub fn square_file(square: Square) -> u8 {
    square % 8
}

pub fn square_rank(square: Square) -> u8 {
    square / 8
}

pub fn square_name(square: Square) -> String {
    let file = (b'a' + square_file(square)) as char;
    let rank = (b'1' + square_rank(square)) as char;
    format!("{file}{rank}")
}

pub fn parse_square(text: &str) -> Option<Square> {
    let bytes = text.as_bytes();
    if bytes.len() != 2 {
        return None;
    }
    let file = bytes[0].checked_sub(b'a')?;
    let rank = bytes[1].checked_sub(b'1')?;
    if file < 8 && rank < 8 {
        Some(rank * 8 + file)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacedPiece {
    pub square: Square,
    pub piece: Piece,
}

/// Three-way game classification, used both for predictions and actual outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    White,
    Black,
    Draw,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::White => "white",
            Classification::Black => "black",
            Classification::Draw => "draw",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "white" => Some(Classification::White),
            "black" => Some(Classification::Black),
            "draw" => Some(Classification::Draw),
            _ => None,
        }
    }

    /// PGN result tokens. `*` (unfinished) has no classification.
    pub fn from_pgn_result(result: &str) -> Option<Self> {
        match result.trim() {
            "1-0" => Some(Classification::White),
            "0-1" => Some(Classification::Black),
            "1/2-1/2" | "½-½" => Some(Classification::Draw),
            _ => None,
        }
    }

    pub fn favoring(side: Side) -> Self {
        match side {
            Side::White => Classification::White,
            Side::Black => Classification::Black,
        }
    }

    /// Class favoured by the sign of a white-positive score.
    pub fn from_sign(score: f64) -> Self {
        if score > 0.0 {
            Classification::White
        } else if score < 0.0 {
            Classification::Black
        } else {
            Classification::Draw
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const LICHESS_SOURCE_ID: &str = "lichess";
pub const CHESSCOM_SOURCE_ID: &str = "chesscom";
pub const FIXTURE_SOURCE_ID: &str = "fixture";

/// Source prefixes recognised when parsing an id of unknown form.
pub const KNOWN_SOURCES: &[&str] = &[LICHESS_SOURCE_ID, CHESSCOM_SOURCE_ID, FIXTURE_SOURCE_ID];

/// Identity of an upstream record. Adapters may refer to the same record with a
/// source prefix (`lichess_AbCd1234`) or without one (`AbCd1234`); both forms
/// name the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
    source: Option<String>,
    provider_id: String,
}

impl RecordId {
    pub fn new(source: impl Into<String>, provider_id: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            provider_id: provider_id.into(),
        }
    }

    pub fn raw_only(provider_id: impl Into<String>) -> Self {
        Self {
            source: None,
            provider_id: provider_id.into(),
        }
    }

    /// Accepts either the qualified or the raw form. Only the prefixes in
    /// `KNOWN_SOURCES` qualify an id; provider ids may contain underscores.
    pub fn parse(key: &str) -> Self {
        KNOWN_SOURCES
            .iter()
            .find_map(|source| Self::strip_source(source, key))
            .unwrap_or_else(|| Self::raw_only(key.trim()))
    }

    /// Like `parse`, for ids that can only belong to `source`.
    pub fn parse_for(source: &str, key: &str) -> Self {
        Self::strip_source(source, key).unwrap_or_else(|| Self::raw_only(key.trim()))
    }

    fn strip_source(source: &str, key: &str) -> Option<Self> {
        let rest = key.trim().strip_prefix(source)?.strip_prefix('_')?;
        (!rest.is_empty()).then(|| Self::new(source, rest))
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn raw(&self) -> &str {
        &self.provider_id
    }

    pub fn qualified(&self) -> Option<String> {
        self.source
            .as_ref()
            .map(|source| format!("{source}_{}", self.provider_id))
    }

    /// Every form this id is known by, qualified first.
    pub fn forms(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(2);
        if let Some(qualified) = self.qualified() {
            out.push(qualified);
        }
        out.push(self.provider_id.clone());
        out
    }

    /// Uniqueness key used by result sinks; identical for both forms.
    pub fn storage_key(&self) -> &str {
        &self.provider_id
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{source}_{}", self.provider_id),
            None => f.write_str(&self.provider_id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingMeta {
    pub white_rating: Option<u32>,
    pub black_rating: Option<u32>,
    pub time_control: Option<String>,
}

/// Move data as delivered by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveSource {
    List(Vec<String>),
    Annotated(String),
}

impl MoveSource {
    /// Bare move tokens with move numbers, comments, variations, NAGs and
    /// result markers removed.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            MoveSource::List(moves) => moves
                .iter()
                .flat_map(|m| m.split_whitespace())
                .filter_map(normalize_move_token)
                .collect(),
            MoveSource::Annotated(text) => tokenize_movetext(text),
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens().len()
    }
}

fn tokenize_movetext(text: &str) -> Vec<String> {
    let mut cleaned = String::with_capacity(text.len());
    let mut in_comment = false;
    let mut in_header = false;
    let mut in_line_comment = false;
    let mut variation_depth = 0usize;

    for ch in text.chars() {
        if in_line_comment {
            if ch == '\n' {
                in_line_comment = false;
                cleaned.push(' ');
            }
            continue;
        }
        if in_comment {
            if ch == '}' {
                in_comment = false;
                cleaned.push(' ');
            }
            continue;
        }
        if in_header {
            if ch == ']' {
                in_header = false;
                cleaned.push(' ');
            }
            continue;
        }
        match ch {
            '{' => in_comment = true,
            '[' => in_header = true,
            ';' => in_line_comment = true,
            '(' => variation_depth += 1,
            ')' => {
                variation_depth = variation_depth.saturating_sub(1);
                cleaned.push(' ');
            }
            _ if variation_depth > 0 => {}
            _ => cleaned.push(ch),
        }
    }

    cleaned
        .split_whitespace()
        .filter_map(normalize_move_token)
        .collect()
}

fn normalize_move_token(token: &str) -> Option<String> {
    if token.starts_with('$') {
        return None;
    }
    if matches!(token, "1-0" | "0-1" | "1/2-1/2" | "½-½" | "*") {
        return None;
    }
    let after_digits = token.trim_start_matches(|c: char| c.is_ascii_digit());
    let token = if after_digits.len() < token.len() && after_digits.starts_with('.') {
        after_digits.trim_start_matches('.')
    } else {
        token
    };
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: RecordId,
    pub provider_name: String,
    pub moves: MoveSource,
    pub declared_outcome: Classification,
    pub rating: RatingMeta,
    pub fetched_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn ply_count(&self) -> usize {
        self.moves.token_count()
    }
}

/// Canonical board state at a chosen ply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// FEN prefix: placement, side to move, castling rights, en-passant square.
    pub canonical_state: String,
    pub content_hash: String,
    pub ply_index: u32,
    pub side_to_move: Side,
    /// Placement sorted by square.
    pub pieces: Vec<PlacedPiece>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalPhase {
    Early,
    Middle,
    Late,
}

impl TemporalPhase {
    pub const EARLY_BELOW_PLY: u32 = 20;
    pub const MIDDLE_BELOW_PLY: u32 = 60;

    pub fn from_ply(ply: u32) -> Self {
        if ply < Self::EARLY_BELOW_PLY {
            TemporalPhase::Early
        } else if ply < Self::MIDDLE_BELOW_PLY {
            TemporalPhase::Middle
        } else {
            TemporalPhase::Late
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TemporalPhase::Early => "early",
            TemporalPhase::Middle => "middle",
            TemporalPhase::Late => "late",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// Four regions: wing x board half.
    #[default]
    Basic,
    /// Eight regions: wing x two-rank band.
    Enhanced,
}

impl SignatureMode {
    pub fn rank_bands(self) -> u8 {
        match self {
            SignatureMode::Basic => 2,
            SignatureMode::Enhanced => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wing {
    Queenside,
    Kingside,
}

impl Wing {
    pub fn of_file(file: u8) -> Self {
        if file < 4 {
            Wing::Queenside
        } else {
            Wing::Kingside
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Wing::Queenside => "queenside",
            Wing::Kingside => "kingside",
        }
    }
}

/// One cell of a disjoint board partition: a wing crossed with a band of ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub wing: Wing,
    pub band: u8,
    pub bands: u8,
}

impl Region {
    pub fn all(mode: SignatureMode) -> Vec<Region> {
        let bands = mode.rank_bands();
        let mut out = Vec::with_capacity(bands as usize * 2);
        for band in 0..bands {
            for wing in [Wing::Queenside, Wing::Kingside] {
                out.push(Region { wing, band, bands });
            }
        }
        out
    }

    pub fn of_square(square: Square, mode: SignatureMode) -> Region {
        let bands = mode.rank_bands();
        let ranks_per_band = 8 / bands;
        Region {
            wing: Wing::of_file(square_file(square)),
            band: square_rank(square) / ranks_per_band,
            bands,
        }
    }

    pub fn first_rank(&self) -> u8 {
        self.band * (8 / self.bands)
    }

    pub fn last_rank(&self) -> u8 {
        self.first_rank() + 8 / self.bands - 1
    }

    /// How far into enemy territory the region lies for `side`: 0.0 at its own
    /// back ranks, 1.0 at the opponent's.
    pub fn depth_for(&self, side: Side) -> f64 {
        let white_depth = if self.bands > 1 {
            f64::from(self.band) / f64::from(self.bands - 1)
        } else {
            0.0
        };
        match side {
            Side::White => white_depth,
            Side::Black => 1.0 - white_depth,
        }
    }

    pub fn name(&self) -> String {
        format!(
            "{}_r{}-{}",
            self.wing.as_str(),
            self.first_rank() + 1,
            self.last_rank() + 1
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionOccupancy {
    pub region: Region,
    /// Share of all units located in this region.
    pub fraction: f64,
    /// White units in this region as a share of all units.
    pub white: f64,
    /// Black units in this region as a share of all units.
    pub black: f64,
    /// (white - black) / units in region; 0.0 for an empty region.
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDominance {
    pub kind: PieceKind,
    /// Share of all units that are of this kind.
    pub share: f64,
    /// (white - black) / units of this kind; 0.0 when absent.
    pub advantage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureProfile {
    pub mode: SignatureMode,
    pub phase: TemporalPhase,
    pub regions: Vec<RegionOccupancy>,
    pub dominance: Vec<TypeDominance>,
    /// (white material - black material) / total material.
    pub material_balance: f64,
    /// Share of units currently attacked by an enemy unit.
    pub tension: f64,
    pub total_units: u32,
}

impl SignatureProfile {
    pub fn region(&self, region: &Region) -> Option<&RegionOccupancy> {
        self.regions.iter().find(|r| &r.region == region)
    }

    pub fn dominance_of(&self, kind: PieceKind) -> Option<&TypeDominance> {
        self.dominance.iter().find(|d| d.kind == kind)
    }
}

/// Which feature dominates a signature profile. Metadata for analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    RegionConcentrated(Region),
    UnitTypeDominant(PieceKind),
    Balanced,
}

impl Archetype {
    pub fn tag(&self) -> String {
        match self {
            Archetype::RegionConcentrated(region) => {
                format!("region_concentrated:{}", region.name())
            }
            Archetype::UnitTypeDominant(kind) => format!("unit_type_dominant:{}", kind.name()),
            Archetype::Balanced => "balanced".to_string(),
        }
    }
}

/// One stored prediction per record. Never updated after the first insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub record_id: RecordId,
    pub checkpoint_hash: String,
    pub baseline_class: Classification,
    pub baseline_confidence: f64,
    pub hybrid_class: Classification,
    pub hybrid_confidence: f64,
    pub archetype_tag: String,
    pub overrule_reason: Option<String>,
    pub actual_outcome: Classification,
    pub baseline_correct: bool,
    pub hybrid_correct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifiedOutput {
    pub class: Classification,
    pub confidence: f64,
}

impl Prediction {
    pub fn new(
        record_id: RecordId,
        checkpoint_hash: impl Into<String>,
        baseline: ClassifiedOutput,
        hybrid: ClassifiedOutput,
        archetype_tag: impl Into<String>,
        overrule_reason: Option<String>,
        actual_outcome: Classification,
    ) -> Self {
        Self {
            record_id,
            checkpoint_hash: checkpoint_hash.into(),
            baseline_class: baseline.class,
            baseline_confidence: baseline.confidence,
            hybrid_class: hybrid.class,
            hybrid_confidence: hybrid.confidence,
            archetype_tag: archetype_tag.into(),
            overrule_reason,
            actual_outcome,
            baseline_correct: baseline.class == actual_outcome,
            hybrid_correct: hybrid.class == actual_outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_forms_round_trip_through_parse() {
        let qualified = RecordId::parse("lichess_AbCd1234");
        assert_eq!(qualified.source(), Some("lichess"));
        assert_eq!(qualified.raw(), "AbCd1234");
        assert_eq!(qualified.qualified().as_deref(), Some("lichess_AbCd1234"));
        assert_eq!(qualified.forms(), vec!["lichess_AbCd1234", "AbCd1234"]);

        let raw = RecordId::parse("AbCd1234");
        assert_eq!(raw.source(), None);
        assert_eq!(raw.forms(), vec!["AbCd1234"]);
        assert_eq!(raw.storage_key(), qualified.storage_key());
    }

    #[test]
    fn record_id_parse_ignores_uppercase_prefixes() {
        let id = RecordId::parse("Game_42");
        assert_eq!(id.source(), None);
        assert_eq!(id.raw(), "Game_42");
    }

    #[test]
    fn raw_ids_with_underscores_stay_raw() {
        let id = RecordId::parse("abc_def");
        assert_eq!(id.source(), None);
        assert_eq!(id.storage_key(), "abc_def");
        assert_eq!(id.forms(), vec!["abc_def"]);

        let nested = RecordId::parse("chesscom_live_981234");
        assert_eq!(nested.source(), Some("chesscom"));
        assert_eq!(nested.storage_key(), "live_981234");
        assert_eq!(RecordId::parse("lichess_"), RecordId::raw_only("lichess_"));
    }

    #[test]
    fn parse_for_only_strips_the_named_source() {
        let id = RecordId::parse_for("club", "club_game_7");
        assert_eq!(id.source(), Some("club"));
        assert_eq!(id.raw(), "game_7");
        assert_eq!(RecordId::parse_for("club", "lichess_x1").source(), None);
    }

    #[test]
    fn movetext_tokenizer_strips_annotations() {
        let pgn = "[Event \"Casual\"]\n[Site \"?\"]\n\n1. e4 {best by test} e5 2. Nf3 (2. f4 exf4) Nc6 $1 3... a6 ; trailing\n4. O-O 1-0";
        let tokens = MoveSource::Annotated(pgn.to_string()).tokens();
        assert_eq!(tokens, vec!["e4", "e5", "Nf3", "Nc6", "a6", "O-O"]);
    }

    #[test]
    fn move_list_keeps_zero_castling_tokens() {
        let tokens = MoveSource::List(vec!["1.e4".into(), "c5".into(), "0-0".into()]).tokens();
        assert_eq!(tokens, vec!["e4", "c5", "0-0"]);
    }

    #[test]
    fn square_helpers_agree() {
        assert_eq!(parse_square("a1"), Some(0));
        assert_eq!(parse_square("h8"), Some(63));
        assert_eq!(parse_square("i1"), None);
        assert_eq!(square_name(28), "e4");
    }

    #[test]
    fn regions_partition_the_board() {
        for mode in [SignatureMode::Basic, SignatureMode::Enhanced] {
            let regions = Region::all(mode);
            assert_eq!(regions.len(), mode.rank_bands() as usize * 2);
            for square in 0..64u8 {
                let region = Region::of_square(square, mode);
                assert!(regions.contains(&region));
                assert!(square_rank(square) >= region.first_rank());
                assert!(square_rank(square) <= region.last_rank());
            }
        }
    }

    #[test]
    fn region_depth_mirrors_between_sides() {
        for region in Region::all(SignatureMode::Enhanced) {
            let sum = region.depth_for(Side::White) + region.depth_for(Side::Black);
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn prediction_records_correctness_against_outcome() {
        let p = Prediction::new(
            RecordId::new("lichess", "x1"),
            "hash",
            ClassifiedOutput { class: Classification::Draw, confidence: 0.4 },
            ClassifiedOutput { class: Classification::White, confidence: 0.8 },
            "balanced",
            Some("signature_override".into()),
            Classification::White,
        );
        assert!(!p.baseline_correct);
        assert!(p.hybrid_correct);
        let json = serde_json::to_string(&p).unwrap();
        let back: Prediction = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
