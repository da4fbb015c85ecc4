//! Minimal legal-move board used to replay provider move lists.
//!
//! Accepts SAN (`Nbd7`, `exd8=Q+`, `O-O-O`) and long algebraic/UCI (`e2e4`,
//! `e7e8q`) tokens. Only what replay needs is implemented: there is no move
//! generation beyond resolving a single token to a legal move.

use thiserror::Error;
use tpr_core::{
    parse_square, square_file, square_rank, Piece, PieceKind, PlacedPiece, Side, Square,
};

pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

const KNIGHT_STEPS: [(i8, i8); 8] = [
    (1, 2),
    (2, 1),
    (2, -1),
    (1, -2),
    (-1, -2),
    (-2, -1),
    (-2, 1),
    (-1, 2),
];
const KING_STEPS: [(i8, i8); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];
const ROOK_DIRS: [(i8, i8); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
const BISHOP_DIRS: [(i8, i8); 4] = [(1, 1), (1, -1), (-1, 1), (-1, -1)];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
    #[error("malformed move token {0:?}")]
    Malformed(String),
    #[error("no legal move matches {0:?}")]
    NoCandidate(String),
    #[error("move {0:?} is ambiguous")]
    Ambiguous(String),
    #[error("castling not allowed: {0:?}")]
    IllegalCastle(String),
    #[error("invalid FEN: {0}")]
    InvalidFen(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CastlingRights {
    pub white_kingside: bool,
    pub white_queenside: bool,
    pub black_kingside: bool,
    pub black_queenside: bool,
}

impl CastlingRights {
    fn all() -> Self {
        Self {
            white_kingside: true,
            white_queenside: true,
            black_kingside: true,
            black_queenside: true,
        }
    }

    fn get(&self, side: Side, kingside: bool) -> bool {
        match (side, kingside) {
            (Side::White, true) => self.white_kingside,
            (Side::White, false) => self.white_queenside,
            (Side::Black, true) => self.black_kingside,
            (Side::Black, false) => self.black_queenside,
        }
    }

    fn clear(&mut self, side: Side, kingside: bool) {
        match (side, kingside) {
            (Side::White, true) => self.white_kingside = false,
            (Side::White, false) => self.white_queenside = false,
            (Side::Black, true) => self.black_kingside = false,
            (Side::Black, false) => self.black_queenside = false,
        }
    }

    fn fen(&self) -> String {
        let mut out = String::new();
        if self.white_kingside {
            out.push('K');
        }
        if self.white_queenside {
            out.push('Q');
        }
        if self.black_kingside {
            out.push('k');
        }
        if self.black_queenside {
            out.push('q');
        }
        if out.is_empty() {
            out.push('-');
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    squares: [Option<Piece>; 64],
    side_to_move: Side,
    castling: CastlingRights,
    en_passant: Option<Square>,
    ply: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Move {
    from: Square,
    to: Square,
    promotion: Option<PieceKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SanMove {
    Castle { kingside: bool },
    Normal {
        kind: PieceKind,
        to: Square,
        from_file: Option<u8>,
        from_rank: Option<u8>,
        capture: bool,
        promotion: Option<PieceKind>,
    },
}

fn offset(square: Square, df: i8, dr: i8) -> Option<Square> {
    let file = square_file(square) as i8 + df;
    let rank = square_rank(square) as i8 + dr;
    if (0..8).contains(&file) && (0..8).contains(&rank) {
        Some((rank * 8 + file) as Square)
    } else {
        None
    }
}

fn forward(side: Side) -> i8 {
    match side {
        Side::White => 1,
        Side::Black => -1,
    }
}

fn home_rank(side: Side) -> u8 {
    match side {
        Side::White => 0,
        Side::Black => 7,
    }
}

impl Default for Board {
    fn default() -> Self {
        Self::starting()
    }
}

impl Board {
    pub fn starting() -> Self {
        let mut squares = [None; 64];
        let back = [
            PieceKind::Rook,
            PieceKind::Knight,
            PieceKind::Bishop,
            PieceKind::Queen,
            PieceKind::King,
            PieceKind::Bishop,
            PieceKind::Knight,
            PieceKind::Rook,
        ];
        for (file, kind) in back.iter().enumerate() {
            squares[file] = Some(Piece::new(Side::White, *kind));
            squares[8 + file] = Some(Piece::new(Side::White, PieceKind::Pawn));
            squares[48 + file] = Some(Piece::new(Side::Black, PieceKind::Pawn));
            squares[56 + file] = Some(Piece::new(Side::Black, *kind));
        }
        Self {
            squares,
            side_to_move: Side::White,
            castling: CastlingRights::all(),
            en_passant: None,
            ply: 0,
        }
    }

    /// Parses the first four FEN fields; move counters are optional and ignored.
    pub fn from_fen(fen: &str) -> Result<Self, MoveError> {
        let mut fields = fen.split_whitespace();
        let placement = fields
            .next()
            .ok_or_else(|| MoveError::InvalidFen("empty".to_string()))?;

        let mut squares = [None; 64];
        let ranks: Vec<&str> = placement.split('/').collect();
        if ranks.len() != 8 {
            return Err(MoveError::InvalidFen(format!("expected 8 ranks in {placement}")));
        }
        for (i, rank_text) in ranks.iter().enumerate() {
            let rank = 7 - i as u8;
            let mut file = 0u8;
            for ch in rank_text.chars() {
                if let Some(skip) = ch.to_digit(10) {
                    file += skip as u8;
                    continue;
                }
                let piece = Piece::from_fen_char(ch)
                    .ok_or_else(|| MoveError::InvalidFen(format!("bad piece {ch:?}")))?;
                if file >= 8 {
                    return Err(MoveError::InvalidFen(format!("rank {rank_text} too long")));
                }
                squares[(rank * 8 + file) as usize] = Some(piece);
                file += 1;
            }
            if file != 8 {
                return Err(MoveError::InvalidFen(format!("rank {rank_text} has {file} files")));
            }
        }

        let side_to_move = match fields.next().unwrap_or("w") {
            "w" => Side::White,
            "b" => Side::Black,
            other => return Err(MoveError::InvalidFen(format!("bad side {other:?}"))),
        };

        let mut castling = CastlingRights::default();
        for ch in fields.next().unwrap_or("-").chars() {
            match ch {
                'K' => castling.white_kingside = true,
                'Q' => castling.white_queenside = true,
                'k' => castling.black_kingside = true,
                'q' => castling.black_queenside = true,
                '-' => {}
                other => return Err(MoveError::InvalidFen(format!("bad castling {other:?}"))),
            }
        }

        let en_passant = match fields.next().unwrap_or("-") {
            "-" => None,
            text => Some(
                parse_square(text)
                    .ok_or_else(|| MoveError::InvalidFen(format!("bad en-passant {text:?}")))?,
            ),
        };

        Ok(Self {
            squares,
            side_to_move,
            castling,
            en_passant,
            ply: 0,
        })
    }

    /// Board with the given placement and nothing else (no castling, no en passant).
    pub fn from_placement(pieces: &[PlacedPiece], side_to_move: Side) -> Self {
        let mut squares = [None; 64];
        for placed in pieces {
            if let Some(slot) = squares.get_mut(placed.square as usize) {
                *slot = Some(placed.piece);
            }
        }
        Self {
            squares,
            side_to_move,
            castling: CastlingRights::default(),
            en_passant: None,
            ply: 0,
        }
    }

    pub fn side_to_move(&self) -> Side {
        self.side_to_move
    }

    pub fn ply(&self) -> u32 {
        self.ply
    }

    pub fn piece_at(&self, square: Square) -> Option<Piece> {
        self.squares.get(square as usize).copied().flatten()
    }

    pub fn castling(&self) -> CastlingRights {
        self.castling
    }

    pub fn en_passant(&self) -> Option<Square> {
        self.en_passant
    }

    pub fn pieces(&self) -> Vec<PlacedPiece> {
        self.squares
            .iter()
            .enumerate()
            .filter_map(|(sq, p)| {
                p.map(|piece| PlacedPiece {
                    square: sq as Square,
                    piece,
                })
            })
            .collect()
    }

    /// FEN without move counters.
    pub fn fen_prefix(&self) -> String {
        let mut placement = String::new();
        for rank in (0..8u8).rev() {
            let mut empty = 0;
            for file in 0..8u8 {
                match self.squares[(rank * 8 + file) as usize] {
                    Some(piece) => {
                        if empty > 0 {
                            placement.push_str(&empty.to_string());
                            empty = 0;
                        }
                        placement.push(piece.fen_char());
                    }
                    None => empty += 1,
                }
            }
            if empty > 0 {
                placement.push_str(&empty.to_string());
            }
            if rank > 0 {
                placement.push('/');
            }
        }
        let ep = self
            .en_passant
            .map(tpr_core::square_name)
            .unwrap_or_else(|| "-".to_string());
        format!(
            "{placement} {} {} {ep}",
            self.side_to_move.fen_char(),
            self.castling.fen()
        )
    }

    /// Colour-and-rank mirror: white becomes black and rank r becomes 7 - r.
    pub fn mirrored(&self) -> Self {
        let mut squares = [None; 64];
        for (sq, piece) in self.squares.iter().enumerate() {
            if let Some(piece) = piece {
                let sq = sq as Square;
                let target = (7 - square_rank(sq)) * 8 + square_file(sq);
                squares[target as usize] = Some(Piece::new(piece.side.opposite(), piece.kind));
            }
        }
        Self {
            squares,
            side_to_move: self.side_to_move.opposite(),
            castling: CastlingRights {
                white_kingside: self.castling.black_kingside,
                white_queenside: self.castling.black_queenside,
                black_kingside: self.castling.white_kingside,
                black_queenside: self.castling.white_queenside,
            },
            en_passant: self
                .en_passant
                .map(|sq| (7 - square_rank(sq)) * 8 + square_file(sq)),
            ply: self.ply,
        }
    }

    pub fn is_attacked(&self, target: Square, by: Side) -> bool {
        let pawn_rank_step = -forward(by);
        for df in [-1, 1] {
            if let Some(sq) = offset(target, df, pawn_rank_step) {
                if self.piece_at(sq) == Some(Piece::new(by, PieceKind::Pawn)) {
                    return true;
                }
            }
        }
        for (df, dr) in KNIGHT_STEPS {
            if let Some(sq) = offset(target, df, dr) {
                if self.piece_at(sq) == Some(Piece::new(by, PieceKind::Knight)) {
                    return true;
                }
            }
        }
        for (df, dr) in KING_STEPS {
            if let Some(sq) = offset(target, df, dr) {
                if self.piece_at(sq) == Some(Piece::new(by, PieceKind::King)) {
                    return true;
                }
            }
        }
        for (dirs, slider) in [(ROOK_DIRS, PieceKind::Rook), (BISHOP_DIRS, PieceKind::Bishop)] {
            for (df, dr) in dirs {
                let mut cur = target;
                while let Some(next) = offset(cur, df, dr) {
                    if let Some(piece) = self.piece_at(next) {
                        if piece.side == by && (piece.kind == slider || piece.kind == PieceKind::Queen)
                        {
                            return true;
                        }
                        break;
                    }
                    cur = next;
                }
            }
        }
        false
    }

    pub fn king_square(&self, side: Side) -> Option<Square> {
        self.squares
            .iter()
            .position(|p| *p == Some(Piece::new(side, PieceKind::King)))
            .map(|sq| sq as Square)
    }

    pub fn in_check(&self, side: Side) -> bool {
        self.king_square(side)
            .map(|sq| self.is_attacked(sq, side.opposite()))
            .unwrap_or(false)
    }

    /// Resolves one SAN or UCI token and plays it. On error the board is unchanged.
    pub fn apply_token(&mut self, token: &str) -> Result<(), MoveError> {
        let token = token.trim();
        if let Some(mv) = parse_uci(token) {
            return self.apply_uci(token, mv);
        }
        match parse_san(token)? {
            SanMove::Castle { kingside } => self.castle(token, kingside),
            SanMove::Normal {
                kind,
                to,
                from_file,
                from_rank,
                capture,
                promotion,
            } => {
                let candidates: Vec<Square> = self
                    .origins_for(kind, to, capture || from_file.is_some_and(|f| f != square_file(to)))
                    .into_iter()
                    .filter(|from| from_file.is_none_or(|f| square_file(*from) == f))
                    .filter(|from| from_rank.is_none_or(|r| square_rank(*from) == r))
                    .filter(|from| self.is_legal(Move { from: *from, to, promotion }))
                    .collect();
                match candidates.as_slice() {
                    [from] => {
                        self.play(Move {
                            from: *from,
                            to,
                            promotion,
                        });
                        Ok(())
                    }
                    [] => Err(MoveError::NoCandidate(token.to_string())),
                    _ => Err(MoveError::Ambiguous(token.to_string())),
                }
            }
        }
    }

    fn apply_uci(&mut self, token: &str, mv: Move) -> Result<(), MoveError> {
        let piece = self
            .piece_at(mv.from)
            .filter(|p| p.side == self.side_to_move)
            .ok_or_else(|| MoveError::NoCandidate(token.to_string()))?;

        if piece.kind == PieceKind::King && square_file(mv.from).abs_diff(square_file(mv.to)) == 2 {
            return self.castle(token, square_file(mv.to) > square_file(mv.from));
        }

        let capture = square_file(mv.from) != square_file(mv.to);
        if !self.origins_for(piece.kind, mv.to, capture).contains(&mv.from) || !self.is_legal(mv) {
            return Err(MoveError::NoCandidate(token.to_string()));
        }
        self.play(mv);
        Ok(())
    }

    fn castle(&mut self, token: &str, kingside: bool) -> Result<(), MoveError> {
        let side = self.side_to_move;
        let rank = home_rank(side);
        let king_from = rank * 8 + 4;
        let (rook_file, king_to_file, must_be_empty, must_be_safe): (u8, u8, &[u8], &[u8]) =
            if kingside {
                (7, 6, &[5, 6], &[4, 5, 6])
            } else {
                (0, 2, &[1, 2, 3], &[4, 3, 2])
            };

        let illegal = || MoveError::IllegalCastle(token.to_string());
        if !self.castling.get(side, kingside)
            || self.piece_at(king_from) != Some(Piece::new(side, PieceKind::King))
            || self.piece_at(rank * 8 + rook_file) != Some(Piece::new(side, PieceKind::Rook))
        {
            return Err(illegal());
        }
        if must_be_empty.iter().any(|f| self.piece_at(rank * 8 + f).is_some()) {
            return Err(illegal());
        }
        if must_be_safe
            .iter()
            .any(|f| self.is_attacked(rank * 8 + f, side.opposite()))
        {
            return Err(illegal());
        }

        self.play(Move {
            from: king_from,
            to: rank * 8 + king_to_file,
            promotion: None,
        });
        Ok(())
    }

    /// Squares holding a piece of `kind` for the side to move that could reach
    /// `to`, ignoring pins.
    fn origins_for(&self, kind: PieceKind, to: Square, pawn_capture: bool) -> Vec<Square> {
        let side = self.side_to_move;
        let own = Piece::new(side, kind);
        if self.piece_at(to).is_some_and(|p| p.side == side) {
            return Vec::new();
        }

        let mut out = Vec::new();
        match kind {
            PieceKind::Pawn => {
                let back = -forward(side);
                if pawn_capture {
                    let target_enemy = self.piece_at(to).is_some_and(|p| p.side != side);
                    if target_enemy || self.en_passant == Some(to) {
                        for df in [-1, 1] {
                            if let Some(from) = offset(to, df, back) {
                                if self.piece_at(from) == Some(own) {
                                    out.push(from);
                                }
                            }
                        }
                    }
                } else if self.piece_at(to).is_none() {
                    if let Some(one) = offset(to, 0, back) {
                        if self.piece_at(one) == Some(own) {
                            out.push(one);
                        } else if self.piece_at(one).is_none() {
                            let double_rank = match side {
                                Side::White => 3,
                                Side::Black => 4,
                            };
                            if square_rank(to) == double_rank {
                                if let Some(two) = offset(one, 0, back) {
                                    if self.piece_at(two) == Some(own) {
                                        out.push(two);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            PieceKind::Knight | PieceKind::King => {
                let steps = if kind == PieceKind::Knight {
                    KNIGHT_STEPS
                } else {
                    KING_STEPS
                };
                for (df, dr) in steps {
                    if let Some(from) = offset(to, df, dr) {
                        if self.piece_at(from) == Some(own) {
                            out.push(from);
                        }
                    }
                }
            }
            PieceKind::Bishop | PieceKind::Rook | PieceKind::Queen => {
                let dirs: Vec<(i8, i8)> = match kind {
                    PieceKind::Bishop => BISHOP_DIRS.to_vec(),
                    PieceKind::Rook => ROOK_DIRS.to_vec(),
                    _ => ROOK_DIRS.iter().chain(BISHOP_DIRS.iter()).copied().collect(),
                };
                for (df, dr) in dirs {
                    let mut cur = to;
                    while let Some(next) = offset(cur, df, dr) {
                        if let Some(piece) = self.piece_at(next) {
                            if piece == own {
                                out.push(next);
                            }
                            break;
                        }
                        cur = next;
                    }
                }
            }
        }
        out
    }

    fn is_legal(&self, mv: Move) -> bool {
        let side = self.side_to_move;
        let mut next = self.clone();
        next.play(mv);
        !next.in_check(side)
    }

    fn play(&mut self, mv: Move) {
        let side = self.side_to_move;
        let Some(piece) = self.piece_at(mv.from) else {
            return;
        };
        let captured = self.piece_at(mv.to);

        if piece.kind == PieceKind::Pawn
            && Some(mv.to) == self.en_passant
            && captured.is_none()
            && square_file(mv.from) != square_file(mv.to)
        {
            let victim = square_rank(mv.from) * 8 + square_file(mv.to);
            self.squares[victim as usize] = None;
        }

        if piece.kind == PieceKind::King && square_file(mv.from).abs_diff(square_file(mv.to)) == 2 {
            let rank = square_rank(mv.from);
            let (rook_from, rook_to) = if square_file(mv.to) > square_file(mv.from) {
                (rank * 8 + 7, rank * 8 + 5)
            } else {
                (rank * 8, rank * 8 + 3)
            };
            self.squares[rook_to as usize] = self.squares[rook_from as usize].take();
        }

        let placed = if piece.kind == PieceKind::Pawn
            && square_rank(mv.to) == home_rank(side.opposite())
        {
            Piece::new(side, mv.promotion.unwrap_or(PieceKind::Queen))
        } else {
            piece
        };
        self.squares[mv.from as usize] = None;
        self.squares[mv.to as usize] = Some(placed);

        if piece.kind == PieceKind::King {
            self.castling.clear(side, true);
            self.castling.clear(side, false);
        }
        for (corner, owner, kingside) in [
            (7u8, Side::White, true),
            (0u8, Side::White, false),
            (63u8, Side::Black, true),
            (56u8, Side::Black, false),
        ] {
            if mv.from == corner || mv.to == corner {
                self.castling.clear(owner, kingside);
            }
        }

        self.en_passant = None;
        if piece.kind == PieceKind::Pawn && square_rank(mv.from).abs_diff(square_rank(mv.to)) == 2 {
            let passed = offset(mv.from, 0, forward(side));
            let capturable = [-1, 1].iter().any(|df| {
                offset(mv.to, *df, 0)
                    .and_then(|sq| self.piece_at(sq))
                    .is_some_and(|p| p == Piece::new(side.opposite(), PieceKind::Pawn))
            });
            if capturable {
                self.en_passant = passed;
            }
        }

        self.side_to_move = side.opposite();
        self.ply += 1;
    }
}

fn parse_uci(token: &str) -> Option<Move> {
    if !(4..=5).contains(&token.len()) || !token.is_ascii() {
        return None;
    }
    let from = parse_square(&token[0..2])?;
    let to = parse_square(&token[2..4])?;
    let promotion = match token.get(4..5) {
        None => None,
        Some(p) => match PieceKind::from_symbol(p.chars().next()?) {
            Some(kind @ (PieceKind::Queen | PieceKind::Rook | PieceKind::Bishop | PieceKind::Knight))
                if p.chars().all(|c| c.is_ascii_lowercase()) =>
            {
                Some(kind)
            }
            _ => return None,
        },
    };
    Some(Move {
        from,
        to,
        promotion,
    })
}

fn parse_san(token: &str) -> Result<SanMove, MoveError> {
    let malformed = || MoveError::Malformed(token.to_string());
    let text = token.trim_end_matches(['+', '#', '!', '?']);
    if !text.is_ascii() || text.is_empty() {
        return Err(malformed());
    }

    match text {
        "O-O" | "0-0" => return Ok(SanMove::Castle { kingside: true }),
        "O-O-O" | "0-0-0" => return Ok(SanMove::Castle { kingside: false }),
        _ => {}
    }

    let (body, promotion) = if let Some((body, promo)) = text.split_once('=') {
        let kind = promo
            .chars()
            .next()
            .and_then(PieceKind::from_symbol)
            .ok_or_else(malformed)?;
        (body, Some(kind))
    } else {
        let bytes = text.as_bytes();
        let n = bytes.len();
        if n >= 3
            && matches!(bytes[n - 1], b'Q' | b'R' | b'B' | b'N')
            && matches!(bytes[n - 2], b'1' | b'8')
        {
            (&text[..n - 1], PieceKind::from_symbol(bytes[n - 1] as char))
        } else {
            (text, None)
        }
    };
    if matches!(promotion, Some(PieceKind::King | PieceKind::Pawn)) {
        return Err(malformed());
    }
    if body.len() < 2 {
        return Err(malformed());
    }

    let to = parse_square(&body[body.len() - 2..]).ok_or_else(malformed)?;
    let prefix = &body[..body.len() - 2];

    let (kind, rest) = match prefix.chars().next() {
        Some(c @ ('K' | 'Q' | 'R' | 'B' | 'N')) => {
            (PieceKind::from_symbol(c).ok_or_else(malformed)?, &prefix[1..])
        }
        _ => (PieceKind::Pawn, prefix),
    };
    if promotion.is_some() && kind != PieceKind::Pawn {
        return Err(malformed());
    }

    let mut from_file = None;
    let mut from_rank = None;
    let mut capture = false;
    for ch in rest.chars() {
        match ch {
            'x' | ':' => capture = true,
            '-' => {}
            'a'..='h' if from_file.is_none() => from_file = Some(ch as u8 - b'a'),
            '1'..='8' if from_rank.is_none() => from_rank = Some(ch as u8 - b'1'),
            _ => return Err(malformed()),
        }
    }

    Ok(SanMove::Normal {
        kind,
        to,
        from_file,
        from_rank,
        capture,
        promotion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_all(moves: &str) -> Board {
        let mut board = Board::starting();
        for token in moves.split_whitespace() {
            board
                .apply_token(token)
                .unwrap_or_else(|e| panic!("{token}: {e}"));
        }
        board
    }

    #[test]
    fn starting_position_round_trips_through_fen() {
        let board = Board::starting();
        assert_eq!(
            board.fen_prefix(),
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq -"
        );
        assert_eq!(Board::from_fen(STARTING_FEN).unwrap(), board);
    }

    #[test]
    fn opera_game_replays_to_mate() {
        let board = play_all(
            "e4 e5 Nf3 d6 d4 Bg4 dxe5 Bxf3 Qxf3 dxe5 Bc4 Nf6 Qb3 Qe7 Nc3 c6 Bg5 b5 \
             Nxb5 cxb5 Bxb5+ Nbd7 O-O-O Rd8 Rxd7 Rxd7 Rd1 Qe6 Bxd7+ Nxd7 Qb8+ Nxb8 Rd8#",
        );
        assert_eq!(board.ply(), 33);
        assert!(board.in_check(Side::Black));
        assert_eq!(
            board.piece_at(parse_square("d8").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Rook))
        );
    }

    #[test]
    fn knight_disambiguation_by_file() {
        let mut board = play_all("Nf3 d5 d3 e5");
        assert!(matches!(board.apply_token("Nd2"), Err(MoveError::Ambiguous(_))));
        board.apply_token("Nfd2").unwrap();
        assert_eq!(
            board.piece_at(parse_square("d2").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Knight))
        );
        assert_eq!(
            board.piece_at(parse_square("b1").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Knight))
        );
    }

    #[test]
    fn pinned_piece_is_not_a_candidate() {
        // The c3 knight is pinned by the b4 bishop, so only the g1 knight can reach e2.
        let mut board = Board::from_fen("4k3/8/8/8/1b6/2N5/8/4K1N1 w - - 0 1").unwrap();
        board.apply_token("Ne2").unwrap();
        assert_eq!(
            board.piece_at(parse_square("e2").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Knight))
        );
        assert_eq!(
            board.piece_at(parse_square("c3").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Knight))
        );
    }

    #[test]
    fn en_passant_capture_removes_the_pawn() {
        let mut board = play_all("e4 a6 e5 d5");
        assert_eq!(board.en_passant(), parse_square("d6"));
        board.apply_token("exd6").unwrap();
        assert_eq!(board.piece_at(parse_square("d5").unwrap()), None);
        assert_eq!(
            board.piece_at(parse_square("d6").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Pawn))
        );
    }

    #[test]
    fn promotion_with_and_without_equals_sign() {
        let mut board = Board::from_fen("8/P6k/8/8/8/8/7p/K7 w - - 0 1").unwrap();
        board.apply_token("a8=N").unwrap();
        assert_eq!(
            board.piece_at(parse_square("a8").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Knight))
        );
        board.apply_token("h1Q").unwrap();
        assert_eq!(
            board.piece_at(parse_square("h1").unwrap()),
            Some(Piece::new(Side::Black, PieceKind::Queen))
        );
    }

    #[test]
    fn uci_tokens_are_accepted() {
        let mut board = Board::starting();
        for token in ["e2e4", "e7e5", "g1f3", "b8c6", "f1c4", "g8f6", "e1g1"] {
            board.apply_token(token).unwrap();
        }
        assert_eq!(
            board.piece_at(parse_square("g1").unwrap()),
            Some(Piece::new(Side::White, PieceKind::King))
        );
        assert_eq!(
            board.piece_at(parse_square("f1").unwrap()),
            Some(Piece::new(Side::White, PieceKind::Rook))
        );
        assert!(!board.castling().white_kingside);
    }

    #[test]
    fn castling_through_check_is_rejected() {
        let mut board = Board::from_fen("4k3/8/8/8/8/8/5r2/4K2R w K - 0 1").unwrap();
        assert!(matches!(
            board.apply_token("O-O"),
            Err(MoveError::IllegalCastle(_))
        ));
    }

    #[test]
    fn failed_token_leaves_board_untouched() {
        let mut board = play_all("e4 e5");
        let before = board.clone();
        for bad in ["Zz9", "Ke4", "e5", "Qh9", "O-O", ""] {
            assert!(board.apply_token(bad).is_err(), "{bad} should fail");
        }
        assert_eq!(board, before);
    }

    #[test]
    fn mirror_is_an_involution() {
        let board = play_all("e4 c5 Nf3 d6 d4 cxd4");
        assert_eq!(board.mirrored().mirrored(), board);
        assert_eq!(board.mirrored().side_to_move(), Side::Black);
    }
}
