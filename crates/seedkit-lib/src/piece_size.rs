//! Piece size selection for freshly hashed content.

use crate::error::{Error, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

pub const MIN_PIECE_SIZE: u64 = 32 * KIB;
pub const MAX_PIECE_SIZE: u64 = 128 * MIB;
/// Ceiling enforced by trackers that reject larger pieces
pub const CAPPED_PIECE_SIZE: u64 = 16 * MIB;

/// Content size upper bounds (in MiB) and the piece size used up to that bound.
const BREAKPOINTS: [(u64, u64); 12] = [
    (60, 32 * KIB),
    (120, 64 * KIB),
    (240, 128 * KIB),
    (480, 256 * KIB),
    (960, 512 * KIB),
    (1920, MIB),
    (3840, 2 * MIB),
    (7680, 4 * MIB),
    (15360, 8 * MIB),
    (46080, 16 * MIB),
    (92160, 32 * MIB),
    (138240, 64 * MIB),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceSizeConstraint {
    DefaultTable,
    TrackerCap,
    UserOverride,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceSizePlan {
    pub total_size: u64,
    pub piece_size: u64,
    pub constraint: PieceSizeConstraint,
}

impl PieceSizePlan {
    pub fn piece_count(&self) -> u64 {
        piece_count(self.total_size, self.piece_size)
    }

    pub fn exponent(&self) -> u32 {
        piece_length_exponent(self.piece_size)
    }
}

/// Inputs to [`plan`].
#[derive(Debug, Clone, Default)]
pub struct PieceSizeRequest<'a> {
    pub total_size: u64,
    /// User-supplied ceiling in MiB
    pub user_max_mib: Option<u64>,
    /// Trackers the content is headed to
    pub trackers: &'a [String],
    /// Trackers that can't take pieces above [`CAPPED_PIECE_SIZE`]
    pub capped_trackers: &'a [String],
}

pub fn plan(request: &PieceSizeRequest<'_>) -> Result<PieceSizePlan> {
    let total_size = request.total_size;
    if total_size == 0 {
        return Err(Error::InvalidInput("cannot plan pieces for empty content".to_owned()));
    }

    let mut piece_size = BREAKPOINTS
        .iter()
        .find(|(bound_mib, _)| total_size <= bound_mib * MIB)
        .map_or(MAX_PIECE_SIZE, |(_, piece)| *piece);
    let mut constraint = PieceSizeConstraint::DefaultTable;

    let capped = request
        .trackers
        .iter()
        .any(|t| request.capped_trackers.iter().any(|c| c.eq_ignore_ascii_case(t)));
    if capped && piece_size > CAPPED_PIECE_SIZE {
        piece_size = CAPPED_PIECE_SIZE;
        constraint = PieceSizeConstraint::TrackerCap;
    }

    let ceiling = request
        .user_max_mib
        .and_then(|mib| mib.checked_mul(MIB))
        .map(floor_power_of_two)
        .map_or(MAX_PIECE_SIZE, |max| max.clamp(MIN_PIECE_SIZE, MAX_PIECE_SIZE));
    if piece_size > ceiling {
        piece_size = ceiling;
        constraint = PieceSizeConstraint::UserOverride;
    }

    if piece_size < MIN_PIECE_SIZE {
        piece_size = MIN_PIECE_SIZE;
        constraint = PieceSizeConstraint::Minimum;
    }

    tracing::debug!(total_size, piece_size, ?constraint, "planned piece size");

    Ok(PieceSizePlan {
        total_size,
        piece_size,
        constraint,
    })
}

pub fn piece_count(total_size: u64, piece_size: u64) -> u64 {
    total_size.div_ceil(piece_size)
}

/// `log2(piece_size)`, the form `mkbrr -l` expects.
pub fn piece_length_exponent(piece_size: u64) -> u32 {
    piece_size.max(1).ilog2()
}

fn floor_power_of_two(value: u64) -> u64 {
    if value == 0 {
        0
    } else {
        1 << value.ilog2()
    }
}
