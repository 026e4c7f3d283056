//! Deterministic experiment bucketing.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Arm assigned when no session identifier is available.
pub const DEFAULT_VARIANT: Variant = Variant::A;

/// One of the two experiment arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    /// First arm.
    A,
    /// Second arm.
    B,
}

impl Variant {
    /// Label used in experiment analytics payloads.
    pub fn wire_label(&self) -> &'static str {
        match self {
            Variant::A => "variantA",
            Variant::B => "variantB",
        }
    }

    /// Parse a label produced by [`Variant::wire_label`].
    pub fn from_wire_label(label: &str) -> Option<Self> {
        match label {
            "variantA" | "A" => Some(Variant::A),
            "variantB" | "B" => Some(Variant::B),
            _ => None,
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::A => f.write_str("A"),
            Variant::B => f.write_str("B"),
        }
    }
}

/// 32-bit signed rolling hash (`h = h * 31 + c`, wrapping) over the characters of `input`.
pub fn rolling_hash(input: &str) -> i32 {
    input.chars().fold(0i32, |hash, c| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(c as i32)
    })
}

/// Assign the experiment arm for a `(session, game)` pair.
///
/// The assignment is recomputed on every call and never cached: the same inputs always land
/// in the same arm. Odd hashes map to [`Variant::A`], even ones to [`Variant::B`]. Parity is
/// taken on the magnitude, so a negative odd hash is still [`Variant::A`].
pub fn determine_variant(session_id: Option<&str>, game_id: &str) -> Variant {
    let Some(session_id) = session_id.filter(|id| !id.is_empty()) else {
        warn!(game_id, "no session id available; using default experiment variant");
        return DEFAULT_VARIANT;
    };

    let hash = rolling_hash(&format!("{session_id}_{game_id}"));
    if hash.unsigned_abs() % 2 == 1 {
        Variant::A
    } else {
        Variant::B
    }
}
