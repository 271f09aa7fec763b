//! Demographic weighting tables.
//!
//! The adjustment and priority tables are empirical tuning values keyed by
//! `(Gender, AgeBucket)`. Unmapped inputs fall back to documented defaults
//! instead of erroring: unknown gender codes are treated as male, missing or
//! invalid ages as the thirties bucket and under-20 ages as the twenties
//! bucket.

use crate::models::CATEGORY_COUNT;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    /// Gender arrives from the application as a 0/1 code.
    pub fn from_code(code: i32) -> Gender {
        match code {
            1 => Gender::Male,
            0 => Gender::Female,
            other => {
                warn!(code = other, "Unknown gender code, defaulting to male");
                Gender::Male
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgeBucket {
    Twenties,
    Thirties,
    Forties,
    FiftiesPlus,
}

impl AgeBucket {
    pub fn from_age(age: i32) -> AgeBucket {
        match age {
            20..=29 => AgeBucket::Twenties,
            30..=39 => AgeBucket::Thirties,
            40..=49 => AgeBucket::Forties,
            a if a >= 50 => AgeBucket::FiftiesPlus,
            _ => {
                warn!(age, "Age under 20, bucketing as twenties");
                AgeBucket::Twenties
            }
        }
    }
}

/// Neutral adjustment used when no demographics were supplied.
pub const NO_ADJUSTMENT: [f64; CATEGORY_COUNT] = [0.0; CATEGORY_COUNT];

/// Tie-break priority used when no demographics were supplied; higher value
/// wins the tie.
pub const DEFAULT_PRIORITY: [u8; CATEGORY_COUNT] = [4, 5, 3, 2, 6, 1, 7];

/// Additive per-category weight adjustment for a demographic bucket, in
/// canonical category order (transport, restaurant, health, convenience,
/// cafe, chicken, leisure).
pub fn weight_adjustments(gender: Gender, bucket: AgeBucket) -> [f64; CATEGORY_COUNT] {
    match (gender, bucket) {
        (Gender::Male, AgeBucket::Twenties) => [0.0, 0.2, -0.2, 0.1, -0.1, 0.3, 0.4],
        (Gender::Female, AgeBucket::Twenties) => [0.1, 0.1, -0.1, 0.0, 0.5, 0.0, 0.2],
        (Gender::Male, AgeBucket::Thirties) => [-0.2, 0.1, 0.0, 0.0, 0.0, 0.1, 0.2],
        (Gender::Female, AgeBucket::Thirties) => [-0.1, 0.0, 0.1, 0.1, 0.3, -0.1, 0.1],
        (Gender::Male, AgeBucket::Forties) => [-0.2, 0.0, 0.2, 0.0, -0.1, 0.0, 0.1],
        (Gender::Female, AgeBucket::Forties) => [-0.1, 0.0, 0.3, 0.1, 0.1, -0.1, 0.0],
        (Gender::Male, AgeBucket::FiftiesPlus) => [-0.1, -0.1, 0.5, 0.1, -0.2, -0.2, 0.2],
        (Gender::Female, AgeBucket::FiftiesPlus) => [0.0, -0.1, 0.5, 0.2, 0.0, -0.2, 0.0],
    }
}

/// Category priority for dominant-category tie-breaking; higher value wins.
pub fn category_priority(gender: Gender, bucket: AgeBucket) -> [u8; CATEGORY_COUNT] {
    match (gender, bucket) {
        (Gender::Male, AgeBucket::Twenties) => [3, 5, 1, 2, 4, 6, 7],
        (Gender::Female, AgeBucket::Twenties) => [3, 4, 1, 2, 7, 5, 6],
        (Gender::Male, AgeBucket::Thirties) => [2, 5, 3, 4, 6, 1, 7],
        (Gender::Female, AgeBucket::Thirties) => [2, 4, 5, 3, 7, 1, 6],
        (Gender::Male, AgeBucket::Forties) => [2, 4, 7, 3, 1, 5, 6],
        (Gender::Female, AgeBucket::Forties) => [2, 3, 7, 5, 6, 1, 4],
        (Gender::Male, AgeBucket::FiftiesPlus) => [3, 2, 7, 5, 1, 4, 6],
        (Gender::Female, AgeBucket::FiftiesPlus) => [3, 2, 7, 6, 4, 1, 5],
    }
}
