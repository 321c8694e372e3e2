//! Tunable settings for the image writer

use clap::Args;

/// Default exponent applied to referrer distance when scoring
pub const DEFAULT_SCORE_EXPONENT: f64 = -0.2;
pub const DEFAULT_NORMAL_WEIGHT: u32 = 1000;
pub const DEFAULT_STRONG_WEIGHT: u32 = 1200;
/// Size of the multi-weight bucket above which the writer warns
pub const DEFAULT_FANCY_WARN: usize = 10_000;
/// Largest single record the writer will lay out
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 1 << 24;
/// Largest cold payload (string bytes, limbs, text, masks)
pub const DEFAULT_MAX_PAYLOAD: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Args)]
pub struct DumpSettings {
    /// Exponent applied to referrer distance in the locality score
    #[arg(long = "score-exponent", default_value_t = DEFAULT_SCORE_EXPONENT, allow_negative_numbers = true)]
    pub score_exponent: f64,
    /// Weight of an ordinary reference
    #[arg(long = "normal-weight", default_value_t = DEFAULT_NORMAL_WEIGHT)]
    pub normal_weight: u32,
    /// Weight of a reference that should be written close to its referrer
    #[arg(long = "strong-weight", default_value_t = DEFAULT_STRONG_WEIGHT)]
    pub strong_weight: u32,
    /// Warn when this many objects are pending with multiple weights
    #[arg(long = "fancy-warn", default_value_t = DEFAULT_FANCY_WARN)]
    pub fancy_warn: usize,
    /// Maximum size in bytes of a single record
    #[arg(long = "max-object-size", default_value_t = DEFAULT_MAX_OBJECT_SIZE)]
    pub max_object_size: usize,
    /// Maximum size in bytes of a cold payload
    #[arg(long = "max-payload", default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,
}

impl Default for DumpSettings {
    fn default() -> Self {
        DumpSettings {
            score_exponent: DEFAULT_SCORE_EXPONENT,
            normal_weight: DEFAULT_NORMAL_WEIGHT,
            strong_weight: DEFAULT_STRONG_WEIGHT,
            fancy_warn: DEFAULT_FANCY_WARN,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}
