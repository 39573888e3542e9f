use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::ModerationError;

pub const NSFW_LABEL: &str = "nsfw";
pub const NORMAL_LABEL: &str = "normal";

/// Class label to probability, as produced by the classifier.
pub type Predictions = HashMap<String, f32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdPreset {
    /// Flag more aggressively: fewer false negatives, more false positives.
    Strict,
    #[default]
    Balanced,
    /// Only very obvious NSFW: fewer false positives, more false negatives.
    Permissive,
}

impl ThresholdPreset {
    pub const ALL: [ThresholdPreset; 3] = [
        ThresholdPreset::Strict,
        ThresholdPreset::Balanced,
        ThresholdPreset::Permissive,
    ];

    pub fn threshold(self) -> f32 {
        match self {
            ThresholdPreset::Strict => 0.3,
            ThresholdPreset::Balanced => 0.5,
            ThresholdPreset::Permissive => 0.7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdPreset::Strict => "strict",
            ThresholdPreset::Balanced => "balanced",
            ThresholdPreset::Permissive => "permissive",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ThresholdPreset::Strict => "Flag more aggressively (0.3 threshold)",
            ThresholdPreset::Balanced => "Recommended default (0.5 threshold)",
            ThresholdPreset::Permissive => "Only very obvious NSFW (0.7 threshold)",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|preset| preset.as_str()).collect()
    }
}

impl fmt::Display for ThresholdPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThresholdPreset {
    type Err = ModerationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| ModerationError::InvalidThreshold(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub nsfw: f32,
    pub normal: f32,
    pub is_nsfw: bool,
    pub confidence: f32,
    pub threshold_used: f32,
}

/// Ensures both `nsfw` and `normal` are present, deriving a missing one as the
/// complement of the other. `normal` is filled first.
pub fn fill_complement(predictions: &mut Predictions) {
    if !predictions.contains_key(NORMAL_LABEL) {
        let nsfw = predictions.get(NSFW_LABEL).copied().unwrap_or(0.0);
        predictions.insert(NORMAL_LABEL.to_string(), 1.0 - nsfw);
    }
    if !predictions.contains_key(NSFW_LABEL) {
        let normal = predictions.get(NORMAL_LABEL).copied().unwrap_or(0.0);
        predictions.insert(NSFW_LABEL.to_string(), 1.0 - normal);
    }
}

pub fn decide(predictions: &Predictions, preset: ThresholdPreset) -> Decision {
    let mut filled = predictions.clone();
    fill_complement(&mut filled);

    let nsfw = filled[NSFW_LABEL];
    let normal = filled[NORMAL_LABEL];
    let threshold_used = preset.threshold();
    let confidence = filled.values().copied().fold(f32::NEG_INFINITY, f32::max);

    Decision {
        nsfw,
        normal,
        is_nsfw: nsfw >= threshold_used,
        confidence,
        threshold_used,
    }
}
