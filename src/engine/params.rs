//! Sampling parameters for draft requests.
//!
//! All fields have safe defaults. Parameters are validated at admission.

use serde::{Deserialize, Serialize};

use super::error::SyncError;

/// How the draft model decides how far to speculate.
///
/// The assistant-token budget and the confidence threshold are mutually
/// exclusive; holding them in one enum makes the exclusion structural.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculativeMode {
    /// Not a speculative request: the draft model extends it once per round.
    #[default]
    Disabled,
    /// Draft a fixed number of tokens per round.
    AssistantTokens(usize),
    /// Draft while candidate probability stays above the threshold.
    ConfidenceThreshold(f32),
}

impl SpeculativeMode {
    /// Build a mode from the two raw knobs, where zero means "unset".
    ///
    /// Setting both knobs is rejected.
    pub fn from_knobs(
        num_assistant_tokens: usize,
        assistant_confidence_threshold: f32,
    ) -> Result<Self, SyncError> {
        match (num_assistant_tokens, assistant_confidence_threshold) {
            (0, t) if t == 0.0 => Ok(Self::Disabled),
            (n, t) if t == 0.0 => Ok(Self::AssistantTokens(n)),
            (0, t) => {
                let mode = Self::ConfidenceThreshold(t);
                mode.validate()?;
                Ok(mode)
            }
            _ => Err(SyncError::InvalidParams(
                "num_assistant_tokens and assistant_confidence_threshold are mutually exclusive"
                    .into(),
            )),
        }
    }

    /// True for both speculative variants.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Per-round draft budget, if running in budget mode.
    pub fn assistant_tokens(&self) -> Option<usize> {
        match self {
            Self::AssistantTokens(n) => Some(*n),
            _ => None,
        }
    }

    /// Confidence threshold, if running in threshold mode.
    pub fn confidence_threshold(&self) -> Option<f32> {
        match self {
            Self::ConfidenceThreshold(t) => Some(*t),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        match *self {
            Self::AssistantTokens(0) => Err(SyncError::InvalidParams(
                "assistant token budget must be > 0".into(),
            )),
            Self::ConfidenceThreshold(t) if !(t > 0.0 && t <= 1.0) => Err(
                SyncError::InvalidParams("confidence threshold must be in range (0.0, 1.0]".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// Per-request sampling parameters, including the speculative knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// Maximum number of tokens to generate after the prompt.
    pub max_new_tokens: usize,
    /// Number of sequences the caller wants back.
    pub num_return_sequences: usize,
    /// Speculative decoding activation mode.
    pub speculative: SpeculativeMode,
    /// Repetition penalty (1.0 = none, >1.0 = penalize repeats)
    pub repetition_penalty: f32,
    /// Penalty proportional to how often a token was generated.
    pub frequency_penalty: f32,
    /// Flat penalty for any token generated at least once.
    pub presence_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            num_return_sequences: 1,
            speculative: SpeculativeMode::Disabled,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

impl SamplingParams {
    /// Speculative request drafting `n` tokens per round.
    pub fn with_assistant_tokens(n: usize) -> Self {
        Self { speculative: SpeculativeMode::AssistantTokens(n), ..Default::default() }
    }

    /// Speculative request drafting while confidence exceeds `threshold`.
    pub fn with_confidence_threshold(threshold: f32) -> Self {
        Self { speculative: SpeculativeMode::ConfidenceThreshold(threshold), ..Default::default() }
    }

    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = n;
        self
    }

    pub fn num_return_sequences(mut self, n: usize) -> Self {
        self.num_return_sequences = n;
        self
    }

    pub fn repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    pub fn frequency_penalty(mut self, penalty: f32) -> Self {
        self.frequency_penalty = penalty;
        self
    }

    pub fn presence_penalty(mut self, penalty: f32) -> Self {
        self.presence_penalty = penalty;
        self
    }

    /// A request is eligible for speculative decoding iff exactly one knob is set.
    pub fn is_speculative_decoding(&self) -> bool {
        self.speculative.is_enabled()
    }

    /// Validate parameter values. Returns error on invalid values.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.num_return_sequences == 0 {
            return Err(SyncError::InvalidParams(
                "num_return_sequences must be >= 1".into(),
            ));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(SyncError::InvalidParams(
                "repetition_penalty must be > 0.0".into(),
            ));
        }
        if !(-2.0..=2.0).contains(&self.frequency_penalty) {
            return Err(SyncError::InvalidParams(
                "frequency_penalty must be between -2.0 and 2.0".into(),
            ));
        }
        if !(-2.0..=2.0).contains(&self.presence_penalty) {
            return Err(SyncError::InvalidParams(
                "presence_penalty must be between -2.0 and 2.0".into(),
            ));
        }
        self.speculative.validate()
    }
}
