//! Input validation for the knobs of [`WorkloadConfig`].
//!
//! Text coming from the command line, the query string or an editable field
//! is checked here before it reaches the cost model.

use thiserror::Error;

use crate::model::{Accelerator, ModelPreset, Precision};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("`{0}` is not a whole number")]
    NotANumber(String),
    #[error("{field} must be at least {min}, got {value}")]
    TooSmall { field: &'static str, min: u32, value: i64 },
    #[error("unknown accelerator `{0}` (expected one of mi355x, b200, mi325x, mi300x, h200, h100)")]
    UnknownAccelerator(String),
    #[error("unknown precision `{0}` (expected fp4, fp8 or fp16)")]
    UnknownPrecision(String),
    #[error("unknown model `{0}` (expected 8b, 70b or 405b)")]
    UnknownModel(String),
    #[error("unknown sweep axis `{0}` (expected concurrency or tp)")]
    UnknownAxis(String),
    #[error("tensor parallelism must be one of 1, 2, 4 or 8, got {0}")]
    UnsupportedTp(u32),
    #[error("concurrency must be between 1 and {max}, got {value}")]
    TooManyUsers { max: u32, value: u32 },
    #[error("`{0}` is not a boolean")]
    NotAFlag(String),
}

/// Tensor-parallel degrees offered by the configuration table.
pub const TP_OPTIONS: [u32; 4] = [1, 2, 4, 8];

/// Upper end of the concurrency slider.
pub const MAX_CONCURRENCY: u32 = 128;

/// Parse a positive integer for `field`.
pub fn parse_positive(field: &'static str, text: &str) -> Result<u32, InputError> {
    let trimmed = text.trim();
    let value: i64 = trimmed
        .parse()
        .map_err(|_| InputError::NotANumber(trimmed.to_string()))?;
    if value < 1 {
        return Err(InputError::TooSmall { field, min: 1, value });
    }
    u32::try_from(value).map_err(|_| InputError::NotANumber(trimmed.to_string()))
}

/// Sequence length in tokens, at least 1.
#[inline]
pub fn parse_seq_length(text: &str) -> Result<u32, InputError> {
    parse_positive("sequence length", text)
}

pub fn parse_tensor_parallelism(text: &str) -> Result<u32, InputError> {
    let tp = parse_positive("tensor parallelism", text)?;
    if TP_OPTIONS.contains(&tp) {
        Ok(tp)
    } else {
        Err(InputError::UnsupportedTp(tp))
    }
}

pub fn parse_concurrency(text: &str) -> Result<u32, InputError> {
    let users = parse_positive("concurrency", text)?;
    if users > MAX_CONCURRENCY {
        return Err(InputError::TooManyUsers { max: MAX_CONCURRENCY, value: users });
    }
    Ok(users)
}

pub fn parse_accelerator(text: &str) -> Result<Accelerator, InputError> {
    Accelerator::from_str(text).ok_or_else(|| InputError::UnknownAccelerator(text.to_string()))
}

pub fn parse_precision(text: &str) -> Result<Precision, InputError> {
    Precision::from_str(text).ok_or_else(|| InputError::UnknownPrecision(text.to_string()))
}

pub fn parse_model(text: &str) -> Result<ModelPreset, InputError> {
    ModelPreset::from_str(text).ok_or_else(|| InputError::UnknownModel(text.to_string()))
}

pub fn parse_flag(text: &str) -> Result<bool, InputError> {
    match text.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(InputError::NotAFlag(text.to_string())),
    }
}

pub use crate::model::resolve_precision;

// ============================================================================
// Editable Sequence-Length Field
// ============================================================================

/// Text field bound to a sequence length.
///
/// Typing updates the text; a valid entry commits, an invalid one raises the
/// error flag and keeps the last committed value. Blur restores the text of
/// the committed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqLengthField {
    text: String,
    committed: u32,
    invalid: bool,
}

impl SeqLengthField {
    pub fn new(value: u32) -> Self {
        Self {
            text: value.to_string(),
            committed: value,
            invalid: false,
        }
    }

    /// Returns the newly committed value, if the text was accepted.
    pub fn input(&mut self, text: &str) -> Option<u32> {
        self.text = text.to_string();
        match parse_seq_length(text) {
            Ok(n) => {
                self.committed = n;
                self.invalid = false;
                Some(n)
            }
            Err(e) => {
                tracing::debug!(input = text, error = %e, "rejected sequence length");
                self.invalid = true;
                None
            }
        }
    }

    pub fn blur(&mut self) {
        self.text = self.committed.to_string();
        self.invalid = false;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn value(&self) -> u32 {
        self.committed
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid
    }
}

// ============================================================================
// Sequence Presets
// ============================================================================

/// Input/output length pairs matching the published benchmark configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqPreset {
    /// 1k in, 1k out
    Chat,
    /// 1k in, 8k out
    Reasoning,
    /// 8k in, 1k out
    Summarize,
}

impl SeqPreset {
    pub const ALL: [SeqPreset; 3] = [Self::Chat, Self::Reasoning, Self::Summarize];

    pub fn lengths(&self) -> (u32, u32) {
        match self {
            Self::Chat => (1024, 1024),
            Self::Reasoning => (1024, 8192),
            Self::Summarize => (8192, 1024),
        }
    }

    /// Parse `"1024/1024"`, `"1k1k"` style or the preset name.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "chat" | "1024/1024" | "1k1k" => Some(Self::Chat),
            "reasoning" | "1024/8192" | "1k8k" => Some(Self::Reasoning),
            "summarize" | "8192/1024" | "8k1k" => Some(Self::Summarize),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        let (isl, osl) = self.lengths();
        format!("{}/{}", isl, osl)
    }
}
