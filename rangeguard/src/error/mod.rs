//! Error types and reporting

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, InstrumentError>;

/// Instrumentation error
///
/// The first group are broken preconditions from the oracle or from block
/// splitting. They are never recovered from: the caller must discard the
/// function instead of emitting it.
#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("no instruction follows %{value} in block `{block}`")]
    MissingSuccessor { value: String, block: String },

    #[error("fact for %{value} at {block}[{index}] arrived after the block was already split past it")]
    OutOfOrderFact {
        value: String,
        block: String,
        index: usize,
    },

    #[error("known bits for %{value} mark bits {overlap:#x} as both zero and one")]
    ConflictingKnownBits { value: String, overlap: u64 },

    #[error("known bits for %{value} have mismatched widths ({zero_width} vs {one_width})")]
    KnownBitsWidthMismatch {
        value: String,
        zero_width: u32,
        one_width: u32,
    },

    #[error("range for %{value} is {range_width} bits wide but the value is {value_width} bits")]
    RangeWidthMismatch {
        value: String,
        range_width: u32,
        value_width: u32,
    },

    #[error("invalid range: {message}")]
    InvalidRange { message: String },

    #[error("invalid fact for %{value} in `{function}`: {message}")]
    InvalidFact {
        function: String,
        value: String,
        message: String,
    },

    #[error("pass `{pass}` requires analysis `{analysis}` which was not provided")]
    MissingAnalysis { pass: String, analysis: String },

    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("config error: {message}")]
    Config { message: String },
}

impl InstrumentError {
    pub fn invalid_range(message: impl Into<String>) -> Self {
        Self::InvalidRange {
            message: message.into(),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn json_error(message: impl Into<String>) -> Self {
        Self::Json {
            message: message.into(),
        }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for errors that mean the IR or the oracle broke an invariant.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::MissingSuccessor { .. }
                | Self::OutOfOrderFact { .. }
                | Self::ConflictingKnownBits { .. }
                | Self::KnownBitsWidthMismatch { .. }
                | Self::RangeWidthMismatch { .. }
                | Self::InvalidFact { .. }
        )
    }
}

impl From<std::io::Error> for InstrumentError {
    fn from(e: std::io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for InstrumentError {
    fn from(e: serde_json::Error) -> Self {
        Self::json_error(e.to_string())
    }
}

impl From<toml::de::Error> for InstrumentError {
    fn from(e: toml::de::Error) -> Self {
        Self::config_error(e.to_string())
    }
}
