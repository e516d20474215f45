/// Error type shared by the sequencer core
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: String },

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error("unknown envelope parameter: {0}")]
    UnknownParameter(String),

    #[error("MIDI transport error: {0}")]
    Transport(String),

    #[error("invalid pattern: {0}")]
    Pattern(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SequencerError {
    pub(crate) fn out_of_range(what: &'static str, value: impl ToString) -> Self {
        SequencerError::OutOfRange {
            what,
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SequencerError>;
