use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The text payload is missing its header/tracks markers, or its track structure is inconsistent.
    #[error("Invalid MIDI text: {0}")]
    Format(String),

    /// A structurally present event line carries fields that cannot be turned into an event.
    #[error("Invalid event at line {line}: {message}")]
    Decode { line: usize, message: String },

    #[error("MIDI file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The host sequencing facility could not be acquired, so nothing can be played.
    #[error("Host sequencer unavailable: {0}")]
    TransportUnavailable(String),

    #[error("No sequence is loaded")]
    NothingLoaded,

    #[error("Failed to parse MIDI file: {0}")]
    Midi(#[from] midly::Error),

    #[error("Cannot export sequence: {0}")]
    Unsupported(String),

    #[error("Transform failed: {0}")]
    Transform(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn decode(line: usize, message: impl Into<String>) -> Self {
        Error::Decode {
            line,
            message: message.into(),
        }
    }
}
