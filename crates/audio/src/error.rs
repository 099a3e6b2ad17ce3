//! Fehlertypen fuer den Audio-Manager

use thiserror::Error;
use voxlink_core::VoxError;

/// Alle moeglichen Fehler des Audio-Managers
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Wiedergabe-Fehler fuer {track}: {grund}")]
    Wiedergabe { track: String, grund: String },

    #[error("Codec-Fehler: {0}")]
    CodecFehler(String),

    #[error("Container-Format nicht unterstuetzt: {0}")]
    FormatNichtUnterstuetzt(String),

    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    #[error("Audio-Graph nicht verfuegbar")]
    KeinGraph,
}

pub type AudioResult<T> = Result<T, AudioError>;

impl From<AudioError> for VoxError {
    fn from(e: AudioError) -> Self {
        match e {
            AudioError::Konfiguration(msg) => VoxError::Konfiguration(msg),
            andere => VoxError::Audio(andere.to_string()),
        }
    }
}
