//! Fehlertypen fuer voxlink
//!
//! Zentraler Fehler-Enum der Session-Fassade. Audio- und Transport-Fehler
//! werden in ihren eigenen Crates definiert und hierher konvertiert.

use thiserror::Error;

use crate::types::ConnectionState;

/// Globaler Result-Alias fuer voxlink
pub type Result<T> = std::result::Result<T, VoxError>;

/// Alle Fehler, die an der oeffentlichen Session-Schnittstelle auftreten
#[derive(Debug, Error)]
pub enum VoxError {
    // --- Konfiguration ---
    #[error("Konfigurationsfehler: {0}")]
    Konfiguration(String),

    // --- Lebenszyklus ---
    #[error("Es laeuft bereits eine Session")]
    BereitsAktiv,

    #[error("Keine aktive Verbindung")]
    NichtVerbunden,

    #[error("Ungueltiger Zustand fuer {operation}: {zustand}")]
    UngueltigerZustand {
        operation: &'static str,
        zustand: ConnectionState,
    },

    #[error("Verbindungsaufbau abgebrochen")]
    Abgebrochen,

    // --- Transport ---
    #[error("Transportfehler: {0}")]
    Transport(String),

    // --- Audio ---
    #[error("Audiofehler: {0}")]
    Audio(String),

    // --- Serialisierung ---
    #[error("Serialisierungsfehler: {0}")]
    Serialisierung(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl VoxError {
    /// Erstellt einen Konfigurationsfehler aus einer beliebigen Nachricht
    pub fn konfiguration(msg: impl Into<String>) -> Self {
        Self::Konfiguration(msg.into())
    }

    /// Gibt true zurueck wenn ein erneuter Verbindungsversuch sinnvoll ist
    pub fn ist_wiederholbar(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Abgebrochen)
    }
}
