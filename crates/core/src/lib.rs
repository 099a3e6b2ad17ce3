//! voxlink-core – Gemeinsame Typen, Metriken, Events und Fehlertypen
//!
//! Dieses Crate stellt die Bausteine bereit, die Audio-Manager,
//! Analytics-Engine und Session-Fassade gemeinsam nutzen:
//! - [`types`] – IDs und Zustands-Enums
//! - [`metrics`] – Snapshot-Strukturen der Analytics
//! - [`event`] – Session-Events und der Listener-Verteiler
//! - [`error`] – zentraler Fehlertyp

pub mod error;
pub mod event;
pub mod metrics;
pub mod types;

// Re-Exporte fuer bequemen Zugriff
pub use error::{Result, VoxError};
pub use event::{ErrorSource, EventEmitter, EventKind, ListenerId, SessionEvent};
pub use types::{
    AudioDirection, ConnectionQuality, ConnectionState, ParticipantIdentity, SessionId, TrackId,
    TrackKind,
};
