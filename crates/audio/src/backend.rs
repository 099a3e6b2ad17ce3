//! Plattform-Schnittstelle des Audio-Managers
//!
//! Der Audio-Manager spielt selbst nichts ab und kodiert keine Container.
//! Beides liefert ein [`AudioBackend`]: im Browser-aehnlichen Umfeld die
//! Media-Elemente und Recorder der Plattform, headless der
//! [`HeadlessBackend`](crate::headless::HeadlessBackend).

use bytes::Bytes;
use voxlink_core::metrics::TrackRecord;

use crate::error::AudioResult;

/// Zustand des Audio-Graphen der Plattform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Running,
    /// Vom System angehalten (z.B. fehlende User-Geste), per `resume_graph` fortsetzbar
    Suspended,
    /// Kein Graph vorhanden
    Closed,
}

/// Wiedergabestatus eines Playback-Sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Playing,
    Paused,
    Ended,
}

/// Wird vom Sink bei jedem Statuswechsel aufgerufen
pub type PlaybackListener = Box<dyn Fn(PlaybackStatus) + Send + Sync>;

/// Wiedergabe-Ressource eines entfernten Audio-Tracks
pub trait PlaybackSink: Send {
    fn set_volume(&mut self, volume: f32) -> AudioResult<()>;

    fn set_paused(&mut self, paused: bool) -> AudioResult<()>;

    /// Gibt die Ressource frei. Nach dem Aufruf wird der Sink verworfen.
    fn release(&mut self) -> AudioResult<()>;
}

/// Container-Encoder (Recorder) fuer den `opus-webm` Capture-Pfad
pub trait ContainerEncoder: Send {
    /// Tatsaechlich verwendeter MIME-Typ
    fn mime_type(&self) -> &str;

    /// Nimmt PCM-Samples entgegen; liefert einen Chunk sobald die
    /// konfigurierte Chunk-Dauer erreicht ist
    fn push(&mut self, samples: &[f32]) -> AudioResult<Option<Bytes>>;

    /// Beendet die Aufnahme und liefert gepufferte Restdaten
    fn stop(&mut self) -> AudioResult<Option<Bytes>>;
}

/// Plattform-Audio
pub trait AudioBackend: Send + Sync {
    /// Erstellt einen Playback-Sink fuer einen entfernten Audio-Track
    fn create_playback(
        &self,
        track: &TrackRecord,
        listener: PlaybackListener,
    ) -> AudioResult<Box<dyn PlaybackSink>>;

    fn graph_state(&self) -> GraphState;

    /// Setzt einen angehaltenen Graphen fort
    fn resume_graph(&self) -> AudioResult<()>;

    fn is_container_type_supported(&self, mime_type: &str) -> bool;

    fn create_container_encoder(
        &self,
        mime_type: &str,
        sample_rate: u32,
        chunk_size_ms: u32,
    ) -> AudioResult<Box<dyn ContainerEncoder>>;
}
