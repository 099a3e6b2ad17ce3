//! Transport-Schnittstelle
//!
//! Die Engine implementiert kein Signalisierungs- oder Medienprotokoll.
//! Ein Adapter (WebRTC-Raum o.ae.) implementiert [`Transport`] und schiebt
//! alles, was im Raum passiert, als [`TransportEvent`] in den Kanal, den er
//! bei `connect` erhaelt.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use voxlink_audio::AudioFrame;
use voxlink_core::metrics::{Participant, TrackRecord};
use voxlink_core::types::{ConnectionQuality, ParticipantIdentity, TrackId};
use voxlink_core::VoxError;

// ---------------------------------------------------------------------------
// Fehler
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Verbindung fehlgeschlagen: {0}")]
    Verbindung(String),

    #[error("Transport nicht verbunden")]
    NichtVerbunden,

    #[error("Senden fehlgeschlagen: {0}")]
    Senden(String),

    #[error("Statistik nicht verfuegbar: {0}")]
    Statistik(String),

    #[error("RPC-Fehler: {0}")]
    Rpc(String),

    #[error("Geraetefehler: {0}")]
    Geraet(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for VoxError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NichtVerbunden => VoxError::NichtVerbunden,
            andere => VoxError::Transport(andere.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistiken
// ---------------------------------------------------------------------------

/// Rohe Verbindungsstatistik, so wie der Adapter sie liefert
///
/// Nicht gemessene Werte bleiben `None`. Byte- und Paketzaehler sind
/// kumulativ seit Verbindungsbeginn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawStats {
    pub latency_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub bandwidth_bytes_per_sec: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
}

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

/// Ein eingehender Methodenaufruf der Gegenseite
#[derive(Debug, Clone)]
pub struct RpcInvocation {
    pub request_id: String,
    pub caller: ParticipantIdentity,
    /// Rohe Nutzlast (JSON-Text), `None` wenn keine gesendet wurde
    pub payload: Option<String>,
}

pub type RpcFuture = Pin<Box<dyn Future<Output = String> + Send>>;

/// Handler einer registrierten Methode; liefert immer einen Antwort-String
pub type RpcHandler = Arc<dyn Fn(RpcInvocation) -> RpcFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Alles, was der Adapter der Engine meldet
#[derive(Debug, Clone)]
pub enum TransportEvent {
    ParticipantConnected(Participant),
    ParticipantDisconnected(ParticipantIdentity),
    TrackSubscribed(TrackRecord),
    TrackUnsubscribed(TrackId),
    LocalTrackPublished(TrackRecord),
    LocalTrackUnpublished(TrackId),
    TrackMuted(TrackId),
    TrackUnmuted(TrackId),
    ConnectionQualityChanged {
        participant: ParticipantIdentity,
        quality: ConnectionQuality,
    },
    DataReceived {
        payload: Bytes,
        sender: Option<ParticipantIdentity>,
    },
    /// Dekodierte Samples eines lokalen oder entfernten Audio-Tracks
    AudioFrame(AudioFrame),
    Reconnecting,
    Reconnected,
    /// Endgueltiger Verbindungsverlust
    Disconnected { reason: String },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Schmale Schnittstelle zum Raum-Adapter
#[async_trait]
pub trait Transport: Send + Sync {
    /// Baut die Verbindung auf. Events werden bis zum Ende in `events` geschoben.
    async fn connect(
        &self,
        url: &str,
        token: &str,
        events: TransportEventSender,
    ) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    async fn set_microphone_enabled(&self, enabled: bool) -> TransportResult<()>;

    async fn publish_data(&self, payload: Bytes, reliable: bool) -> TransportResult<()>;

    async fn stats(&self) -> TransportResult<RawStats>;

    fn register_rpc_method(&self, name: &str, handler: RpcHandler) -> TransportResult<()>;

    fn unregister_rpc_method(&self, name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nicht_verbunden_wird_eigene_variante() {
        let e: VoxError = TransportError::NichtVerbunden.into();
        assert!(matches!(e, VoxError::NichtVerbunden));
    }

    #[test]
    fn verbindungsfehler_wird_transport() {
        let e: VoxError = TransportError::Verbindung("token abgelaufen".into()).into();
        assert!(e.to_string().contains("token abgelaufen"));
        assert!(e.ist_wiederholbar());
    }
}
