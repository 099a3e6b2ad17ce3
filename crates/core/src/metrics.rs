//! Snapshot-Strukturen der Analytics-Engine
//!
//! Alle Typen sind reine Datentraeger: sie werden ausschliesslich von der
//! Analytics-Engine bzw. dem Audio-Manager befuellt und nach aussen nur als
//! Kopie herausgegeben.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionQuality, ParticipantIdentity, SessionId, TrackId, TrackKind};

/// Aktuelle Verbindungsmetriken
///
/// Fehlende Werte bleiben `None`: es wird nichts geschaetzt, was der
/// Transport nicht liefert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Round-Trip-Latenz in ms
    pub latency_ms: Option<f64>,
    /// Paketverlust in Prozent (0.0–100.0)
    pub packet_loss_pct: Option<f64>,
    /// Verfuegbare Bandbreite in Bytes/s
    pub bandwidth_bytes_per_sec: Option<f64>,
    /// Jitter in ms
    pub jitter_ms: Option<f64>,
    /// Qualitaets-Bucket
    pub quality: ConnectionQuality,
}

/// Ein Pegel-Messpunkt (beide Richtungen)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioLevelSample {
    pub timestamp: DateTime<Utc>,
    pub user_level: f32,
    pub agent_level: f32,
}

/// Zaehler einer Session
///
/// Versuchs-, Byte- und Paketzaehler sind monoton. `participant_count` und
/// `track_count` spiegeln den aktuellen Stand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallStats {
    pub connection_attempts: u32,
    pub reconnection_attempts: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    pub participant_count: usize,
    pub track_count: usize,
    /// Nur anhaengen, nie kuerzen
    pub audio_levels: Vec<AudioLevelSample>,
    pub last_quality: ConnectionQuality,
}

/// Audio-Metriken einer Richtung
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionMetrics {
    /// Aktueller Pegel (0.0–1.0)
    pub level: f32,
    /// Kumulierte Sprechzeit in ms
    pub speaking_time_ms: u64,
    /// Anzahl Signalabrisse
    pub dropouts: u32,
    pub echo_cancellation: bool,
}

/// Audio-Metriken beider Richtungen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioMetrics {
    pub user: DirectionMetrics,
    pub agent: DirectionMetrics,
}

/// Verbundener Teilnehmer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub identity: ParticipantIdentity,
    /// Vom Transport vergebene Session-Kennung
    pub sid: String,
    pub connected_at: DateTime<Utc>,
    /// Opake Metadaten (vom Transport durchgereicht)
    pub metadata: Option<String>,
}

/// Abmessungen eines Video-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDimensions {
    pub width: u32,
    pub height: u32,
}

/// Bekannter Track (lokal veroeffentlicht oder entfernt abonniert)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: TrackId,
    pub kind: TrackKind,
    pub participant: ParticipantIdentity,
    /// true = lokal veroeffentlichter Track (Mikrofon)
    pub local: bool,
    pub subscribed_at: DateTime<Utc>,
    pub muted: bool,
    pub enabled: bool,
    pub dimensions: Option<TrackDimensions>,
}

impl TrackRecord {
    pub fn ist_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }
}

/// Track-Uebersicht
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackStats {
    pub total: usize,
    pub audio: usize,
    pub tracks: Vec<TrackRecord>,
}

impl TrackStats {
    pub fn aus_records(tracks: Vec<TrackRecord>) -> Self {
        Self {
            total: tracks.len(),
            audio: tracks.iter().filter(|t| t.ist_audio()).count(),
            tracks,
        }
    }
}

/// Leistungskennzahlen einer Session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub call_duration_ms: u64,
    pub connection_attempts: u32,
    pub reconnection_attempts: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_lost: u64,
    /// Mittelwert aller gemessenen Latenzen
    pub average_latency_ms: Option<f64>,
    pub quality: ConnectionQuality,
}

/// Gesamtauswertung einer Session (bleibt nach dem Ende eingefroren)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAnalytics {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub user_initiated_end: bool,
    pub stats: CallStats,
    pub connection: ConnectionMetrics,
    pub audio: AudioMetrics,
}

/// Vollstaendiger Snapshot, wird mit jedem Analytics-Tick verteilt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub connection: ConnectionMetrics,
    pub audio: AudioMetrics,
    pub performance: PerformanceMetrics,
    pub participants: Vec<Participant>,
    pub tracks: TrackStats,
}
