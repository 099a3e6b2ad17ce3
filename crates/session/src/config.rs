//! Engine-Konfiguration
//!
//! Wird aus einer TOML-Datei geladen. Alle Felder haben sinnvolle
//! Standardwerte, sodass eine Session ohne Konfigurationsdatei lauffaehig
//! ist. Der Capture-Callback der deklarativen Aufnahme laesst sich nicht
//! serialisieren und wird im Code uebergeben
//! (`VoiceSession::with_capture_callback`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use voxlink_audio::CaptureEinstellungen;
use voxlink_core::{Result, VoxError};

/// Vollstaendige Engine-Konfiguration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Adresse des Raum-Servers (an den Transport durchgereicht)
    pub server_url: String,
    pub audio: AudioEinstellungen,
    /// Deklarative Roh-Audio-Capture, startet beim Verbinden
    pub audio_capture: CaptureEinstellungen,
    pub analytics: AnalyticsEinstellungen,
    pub logging: LoggingEinstellungen,
}

/// Audio-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioEinstellungen {
    /// Anfangs-Lautstaerke (0.0–1.0)
    pub volume: f32,
    /// Echo-Unterdrueckung des Mikrofons aktiv (nur gemeldet)
    pub echo_cancellation: bool,
    /// Mikrofon beim Verbinden stummgeschaltet
    pub start_muted: bool,
}

impl Default for AudioEinstellungen {
    fn default() -> Self {
        Self {
            volume: 1.0,
            echo_cancellation: true,
            start_muted: false,
        }
    }
}

/// Analytics-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsEinstellungen {
    /// Periodisches Sampling aktiv
    pub enabled: bool,
    /// Pegel oberhalb dieser Schwelle zaehlt als Sprechen
    pub silence_threshold: f32,
}

impl Default for AnalyticsEinstellungen {
    fn default() -> Self {
        Self {
            enabled: true,
            silence_threshold: 0.01,
        }
    }
}

/// Logging-Einstellungen
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingEinstellungen {
    /// Log-Level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Ausgabeformat: "text" oder "json"
    pub format: String,
}

impl Default for LoggingEinstellungen {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl EngineConfig {
    /// Laedt die Konfiguration aus einer TOML-Datei
    ///
    /// Fehlt die Datei, werden die Standardwerte verwendet.
    pub fn laden(pfad: impl AsRef<Path>) -> Result<Self> {
        let pfad = pfad.as_ref();
        match std::fs::read_to_string(pfad) {
            Ok(inhalt) => Self::aus_toml(&inhalt),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Konfigurationsdatei '{}' nicht gefunden, verwende Standardwerte",
                    pfad.display()
                );
                Ok(Self::default())
            }
            Err(e) => Err(VoxError::konfiguration(format!(
                "Konfigurationsdatei '{}' nicht lesbar: {}",
                pfad.display(),
                e
            ))),
        }
    }

    /// Parst eine Konfiguration aus TOML-Text
    pub fn aus_toml(inhalt: &str) -> Result<Self> {
        toml::from_str(inhalt)
            .map_err(|e| VoxError::konfiguration(format!("Ungueltiges TOML: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxlink_audio::{CaptureFormat, CaptureSource};

    #[test]
    fn standardwerte() {
        let config = EngineConfig::default();
        assert_eq!(config.audio.volume, 1.0);
        assert!(config.analytics.enabled);
        assert_eq!(config.analytics.silence_threshold, 0.01);
        assert!(!config.audio_capture.enabled);
        assert_eq!(config.audio_capture.buffer_size, 4096);
        assert_eq!(config.audio_capture.chunk_size_ms, 100);
    }

    #[test]
    fn teilweise_toml() {
        let config = EngineConfig::aus_toml(
            r#"
            server_url = "wss://raum.example"

            [audio]
            start_muted = true

            [audio_capture]
            enabled = true
            source = "both"
            format = "pcm-i16"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url, "wss://raum.example");
        assert!(config.audio.start_muted);
        assert_eq!(config.audio.volume, 1.0);
        assert_eq!(config.audio_capture.source, CaptureSource::Both);
        assert_eq!(config.audio_capture.format, CaptureFormat::PcmI16);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn ungueltiges_toml_ist_konfigurationsfehler() {
        let result = EngineConfig::aus_toml("audio = 5");
        assert!(matches!(result, Err(VoxError::Konfiguration(_))));
    }

    #[test]
    fn fehlende_datei_liefert_standard() {
        let config = EngineConfig::laden("/nicht/vorhanden/voxlink.toml").unwrap();
        assert_eq!(config.logging.format, "text");
    }
}
