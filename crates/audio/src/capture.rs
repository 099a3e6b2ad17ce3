//! Roh-Audio-Capture
//!
//! Eine einzige [`AudioCaptureConfig`] beschreibt, welche Richtung in
//! welchem Format an welchen Callback geliefert wird. Drei Einstiege
//! erzeugen sie: [`AudioCaptureConfig::simple`],
//! [`AudioCaptureConfig::aus_einstellungen`] (deklarativ aus der
//! Konfigurationsdatei) und [`AudioCaptureConfig::aus_optionen`]
//! (dynamisch zur Laufzeit).
//!
//! Pro Track laeuft genau eine [`CapturePipeline`]: entweder ein
//! Container-Encoder des Backends oder ein [`PcmProcessor`].

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use voxlink_core::types::{AudioDirection, TrackId};

use crate::backend::{AudioBackend, ContainerEncoder};
use crate::error::{AudioError, AudioResult};

/// Standard-Chunkdauer des Container-Pfads in ms
pub const STANDARD_CHUNK_MS: u32 = 100;
/// Standard-Puffergroesse des PCM-Pfads in Samples
pub const STANDARD_PUFFER_SAMPLES: usize = 4096;

/// Obergrenze fuer `buffer_size` (gut 20 s bei 48 kHz)
pub const MAX_PUFFER_SAMPLES: usize = 1 << 20;

/// Container-Typen in Probier-Reihenfolge
pub const CONTAINER_FALLBACKS: [&str; 4] = [
    "audio/webm;codecs=opus",
    "audio/webm",
    "audio/ogg;codecs=opus",
    "audio/opus",
];

// ---------------------------------------------------------------------------
// Konfiguration
// ---------------------------------------------------------------------------

/// Welche Richtung aufgenommen wird
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CaptureSource {
    #[default]
    Agent,
    User,
    Both,
}

impl CaptureSource {
    pub fn umfasst(&self, richtung: AudioDirection) -> bool {
        match self {
            Self::Both => true,
            Self::Agent => richtung == AudioDirection::Agent,
            Self::User => richtung == AudioDirection::User,
        }
    }
}

/// Ausgabeformat der Capture-Chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CaptureFormat {
    #[serde(rename = "opus-webm")]
    OpusWebm,
    #[default]
    #[serde(rename = "pcm-f32")]
    PcmF32,
    #[serde(rename = "pcm-i16")]
    PcmI16,
}

/// Nutzdaten eines Capture-Chunks
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureData {
    /// Kodierte Container-Bytes
    Container { mime_type: String, bytes: Bytes },
    PcmF32(Vec<f32>),
    PcmI16(Vec<i16>),
}

impl CaptureData {
    /// Anzahl Samples (PCM) bzw. Bytes (Container)
    pub fn len(&self) -> usize {
        match self {
            Self::Container { bytes, .. } => bytes.len(),
            Self::PcmF32(s) => s.len(),
            Self::PcmI16(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ein an den Callback geliefertes Stueck Audio
#[derive(Debug, Clone)]
pub struct CaptureChunk {
    pub track_id: TrackId,
    pub source: AudioDirection,
    pub sample_rate: u32,
    pub timestamp: DateTime<Utc>,
    pub data: CaptureData,
}

/// Ergebnis-Callback
pub type CaptureCallback = Arc<dyn Fn(CaptureChunk) + Send + Sync>;

/// Serialisierbarer Teil der Capture-Konfiguration (Konfigurationsdatei)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureEinstellungen {
    /// Deklarative Capture beim Verbinden starten
    pub enabled: bool,
    pub source: CaptureSource,
    pub format: CaptureFormat,
    pub chunk_size_ms: u32,
    pub buffer_size: usize,
}

impl Default for CaptureEinstellungen {
    fn default() -> Self {
        Self {
            enabled: false,
            source: CaptureSource::Agent,
            format: CaptureFormat::PcmF32,
            chunk_size_ms: STANDARD_CHUNK_MS,
            buffer_size: STANDARD_PUFFER_SAMPLES,
        }
    }
}

/// Laufzeit-Optionen fuer `enable_audio_capture`
///
/// `callback` hat Vorrang vor `on_data`; fehlen beide, ist die Option
/// ungueltig.
#[derive(Clone, Default)]
pub struct CaptureOptions {
    pub source: Option<CaptureSource>,
    pub format: Option<CaptureFormat>,
    pub chunk_size_ms: Option<u32>,
    pub buffer_size: Option<usize>,
    pub callback: Option<CaptureCallback>,
    pub on_data: Option<CaptureCallback>,
}

impl std::fmt::Debug for CaptureOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureOptions")
            .field("source", &self.source)
            .field("format", &self.format)
            .field("chunk_size_ms", &self.chunk_size_ms)
            .field("buffer_size", &self.buffer_size)
            .field("callback", &self.callback.is_some())
            .field("on_data", &self.on_data.is_some())
            .finish()
    }
}

/// Aktive Capture-Konfiguration (hoechstens eine pro Session)
#[derive(Clone)]
pub struct AudioCaptureConfig {
    pub source: CaptureSource,
    pub format: CaptureFormat,
    pub chunk_size_ms: u32,
    pub buffer_size: usize,
    pub callback: CaptureCallback,
}

impl std::fmt::Debug for AudioCaptureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureConfig")
            .field("source", &self.source)
            .field("format", &self.format)
            .field("chunk_size_ms", &self.chunk_size_ms)
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

impl AudioCaptureConfig {
    /// Agent-Audio als `pcm-f32` mit Standard-Puffer
    pub fn simple<F>(callback: F) -> Self
    where
        F: Fn(CaptureChunk) + Send + Sync + 'static,
    {
        Self {
            source: CaptureSource::Agent,
            format: CaptureFormat::PcmF32,
            chunk_size_ms: STANDARD_CHUNK_MS,
            buffer_size: STANDARD_PUFFER_SAMPLES,
            callback: Arc::new(callback),
        }
    }

    /// Deklarative Konfiguration plus im Code gelieferter Callback
    pub fn aus_einstellungen(
        einstellungen: &CaptureEinstellungen,
        callback: CaptureCallback,
    ) -> AudioResult<Self> {
        let config = Self {
            source: einstellungen.source,
            format: einstellungen.format,
            chunk_size_ms: einstellungen.chunk_size_ms,
            buffer_size: einstellungen.buffer_size,
            callback,
        };
        config.validieren()?;
        Ok(config)
    }

    /// Dynamische Konfiguration aus Laufzeit-Optionen
    pub fn aus_optionen(optionen: CaptureOptions) -> AudioResult<Self> {
        let callback = optionen.callback.or(optionen.on_data).ok_or_else(|| {
            AudioError::Konfiguration(
                "enable_audio_capture braucht `callback` oder `on_data`".into(),
            )
        })?;

        let config = Self {
            source: optionen.source.unwrap_or_default(),
            format: optionen.format.unwrap_or_default(),
            chunk_size_ms: optionen.chunk_size_ms.unwrap_or(STANDARD_CHUNK_MS),
            buffer_size: optionen.buffer_size.unwrap_or(STANDARD_PUFFER_SAMPLES),
            callback,
        };
        config.validieren()?;
        Ok(config)
    }

    fn validieren(&self) -> AudioResult<()> {
        if self.buffer_size == 0 {
            return Err(AudioError::Konfiguration(
                "buffer_size muss groesser als 0 sein".into(),
            ));
        }
        if self.buffer_size > MAX_PUFFER_SAMPLES {
            return Err(AudioError::Konfiguration(format!(
                "buffer_size {} ueberschreitet das Maximum von {} Samples",
                self.buffer_size, MAX_PUFFER_SAMPLES
            )));
        }
        if self.chunk_size_ms == 0 {
            return Err(AudioError::Konfiguration(
                "chunk_size_ms muss groesser als 0 sein".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// Sammelt PCM-Samples und gibt Bloecke fester Groesse aus
pub struct PcmProcessor {
    buffer_size: usize,
    puffer: Vec<f32>,
}

impl PcmProcessor {
    pub fn neu(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            puffer: Vec::with_capacity(buffer_size.min(MAX_PUFFER_SAMPLES)),
        }
    }

    /// Gibt alle vollstaendigen Bloecke zurueck, der Rest bleibt gepuffert
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut bloecke = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let frei = self.buffer_size - self.puffer.len();
            let n = frei.min(rest.len());
            self.puffer.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
            if self.puffer.len() == self.buffer_size {
                bloecke.push(std::mem::replace(
                    &mut self.puffer,
                    Vec::with_capacity(self.buffer_size),
                ));
            }
        }
        bloecke
    }

    /// Anzahl gepufferter, noch nicht ausgegebener Samples
    pub fn gepuffert(&self) -> usize {
        self.puffer.len()
    }
}

/// Konvertiert ein f32-Sample nach i16 (negativ x32768, positiv x32767)
pub fn f32_zu_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

/// Waehlt den ersten vom Backend unterstuetzten Container-Typ
pub fn container_typ_waehlen(backend: &dyn AudioBackend) -> Option<&'static str> {
    CONTAINER_FALLBACKS
        .iter()
        .copied()
        .find(|mime| backend.is_container_type_supported(mime))
}

/// Capture-Pipeline eines einzelnen Tracks
pub enum CapturePipeline {
    Container(Box<dyn ContainerEncoder>),
    Pcm {
        processor: PcmProcessor,
        format: CaptureFormat,
    },
}

impl CapturePipeline {
    /// Baut die Pipeline fuer ein Format
    ///
    /// Fuer `opus-webm` wird die Fallback-Liste durchprobiert; unterstuetzt
    /// das Backend keinen Typ, schlaegt der Aufbau fehl.
    pub fn erstellen(
        config: &AudioCaptureConfig,
        backend: &dyn AudioBackend,
        sample_rate: u32,
    ) -> AudioResult<Self> {
        match config.format {
            CaptureFormat::OpusWebm => {
                let mime = container_typ_waehlen(backend).ok_or_else(|| {
                    AudioError::FormatNichtUnterstuetzt(CONTAINER_FALLBACKS.join(", "))
                })?;
                debug!(mime, sample_rate, "Container-Encoder gewaehlt");
                let encoder =
                    backend.create_container_encoder(mime, sample_rate, config.chunk_size_ms)?;
                Ok(Self::Container(encoder))
            }
            format => Ok(Self::Pcm {
                processor: PcmProcessor::neu(config.buffer_size),
                format,
            }),
        }
    }

    /// Verarbeitet neue Samples und gibt fertige Chunks zurueck
    pub fn push(&mut self, samples: &[f32]) -> AudioResult<Vec<CaptureData>> {
        match self {
            Self::Container(encoder) => Ok(encoder
                .push(samples)?
                .map(|bytes| CaptureData::Container {
                    mime_type: encoder.mime_type().to_string(),
                    bytes,
                })
                .into_iter()
                .collect()),
            Self::Pcm { processor, format } => Ok(processor
                .push(samples)
                .into_iter()
                .map(|block| pcm_daten(*format, block))
                .collect()),
        }
    }

    /// Beendet die Pipeline. Unvollstaendige PCM-Bloecke werden verworfen.
    pub fn stop(&mut self) -> AudioResult<Option<CaptureData>> {
        match self {
            Self::Container(encoder) => {
                let rest = encoder.stop()?;
                Ok(rest.map(|bytes| CaptureData::Container {
                    mime_type: encoder.mime_type().to_string(),
                    bytes,
                }))
            }
            Self::Pcm { .. } => Ok(None),
        }
    }
}

fn pcm_daten(format: CaptureFormat, block: Vec<f32>) -> CaptureData {
    match format {
        CaptureFormat::PcmI16 => CaptureData::PcmI16(block.into_iter().map(f32_zu_i16).collect()),
        _ => CaptureData::PcmF32(block),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;

    fn leerer_callback() -> CaptureCallback {
        Arc::new(|_| {})
    }

    #[test]
    fn simple_nutzt_standardwerte() {
        let config = AudioCaptureConfig::simple(|_| {});
        assert_eq!(config.source, CaptureSource::Agent);
        assert_eq!(config.format, CaptureFormat::PcmF32);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.chunk_size_ms, 100);
    }

    #[test]
    fn optionen_ohne_callback_ist_konfigurationsfehler() {
        let result = AudioCaptureConfig::aus_optionen(CaptureOptions::default());
        assert!(matches!(result, Err(AudioError::Konfiguration(_))));
    }

    #[test]
    fn optionen_callback_hat_vorrang() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let callback_treffer = Arc::new(AtomicUsize::new(0));
        let on_data_treffer = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&callback_treffer);
        let o = Arc::clone(&on_data_treffer);

        let config = AudioCaptureConfig::aus_optionen(CaptureOptions {
            callback: Some(Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })),
            on_data: Some(Arc::new(move |_| {
                o.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        })
        .unwrap();

        (config.callback)(CaptureChunk {
            track_id: TrackId::new("t"),
            source: AudioDirection::Agent,
            sample_rate: 48_000,
            timestamp: Utc::now(),
            data: CaptureData::PcmF32(vec![]),
        });
        assert_eq!(callback_treffer.load(Ordering::SeqCst), 1);
        assert_eq!(on_data_treffer.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn on_data_allein_reicht() {
        let config = AudioCaptureConfig::aus_optionen(CaptureOptions {
            on_data: Some(leerer_callback()),
            format: Some(CaptureFormat::PcmI16),
            ..Default::default()
        });
        assert_eq!(config.unwrap().format, CaptureFormat::PcmI16);
    }

    #[test]
    fn puffergroesse_null_abgelehnt() {
        let einstellungen = CaptureEinstellungen {
            buffer_size: 0,
            ..Default::default()
        };
        let result = AudioCaptureConfig::aus_einstellungen(&einstellungen, leerer_callback());
        assert!(result.is_err());
    }

    #[test]
    fn riesiger_puffer_abgelehnt() {
        let result = AudioCaptureConfig::aus_optionen(CaptureOptions {
            buffer_size: Some(usize::MAX),
            callback: Some(leerer_callback()),
            ..Default::default()
        });
        assert!(matches!(result, Err(AudioError::Konfiguration(_))));

        let grenze = AudioCaptureConfig::aus_optionen(CaptureOptions {
            buffer_size: Some(MAX_PUFFER_SAMPLES),
            callback: Some(leerer_callback()),
            ..Default::default()
        });
        assert!(grenze.is_ok());
    }

    #[test]
    fn quelle_umfasst_richtung() {
        assert!(CaptureSource::Both.umfasst(AudioDirection::User));
        assert!(CaptureSource::Agent.umfasst(AudioDirection::Agent));
        assert!(!CaptureSource::Agent.umfasst(AudioDirection::User));
    }

    #[test]
    fn format_serde_namen() {
        let json = serde_json::to_string(&CaptureFormat::OpusWebm).unwrap();
        assert_eq!(json, "\"opus-webm\"");
        let f: CaptureFormat = serde_json::from_str("\"pcm-i16\"").unwrap();
        assert_eq!(f, CaptureFormat::PcmI16);
    }

    #[test]
    fn pcm_processor_liefert_exakte_bloecke() {
        let mut p = PcmProcessor::neu(4);
        assert!(p.push(&[0.1, 0.2, 0.3]).is_empty());
        let bloecke = p.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(bloecke.len(), 2);
        assert!(bloecke.iter().all(|b| b.len() == 4));
        assert_eq!(bloecke[1], vec![0.5, 0.6, 0.7, 0.8]);
        assert_eq!(p.gepuffert(), 1);
    }

    #[test]
    fn i16_konvertierung_skaliert_asymmetrisch() {
        assert_eq!(f32_zu_i16(1.0), 32767);
        assert_eq!(f32_zu_i16(-1.0), -32768);
        assert_eq!(f32_zu_i16(0.0), 0);
        assert_eq!(f32_zu_i16(2.5), 32767);
        assert_eq!(f32_zu_i16(-3.0), -32768);
        assert_eq!(f32_zu_i16(0.5), 16384);
        assert_eq!(f32_zu_i16(-0.5), -16384);
    }

    #[test]
    fn container_fallback_bis_opus() {
        let backend = HeadlessBackend::neu();
        assert_eq!(container_typ_waehlen(&backend), Some("audio/opus"));
    }

    #[test]
    fn container_ohne_unterstuetzung_schlaegt_fehl() {
        let backend = HeadlessBackend::ohne_container();
        let config = AudioCaptureConfig {
            format: CaptureFormat::OpusWebm,
            ..AudioCaptureConfig::simple(|_| {})
        };
        let result = CapturePipeline::erstellen(&config, &backend, 48_000);
        assert!(matches!(result, Err(AudioError::FormatNichtUnterstuetzt(_))));
    }

    #[test]
    fn pcm_pipeline_i16() {
        let config = AudioCaptureConfig {
            format: CaptureFormat::PcmI16,
            buffer_size: 2,
            ..AudioCaptureConfig::simple(|_| {})
        };
        let backend = HeadlessBackend::neu();
        let mut pipeline = CapturePipeline::erstellen(&config, &backend, 16_000).unwrap();
        let chunks = pipeline.push(&[1.0, -1.0, 0.25]).unwrap();
        assert_eq!(chunks, vec![CaptureData::PcmI16(vec![32767, -32768])]);
        assert!(pipeline.stop().unwrap().is_none());
    }
}
