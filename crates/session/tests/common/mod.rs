//! Gemeinsame Test-Helfer: skriptbarer Transport und protokollierendes Backend

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use voxlink_audio::{
    AudioBackend, AudioError, AudioResult, ContainerEncoder, GraphState, PlaybackListener,
    PlaybackSink, PlaybackStatus,
};
use voxlink_core::metrics::TrackRecord;
use voxlink_core::types::{ParticipantIdentity, TrackId, TrackKind};
use voxlink_core::{EventKind, SessionEvent};
use voxlink_session::{
    RawStats, RpcHandler, RpcInvocation, Transport, TransportError, TransportEvent,
    TransportEventSender, TransportResult, VoiceSession,
};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockTransport {
    sender: Mutex<Option<TransportEventSender>>,
    pub stats: Mutex<RawStats>,
    /// `stats` wartet auf diese Freigabe, solange gesetzt
    pub stats_sperre: Mutex<Option<Arc<Notify>>>,
    pub stats_fehler: AtomicBool,
    pub stats_aufrufe: AtomicUsize,
    pub connect_fehler: Mutex<Option<String>>,
    /// `connect` kehrt nie zurueck
    pub connect_haengt: AtomicBool,
    pub disconnect_fehler: AtomicBool,
    pub mikrofon_fehler: AtomicBool,
    pub connect_aufrufe: AtomicUsize,
    pub disconnect_aufrufe: AtomicUsize,
    pub mikrofon: Mutex<Vec<bool>>,
    pub gesendet: Mutex<Vec<(Bytes, bool)>>,
    pub rpc: Mutex<HashMap<String, RpcHandler>>,
    pub abgemeldet: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn neu() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Schiebt ein Event in den Kanal der Session
    pub fn senden(&self, event: TransportEvent) {
        if let Some(tx) = self.sender.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn stats_setzen(&self, stats: RawStats) {
        *self.stats.lock() = stats;
    }

    /// Haelt jede Statistik-Abfrage an, bis die zurueckgegebene Sperre freigibt
    pub fn stats_anhalten(&self) -> Arc<Notify> {
        let sperre = Arc::new(Notify::new());
        *self.stats_sperre.lock() = Some(Arc::clone(&sperre));
        sperre
    }

    pub fn rpc_namen(&self) -> HashSet<String> {
        self.rpc.lock().keys().cloned().collect()
    }

    /// Ruft eine registrierte Methode wie die Gegenseite auf
    pub async fn rpc_aufrufen(&self, name: &str, payload: Option<&str>) -> Option<String> {
        let handler = self.rpc.lock().get(name).cloned()?;
        Some(
            handler(RpcInvocation {
                request_id: "req-1".into(),
                caller: ParticipantIdentity::new("agent"),
                payload: payload.map(str::to_string),
            })
            .await,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _url: &str,
        _token: &str,
        events: TransportEventSender,
    ) -> TransportResult<()> {
        self.connect_aufrufe.fetch_add(1, Ordering::SeqCst);
        if let Some(grund) = self.connect_fehler.lock().clone() {
            return Err(TransportError::Verbindung(grund));
        }
        *self.sender.lock() = Some(events);
        if self.connect_haengt.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.disconnect_aufrufe.fetch_add(1, Ordering::SeqCst);
        self.sender.lock().take();
        if self.disconnect_fehler.load(Ordering::SeqCst) {
            return Err(TransportError::Verbindung("Socket bereits zu".into()));
        }
        Ok(())
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> TransportResult<()> {
        if self.mikrofon_fehler.load(Ordering::SeqCst) {
            return Err(TransportError::Geraet("Mikrofon belegt".into()));
        }
        self.mikrofon.lock().push(enabled);
        Ok(())
    }

    async fn publish_data(&self, payload: Bytes, reliable: bool) -> TransportResult<()> {
        self.gesendet.lock().push((payload, reliable));
        Ok(())
    }

    async fn stats(&self) -> TransportResult<RawStats> {
        self.stats_aufrufe.fetch_add(1, Ordering::SeqCst);
        let sperre = self.stats_sperre.lock().clone();
        if let Some(sperre) = sperre {
            sperre.notified().await;
        }
        if self.stats_fehler.load(Ordering::SeqCst) {
            return Err(TransportError::NichtVerbunden);
        }
        Ok(self.stats.lock().clone())
    }

    fn register_rpc_method(&self, name: &str, handler: RpcHandler) -> TransportResult<()> {
        self.rpc.lock().insert(name.to_string(), handler);
        Ok(())
    }

    fn unregister_rpc_method(&self, name: &str) {
        self.rpc.lock().remove(name);
        self.abgemeldet.lock().push(name.to_string());
    }
}

// ---------------------------------------------------------------------------
// Protokollierendes Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SinkProtokoll {
    pub volume: f32,
    pub paused: bool,
    pub freigabe_versuche: usize,
}

#[derive(Default)]
pub struct ProtokollBackend {
    pub sinks: Arc<Mutex<HashMap<TrackId, SinkProtokoll>>>,
    /// Tracks, deren Freigabe fehlschlaegt
    pub kaputte_freigabe: Arc<Mutex<HashSet<TrackId>>>,
    /// Tracks, deren Lautstaerke sich nicht setzen laesst
    pub kaputte_lautstaerke: Arc<Mutex<HashSet<TrackId>>>,
    /// Container-Encoder anbieten, deren `stop` fehlschlaegt
    pub container_stop_kaputt: AtomicBool,
}

impl ProtokollBackend {
    pub fn neu() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn freigabe_verweigern(&self, track: &str) {
        self.kaputte_freigabe.lock().insert(TrackId::new(track));
    }

    pub fn lautstaerke_verweigern(&self, track: &str) {
        self.kaputte_lautstaerke.lock().insert(TrackId::new(track));
    }

    pub fn sink(&self, track: &str) -> Option<SinkProtokoll> {
        self.sinks.lock().get(&TrackId::new(track)).copied()
    }
}

impl AudioBackend for ProtokollBackend {
    fn create_playback(
        &self,
        track: &TrackRecord,
        listener: PlaybackListener,
    ) -> AudioResult<Box<dyn PlaybackSink>> {
        self.sinks
            .lock()
            .insert(track.id.clone(), SinkProtokoll::default());
        listener(PlaybackStatus::Playing);
        Ok(Box::new(ProtokollSink {
            track: track.id.clone(),
            sinks: Arc::clone(&self.sinks),
            kaputte_freigabe: Arc::clone(&self.kaputte_freigabe),
            kaputte_lautstaerke: Arc::clone(&self.kaputte_lautstaerke),
            listener,
        }))
    }

    fn graph_state(&self) -> GraphState {
        GraphState::Running
    }

    fn resume_graph(&self) -> AudioResult<()> {
        Ok(())
    }

    fn is_container_type_supported(&self, mime_type: &str) -> bool {
        self.container_stop_kaputt.load(Ordering::SeqCst) && mime_type == "audio/webm"
    }

    fn create_container_encoder(
        &self,
        mime_type: &str,
        _sample_rate: u32,
        _chunk_size_ms: u32,
    ) -> AudioResult<Box<dyn ContainerEncoder>> {
        if !self.is_container_type_supported(mime_type) {
            return Err(AudioError::FormatNichtUnterstuetzt(mime_type.to_string()));
        }
        Ok(Box::new(KaputterEncoder))
    }
}

struct ProtokollSink {
    track: TrackId,
    sinks: Arc<Mutex<HashMap<TrackId, SinkProtokoll>>>,
    kaputte_freigabe: Arc<Mutex<HashSet<TrackId>>>,
    kaputte_lautstaerke: Arc<Mutex<HashSet<TrackId>>>,
    listener: PlaybackListener,
}

impl PlaybackSink for ProtokollSink {
    fn set_volume(&mut self, volume: f32) -> AudioResult<()> {
        if self.kaputte_lautstaerke.lock().contains(&self.track) {
            return Err(AudioError::Wiedergabe {
                track: self.track.to_string(),
                grund: "Lautstaerke abgelehnt".into(),
            });
        }
        if let Some(s) = self.sinks.lock().get_mut(&self.track) {
            s.volume = volume;
        }
        Ok(())
    }

    fn set_paused(&mut self, paused: bool) -> AudioResult<()> {
        if let Some(s) = self.sinks.lock().get_mut(&self.track) {
            s.paused = paused;
        }
        (self.listener)(if paused {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Playing
        });
        Ok(())
    }

    fn release(&mut self) -> AudioResult<()> {
        if let Some(s) = self.sinks.lock().get_mut(&self.track) {
            s.freigabe_versuche += 1;
        }
        if self.kaputte_freigabe.lock().contains(&self.track) {
            return Err(AudioError::Wiedergabe {
                track: self.track.to_string(),
                grund: "Freigabe verweigert".into(),
            });
        }
        (self.listener)(PlaybackStatus::Ended);
        Ok(())
    }
}

/// Encoder, der Daten annimmt aber beim Stoppen scheitert
struct KaputterEncoder;

impl ContainerEncoder for KaputterEncoder {
    fn mime_type(&self) -> &str {
        "audio/webm"
    }

    fn push(&mut self, _samples: &[f32]) -> AudioResult<Option<Bytes>> {
        Ok(None)
    }

    fn stop(&mut self) -> AudioResult<Option<Bytes>> {
        Err(AudioError::CodecFehler("Finalisierung fehlgeschlagen".into()))
    }
}

// ---------------------------------------------------------------------------
// Helfer
// ---------------------------------------------------------------------------

pub fn remote_track(id: &str) -> TrackRecord {
    TrackRecord {
        id: TrackId::new(id),
        kind: TrackKind::Audio,
        participant: ParticipantIdentity::new("agent"),
        local: false,
        subscribed_at: Utc::now(),
        muted: false,
        enabled: true,
        dimensions: None,
    }
}

/// Sammelt alle Events einer Session
pub fn events_sammeln(session: &VoiceSession) -> Arc<Mutex<Vec<SessionEvent>>> {
    let gesammelt = Arc::new(Mutex::new(Vec::new()));
    let g = Arc::clone(&gesammelt);
    session.on_any(move |e| g.lock().push(e.clone()));
    gesammelt
}

pub fn anzahl(events: &Mutex<Vec<SessionEvent>>, kind: EventKind) -> usize {
    events.lock().iter().filter(|e| e.kind() == kind).count()
}

/// Laesst den Event-Loop laufen, bis die Bedingung erfuellt ist
pub async fn warten_bis(mut bedingung: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if bedingung() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("Bedingung nicht erfuellt");
}
