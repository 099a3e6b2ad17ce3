//! VoiceSession – oeffentliche Fassade der Engine
//!
//! Verbindet Connection-Manager, Analytics, Audio-Manager und
//! Tool-Registry. Alle Transport-Events laufen durch einen einzigen
//! Event-Loop-Task und werden in Eingangsreihenfolge verarbeitet.
//!
//! ## Lebenszyklus
//! `connect` → (Events, Ticks) → `disconnect` oder entferntes Ende.
//! Nach dem Ende kann dieselbe Instanz erneut verbinden.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use voxlink_audio::{
    AudioBackend, AudioCaptureConfig, AudioManager, CaptureCallback, CaptureChunk, CaptureOptions,
};
use voxlink_core::event::DisconnectReason;
use voxlink_core::metrics::{
    AudioMetrics, CallAnalytics, ConnectionMetrics, Participant, PerformanceMetrics, TrackStats,
};
use voxlink_core::types::{ConnectionState, SessionId};
use voxlink_core::{
    ErrorSource, EventEmitter, EventKind, ListenerId, Result, SessionEvent, VoxError,
};

use crate::analytics::{AnalyticsEngine, AudioQuelle};
use crate::config::EngineConfig;
use crate::connection::ConnectionManager;
use crate::message;
use crate::tools::{ToolDefinition, ToolRegistry};
use crate::transport::{Transport, TransportEvent};

struct Inner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    events: Arc<EventEmitter>,
    verbindung: ConnectionManager,
    analytics: AnalyticsEngine,
    audio: Arc<AudioManager>,
    tools: ToolRegistry,
    /// Callback fuer die deklarative Capture aus der Konfiguration
    capture_callback: Mutex<Option<CaptureCallback>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    /// Serialisiert Verbindungsabschluss und Abbau
    lebenszyklus: Mutex<()>,
}

/// Was der Event-Loop nach einem Transport-Event noch tun muss
enum Folge {
    Weiter,
    /// Mikrofon nach Wiederverbindung an den gemerkten Mute-Zustand angleichen
    MikrofonAbgleichen,
    Ende,
}

/// Eine Voice-Session mit einem Agenten
pub struct VoiceSession {
    inner: Arc<Inner>,
}

impl VoiceSession {
    pub fn neu(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        let events = Arc::new(EventEmitter::neu());
        let audio = Arc::new(AudioManager::neu(backend, Arc::clone(&events)));
        audio.set_volume(config.audio.volume);
        if config.audio.start_muted {
            audio.set_mic_muted(true);
        }

        let quelle: Arc<dyn AudioQuelle> = Arc::clone(&audio) as Arc<dyn AudioQuelle>;
        let analytics = AnalyticsEngine::neu(
            config.analytics.clone(),
            config.audio.echo_cancellation,
            Arc::clone(&events),
            quelle,
        );

        Self {
            inner: Arc::new(Inner {
                verbindung: ConnectionManager::neu(Arc::clone(&transport), Arc::clone(&events)),
                tools: ToolRegistry::neu(Some(Arc::clone(&transport)), Arc::clone(&events)),
                analytics,
                audio,
                transport,
                events,
                config,
                capture_callback: Mutex::new(None),
                event_loop: Mutex::new(None),
                lebenszyklus: Mutex::new(()),
            }),
        }
    }

    /// Callback fuer die in der Konfiguration aktivierte Capture
    pub fn with_capture_callback<F>(self, callback: F) -> Self
    where
        F: Fn(CaptureChunk) + Send + Sync + 'static,
    {
        *self.inner.capture_callback.lock() = Some(Arc::new(callback));
        self
    }

    // -----------------------------------------------------------------------
    // Lebenszyklus
    // -----------------------------------------------------------------------

    /// Baut die Verbindung auf und startet Event-Loop und Analytics
    ///
    /// Ein Fehler des Transports wird als `Error` gemeldet und
    /// zurueckgegeben; es gibt keinen automatischen Wiederholversuch.
    pub async fn connect(&self, token: &str) -> Result<SessionId> {
        let inner = &self.inner;
        let deklarativ = inner.deklarative_capture()?;

        let session_id = inner.verbindung.beginnen()?;
        inner.analytics.vorbereiten(session_id);

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = inner
            .verbindung
            .verbinden(&inner.config.server_url, token, tx)
            .await
        {
            if !matches!(e, VoxError::Abgebrochen) {
                inner.analytics.beenden(false);
            }
            return Err(e);
        }

        {
            let _lz = inner.lebenszyklus.lock();
            if inner.verbindung.session_id() != Some(session_id)
                || inner.verbindung.state() != ConnectionState::Connected
            {
                debug!(session = %session_id, "Session waehrend des Aufbaus beendet");
                return Err(VoxError::Abgebrochen);
            }

            let weak = Arc::downgrade(inner);
            *inner.event_loop.lock() = Some(tokio::spawn(event_loop(weak, rx)));
            inner.analytics.starten(Arc::clone(&inner.transport));

            if let Some(config) = deklarativ {
                if let Err(e) = inner.audio.enable_capture(config) {
                    warn!(fehler = %e, "Deklarative Capture nicht gestartet");
                    inner.events.fehler(
                        ErrorSource::Capture,
                        format!("Capture nicht gestartet: {}", e),
                    );
                }
            }

            info!(session = %session_id, "Session verbunden");
            inner.events.emit(SessionEvent::Connected { session_id });
        }

        if inner.audio.is_mic_muted() {
            if let Err(e) = inner.transport.set_microphone_enabled(false).await {
                warn!(fehler = %e, "Mikrofon konnte nicht stummgeschaltet werden");
                inner.events.fehler(
                    ErrorSource::Transport,
                    format!("Mikrofon-Mute fehlgeschlagen: {}", e),
                );
            }
        }
        Ok(session_id)
    }

    /// Beendet die Session und gibt alle Ressourcen frei
    ///
    /// Aus jedem Zustand erlaubt; ein zweiter Aufruf tut nichts. Fehler beim
    /// Trennen des Transports werden gemeldet, blockieren das Aufraeumen aber
    /// nicht.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(handle) = inner.beenden(true) else {
            trace!("disconnect ohne aktive Session");
            return Ok(());
        };
        if let Some(handle) = handle {
            handle.abort();
        }

        if let Err(e) = inner.transport.disconnect().await {
            warn!(fehler = %e, "Transport-Trennung fehlgeschlagen");
            inner.events.fehler(
                ErrorSource::Transport,
                format!("Trennung fehlgeschlagen: {}", e),
            );
        }

        inner.aufraeumen(DisconnectReason::UserInitiated);
        Ok(())
    }

    /// Schaltet Mikrofon und Wiedergabe ab, die Verbindung bleibt bestehen
    pub async fn pause(&self) -> Result<()> {
        if self.inner.verbindung.pausieren().await? {
            self.inner.audio.set_playback_paused(true);
        }
        Ok(())
    }

    /// Hebt eine Pause auf; ein stummgeschaltetes Mikrofon bleibt stumm
    pub async fn resume(&self) -> Result<()> {
        let mikrofon_an = !self.inner.audio.is_mic_muted();
        if self.inner.verbindung.fortsetzen(mikrofon_an).await? {
            self.inner.audio.set_playback_paused(false);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Audio
    // -----------------------------------------------------------------------

    /// Setzt die Ausgabe-Lautstaerke (auf 0.0–1.0 begrenzt)
    pub fn set_volume(&self, volume: f32) -> f32 {
        self.inner.audio.set_volume(volume)
    }

    pub fn volume(&self) -> f32 {
        self.inner.audio.volume()
    }

    /// Merkt sich das Mute sofort und gibt es an den Transport weiter
    pub async fn set_mic_muted(&self, muted: bool) -> Result<()> {
        let inner = &self.inner;
        inner.audio.set_mic_muted(muted);

        // Pause: `resume` uebernimmt; Wiederverbindung: der Event-Loop gleicht ab
        if inner.verbindung.state() != ConnectionState::Connected {
            return Ok(());
        }
        if let Err(e) = inner.transport.set_microphone_enabled(!muted).await {
            warn!(fehler = %e, muted, "Mikrofon-Mute nicht weitergegeben");
            inner.events.fehler(
                ErrorSource::Transport,
                format!("Mikrofon-Mute fehlgeschlagen: {}", e),
            );
            return Err(e.into());
        }
        Ok(())
    }

    pub fn is_mic_muted(&self) -> bool {
        self.inner.audio.is_mic_muted()
    }

    pub fn input_byte_frequency_data(&self) -> Vec<u8> {
        self.inner.audio.input_byte_frequency_data()
    }

    pub fn output_byte_frequency_data(&self) -> Vec<u8> {
        self.inner.audio.output_byte_frequency_data()
    }

    /// Aktiviert die Roh-Audio-Capture (ersetzt eine laufende)
    pub fn enable_audio_capture(&self, optionen: CaptureOptions) -> Result<()> {
        let config = AudioCaptureConfig::aus_optionen(optionen)?;
        self.inner.audio.enable_capture(config)?;
        Ok(())
    }

    /// Agent-Audio als `pcm-f32` an den Callback
    pub fn enable_simple_audio_capture<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(CaptureChunk) + Send + Sync + 'static,
    {
        self.inner
            .audio
            .enable_capture(AudioCaptureConfig::simple(callback))?;
        Ok(())
    }

    pub fn disable_audio_capture(&self) {
        self.inner.audio.disable_capture();
    }

    // -----------------------------------------------------------------------
    // Tools und Nachrichten
    // -----------------------------------------------------------------------

    /// Ersetzt die registrierten Tools; gibt die Anzahl zurueck
    pub fn register_tools(&self, tools: Vec<ToolDefinition>) -> usize {
        self.inner.tools.registrieren(tools)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.inner.tools.namen()
    }

    /// Sendet eine JSON-Nachricht zuverlaessig an den Raum
    pub async fn send_message(&self, nachricht: &Value) -> Result<()> {
        let inner = &self.inner;
        if !inner.verbindung.is_connected() {
            return Err(VoxError::NichtVerbunden);
        }
        let bytes = message::kodieren(nachricht)?;
        if let Err(e) = inner.transport.publish_data(bytes, true).await {
            warn!(fehler = %e, "Nachricht nicht gesendet");
            inner.events.fehler(
                ErrorSource::Transport,
                format!("Nachricht nicht gesendet: {}", e),
            );
            return Err(e.into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Analytics
    // -----------------------------------------------------------------------

    pub fn connection_stats(&self) -> Option<ConnectionMetrics> {
        self.inner.analytics.connection_stats()
    }

    pub fn audio_levels(&self) -> Option<AudioMetrics> {
        self.inner.analytics.audio_levels()
    }

    pub fn performance_metrics(&self) -> Option<PerformanceMetrics> {
        self.inner.analytics.performance_metrics()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.analytics.participants()
    }

    pub fn track_stats(&self) -> Option<TrackStats> {
        self.inner.analytics.track_stats()
    }

    pub fn call_analytics(&self) -> Option<CallAnalytics> {
        self.inner.analytics.call_analytics()
    }

    // -----------------------------------------------------------------------
    // Zustand und Events
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.inner.verbindung.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.verbindung.is_connected()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.verbindung.is_paused()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.verbindung.session_id()
    }

    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on_any(listener)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.event_loop.lock().take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Intern
// ---------------------------------------------------------------------------

impl Inner {
    /// Baut die Konfiguration der deklarativen Capture (falls aktiviert)
    fn deklarative_capture(&self) -> Result<Option<AudioCaptureConfig>> {
        let einstellungen = &self.config.audio_capture;
        if !einstellungen.enabled {
            return Ok(None);
        }
        let callback = self.capture_callback.lock().clone().ok_or_else(|| {
            VoxError::konfiguration(
                "audio_capture.enabled ohne Callback (with_capture_callback)",
            )
        })?;
        Ok(Some(AudioCaptureConfig::aus_einstellungen(
            einstellungen,
            callback,
        )?))
    }

    /// Markiert die Session als beendet und stoppt das Sampling
    ///
    /// `None` wenn bereits beendet; sonst das Handle des Event-Loops.
    fn beenden(&self, user_initiated: bool) -> Option<Option<JoinHandle<()>>> {
        let _lz = self.lebenszyklus.lock();
        if !self.verbindung.beenden(user_initiated) {
            return None;
        }
        self.analytics.beenden(user_initiated);
        Some(self.event_loop.lock().take())
    }

    /// Lokales Aufraeumen nach dem Ende, meldet `Ended` und `Disconnected`
    fn aufraeumen(&self, reason: DisconnectReason) {
        self.audio.alles_freigeben();
        info!(?reason, "Session beendet");
        self.verbindung.zustand_melden(ConnectionState::Ended);
        self.events.emit(SessionEvent::Disconnected { reason });
    }

    /// Gibt den Transport-Mikrofonzustand aus dem gemerkten Mute weiter
    async fn mikrofon_abgleichen(&self) {
        let muted = self.audio.is_mic_muted();
        if let Err(e) = self.transport.set_microphone_enabled(!muted).await {
            warn!(fehler = %e, muted, "Mikrofon nach Wiederverbindung nicht abgeglichen");
            self.events.fehler(
                ErrorSource::Transport,
                format!("Mikrofon-Mute fehlgeschlagen: {}", e),
            );
        }
    }

    fn transport_event(&self, event: TransportEvent) -> Folge {
        match event {
            TransportEvent::ParticipantConnected(participant) => {
                debug!(teilnehmer = %participant.identity, "Teilnehmer verbunden");
                self.analytics.teilnehmer_hinzufuegen(participant.clone());
                self.events
                    .emit(SessionEvent::ParticipantConnected { participant });
            }
            TransportEvent::ParticipantDisconnected(identity) => {
                debug!(teilnehmer = %identity, "Teilnehmer getrennt");
                self.analytics.teilnehmer_entfernen(&identity);
                self.events
                    .emit(SessionEvent::ParticipantDisconnected { identity });
            }
            TransportEvent::TrackSubscribed(track) => {
                self.audio.track_hinzufuegen(track.clone());
                self.events.emit(SessionEvent::TrackSubscribed { track });
            }
            TransportEvent::TrackUnsubscribed(track_id) => {
                self.audio.track_entfernen(&track_id);
                self.events
                    .emit(SessionEvent::TrackUnsubscribed { track_id });
            }
            TransportEvent::LocalTrackPublished(track) => {
                debug!(track = %track.id, "Lokaler Track veroeffentlicht");
                self.audio.track_hinzufuegen(track);
            }
            TransportEvent::LocalTrackUnpublished(track_id) => {
                self.audio.track_entfernen(&track_id);
            }
            TransportEvent::TrackMuted(track_id) => {
                self.audio.track_stumm_setzen(&track_id, true);
            }
            TransportEvent::TrackUnmuted(track_id) => {
                self.audio.track_stumm_setzen(&track_id, false);
            }
            TransportEvent::ConnectionQualityChanged {
                participant,
                quality,
            } => {
                let quality = self.analytics.qualitaet_gemeldet(quality);
                self.events.emit(SessionEvent::ConnectionQualityChanged {
                    quality,
                    participant: Some(participant),
                });
            }
            TransportEvent::DataReceived { payload, sender } => {
                self.events.emit(message::dekodieren(&payload, sender));
            }
            TransportEvent::AudioFrame(frame) => {
                self.audio.ingest(frame);
            }
            TransportEvent::Reconnecting => {
                if self.verbindung.reconnecting() {
                    info!("Verbindung unterbrochen, Transport verbindet neu");
                    self.analytics.reconnect_versuch();
                    self.events.emit(SessionEvent::Reconnecting);
                }
            }
            TransportEvent::Reconnected => {
                if self.verbindung.reconnected() {
                    info!("Verbindung wiederhergestellt");
                    self.events.emit(SessionEvent::Reconnected);
                    // Aus einer Pause heraus gleicht erst `resume` ab
                    if self.verbindung.state() == ConnectionState::Connected {
                        return Folge::MikrofonAbgleichen;
                    }
                }
            }
            TransportEvent::Disconnected { reason } => {
                warn!(grund = %reason, "Transport meldet Verbindungsende");
                // Der eigene Handle wird nur verworfen, nicht abgebrochen
                if self.beenden(false).is_some() {
                    self.aufraeumen(DisconnectReason::Remote(reason));
                }
                return Folge::Ende;
            }
        }
        Folge::Weiter
    }
}

/// Verarbeitet Transport-Events bis zum Ende der Session
async fn event_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match inner.transport_event(event) {
            Folge::Weiter => {}
            Folge::MikrofonAbgleichen => inner.mikrofon_abgleichen().await,
            Folge::Ende => break,
        }
    }
    debug!("Event-Loop beendet");
}
