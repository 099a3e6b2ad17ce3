//! Analytics-Engine – Verbindungs- und Audio-Metriken einer Session
//!
//! Ein tokio-Task liest jede Sekunde die Rohstatistik des Transports und
//! die Pegel des Audio-Managers, fuehrt die Zaehler fort und verteilt einen
//! vollstaendigen Snapshot als `AnalyticsUpdated`.
//!
//! ## Lebenszyklus
//! `vorbereiten` (Verbindungsversuch gezaehlt) → `starten` (Sampling) →
//! `beenden` (Task abgebrochen, Werte eingefroren). Ein Tick, der beim
//! Beenden schon laeuft, erkennt die neue Generation und verwirft sein
//! Ergebnis.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use voxlink_audio::{AudioManager, AudioPegel};
use voxlink_core::metrics::{
    AnalyticsSnapshot, AudioLevelSample, AudioMetrics, CallAnalytics, CallStats,
    ConnectionMetrics, DirectionMetrics, Participant, PerformanceMetrics, TrackRecord, TrackStats,
};
use voxlink_core::types::{ConnectionQuality, ParticipantIdentity, SessionId};
use voxlink_core::{ErrorSource, EventEmitter, SessionEvent};

use crate::config::AnalyticsEinstellungen;
use crate::quality::klassifizieren;
use crate::transport::{RawStats, Transport};

/// Abstand zweier Ticks
pub const TICK_INTERVALL: Duration = Duration::from_secs(1);

/// Liefert Pegel und Tracks fuer die Auswertung
pub trait AudioQuelle: Send + Sync {
    fn pegel(&self) -> AudioPegel;
    fn tracks(&self) -> Vec<TrackRecord>;
}

impl AudioQuelle for AudioManager {
    fn pegel(&self) -> AudioPegel {
        AudioManager::pegel(self)
    }

    fn tracks(&self) -> Vec<TrackRecord> {
        AudioManager::tracks(self)
    }
}

// ---------------------------------------------------------------------------
// Aufzeichnung (intern, mutable)
// ---------------------------------------------------------------------------

/// Alle Werte einer Session; bleibt nach dem Ende eingefroren stehen
struct Aufzeichnung {
    session_id: SessionId,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    user_initiated_end: bool,
    live: bool,
    /// Sampling lief mindestens einmal (Verbindung stand)
    verbunden: bool,
    stats: CallStats,
    connection: ConnectionMetrics,
    audio: AudioMetrics,
    participants: HashMap<ParticipantIdentity, Participant>,
    latenz_summe: f64,
    latenz_messungen: u64,
    /// Zeitpunkt des letzten Pegel-Samples (Basis fuer die Sprechzeit)
    letztes_sample: Instant,
    vorherige_pegel: AudioPegel,
}

impl Aufzeichnung {
    fn neu(session_id: SessionId, echo_cancellation: bool) -> Self {
        let mut audio = AudioMetrics::default();
        audio.user.echo_cancellation = echo_cancellation;
        Self {
            session_id,
            started_at: Utc::now(),
            ended_at: None,
            user_initiated_end: false,
            live: false,
            verbunden: false,
            stats: CallStats::default(),
            connection: ConnectionMetrics::default(),
            audio,
            participants: HashMap::new(),
            latenz_summe: 0.0,
            latenz_messungen: 0,
            letztes_sample: Instant::now(),
            vorherige_pegel: AudioPegel::default(),
        }
    }

    fn dauer_ms(&self) -> u64 {
        let ende = self.ended_at.unwrap_or_else(Utc::now);
        (ende - self.started_at).num_milliseconds().max(0) as u64
    }

    fn teilnehmer_liste(&self) -> Vec<Participant> {
        let mut liste: Vec<Participant> = self.participants.values().cloned().collect();
        liste.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        liste
    }

    fn performance(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            call_duration_ms: self.dauer_ms(),
            connection_attempts: self.stats.connection_attempts,
            reconnection_attempts: self.stats.reconnection_attempts,
            bytes_sent: self.stats.bytes_sent,
            bytes_received: self.stats.bytes_received,
            packets_lost: self.stats.packets_lost,
            average_latency_ms: (self.latenz_messungen > 0)
                .then(|| self.latenz_summe / self.latenz_messungen as f64),
            quality: self.connection.quality,
        }
    }

    fn call_analytics(&self) -> CallAnalytics {
        CallAnalytics {
            session_id: self.session_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.dauer_ms(),
            user_initiated_end: self.user_initiated_end,
            stats: self.stats.clone(),
            connection: self.connection.clone(),
            audio: self.audio.clone(),
        }
    }

    /// Uebernimmt die Rohwerte; Zaehler sinken nie
    fn statistik_uebernehmen(&mut self, raw: &RawStats) {
        self.connection.latency_ms = raw.latency_ms;
        self.connection.packet_loss_pct = raw.packet_loss_pct;
        self.connection.jitter_ms = raw.jitter_ms;
        self.connection.bandwidth_bytes_per_sec = raw.bandwidth_bytes_per_sec;

        self.stats.bytes_sent = self.stats.bytes_sent.max(raw.bytes_sent);
        self.stats.bytes_received = self.stats.bytes_received.max(raw.bytes_received);
        self.stats.packets_lost = self.stats.packets_lost.max(raw.packets_lost);

        if let Some(latenz) = raw.latency_ms.filter(|l| l.is_finite()) {
            self.latenz_summe += latenz;
            self.latenz_messungen += 1;
        }
    }

    /// Setzt die Qualitaet; gibt den neuen Wert zurueck wenn er sich geaendert hat
    fn qualitaet_setzen(&mut self, quality: ConnectionQuality) -> Option<ConnectionQuality> {
        let alt = self.connection.quality;
        self.connection.quality = quality;
        self.stats.last_quality = quality;
        (alt != quality).then_some(quality)
    }

    fn pegel_uebernehmen(&mut self, pegel: AudioPegel, jetzt: Instant, schwelle: f32) {
        let vergangen_ms = jetzt.saturating_duration_since(self.letztes_sample).as_millis() as u64;
        richtung_fortschreiben(
            &mut self.audio.user,
            self.vorherige_pegel.user,
            pegel.user,
            vergangen_ms,
            schwelle,
        );
        richtung_fortschreiben(
            &mut self.audio.agent,
            self.vorherige_pegel.agent,
            pegel.agent,
            vergangen_ms,
            schwelle,
        );
        self.stats.audio_levels.push(AudioLevelSample {
            timestamp: Utc::now(),
            user_level: pegel.user,
            agent_level: pegel.agent,
        });
        self.vorherige_pegel = pegel;
        self.letztes_sample = jetzt;
    }

    fn snapshot(&self, tracks: Vec<TrackRecord>) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            timestamp: Utc::now(),
            connection: self.connection.clone(),
            audio: self.audio.clone(),
            performance: self.performance(),
            participants: self.teilnehmer_liste(),
            tracks: TrackStats::aus_records(tracks),
        }
    }
}

fn richtung_fortschreiben(
    metriken: &mut DirectionMetrics,
    vorher: f32,
    jetzt: f32,
    vergangen_ms: u64,
    schwelle: f32,
) {
    metriken.level = jetzt;
    if jetzt > schwelle {
        metriken.speaking_time_ms += vergangen_ms;
    }
    if vorher > schwelle && jetzt == 0.0 {
        metriken.dropouts += 1;
    }
}

// ---------------------------------------------------------------------------
// AnalyticsEngine
// ---------------------------------------------------------------------------

struct Inner {
    einstellungen: AnalyticsEinstellungen,
    echo_cancellation: bool,
    events: Arc<EventEmitter>,
    quelle: Arc<dyn AudioQuelle>,
    aufzeichnung: Mutex<Option<Aufzeichnung>>,
    /// Wird bei jedem Start und Ende erhoeht; veraltete Ticks verwerfen sich
    generation: AtomicU64,
    /// Letzte Statistik-Abfrage schlug fehl (nur der erste Fehler wird gemeldet)
    stats_gestoert: AtomicBool,
}

/// Sammelt und verteilt die Metriken einer Session
pub struct AnalyticsEngine {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AnalyticsEngine {
    pub fn neu(
        einstellungen: AnalyticsEinstellungen,
        echo_cancellation: bool,
        events: Arc<EventEmitter>,
        quelle: Arc<dyn AudioQuelle>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                einstellungen,
                echo_cancellation,
                events,
                quelle,
                aufzeichnung: Mutex::new(None),
                generation: AtomicU64::new(0),
                stats_gestoert: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    // -----------------------------------------------------------------------
    // Lebenszyklus
    // -----------------------------------------------------------------------

    /// Legt eine neue Aufzeichnung an und zaehlt den Verbindungsversuch
    ///
    /// Werte einer vorherigen Session werden verworfen. Kam die vorherige
    /// Aufzeichnung nie zustande (Aufbau gescheitert oder abgebrochen),
    /// laufen die Verbindungsversuche weiter.
    pub fn vorbereiten(&self, session_id: SessionId) {
        let mut guard = self.inner.aufzeichnung.lock();
        let bisher = guard
            .as_ref()
            .filter(|r| !r.verbunden)
            .map_or(0, |r| r.stats.connection_attempts);

        let mut rec = Aufzeichnung::neu(session_id, self.inner.echo_cancellation);
        rec.stats.connection_attempts = bisher + 1;
        debug!(%session_id, versuche = rec.stats.connection_attempts, "Analytics vorbereitet");
        *guard = Some(rec);
    }

    /// Startet das Sampling (nach erfolgreichem Verbindungsaufbau)
    pub fn starten(&self, transport: Arc<dyn Transport>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut guard = self.inner.aufzeichnung.lock();
            let Some(rec) = guard.as_mut() else {
                warn!("Analytics-Start ohne vorbereitete Aufzeichnung");
                return;
            };
            rec.live = true;
            rec.verbunden = true;
            rec.started_at = Utc::now();
            rec.letztes_sample = Instant::now();
        }

        self.inner.stats_gestoert.store(false, Ordering::SeqCst);
        if !self.inner.einstellungen.enabled {
            info!("Analytics-Sampling deaktiviert");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVALL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await; // Erster Tick kommt sofort

            loop {
                ticker.tick().await;
                if inner.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                inner.tick(transport.as_ref(), generation).await;
            }
        });

        if let Some(alt) = self.task.lock().replace(handle) {
            alt.abort();
        }
        info!("Analytics-Sampling gestartet");
    }

    /// Stoppt das Sampling sofort und friert die Werte ein
    pub fn beenden(&self, user_initiated: bool) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }

        let mut guard = self.inner.aufzeichnung.lock();
        if let Some(rec) = guard.as_mut() {
            if rec.ended_at.is_none() {
                rec.live = false;
                rec.ended_at = Some(Utc::now());
                rec.user_initiated_end = user_initiated;
                info!(
                    session = %rec.session_id,
                    dauer_ms = rec.dauer_ms(),
                    user_initiated,
                    "Analytics eingefroren"
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Meldungen aus dem Event-Loop
    // -----------------------------------------------------------------------

    pub fn reconnect_versuch(&self) {
        if let Some(rec) = self.inner.aufzeichnung.lock().as_mut().filter(|r| r.live) {
            rec.stats.reconnection_attempts += 1;
        }
    }

    pub fn teilnehmer_hinzufuegen(&self, participant: Participant) {
        if let Some(rec) = self.inner.aufzeichnung.lock().as_mut().filter(|r| r.live) {
            rec.participants
                .insert(participant.identity.clone(), participant);
            rec.stats.participant_count = rec.participants.len();
        }
    }

    pub fn teilnehmer_entfernen(&self, identity: &ParticipantIdentity) {
        if let Some(rec) = self.inner.aufzeichnung.lock().as_mut().filter(|r| r.live) {
            rec.participants.remove(identity);
            rec.stats.participant_count = rec.participants.len();
        }
    }

    /// Verarbeitet eine Qualitaetsmeldung des Adapters
    ///
    /// Liegt bereits ein Messwert vor, gilt dieselbe Einstufung wie beim
    /// periodischen Tick; nur ohne Messwert wird die Meldung uebernommen.
    pub fn qualitaet_gemeldet(&self, gemeldet: ConnectionQuality) -> ConnectionQuality {
        let mut guard = self.inner.aufzeichnung.lock();
        let Some(rec) = guard.as_mut().filter(|r| r.live) else {
            return gemeldet;
        };
        let eingestuft = klassifizieren(rec.connection.latency_ms, rec.connection.packet_loss_pct);
        let quality = if eingestuft == ConnectionQuality::Unknown {
            gemeldet
        } else {
            eingestuft
        };
        rec.qualitaet_setzen(quality);
        quality
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    pub fn ist_aktiv(&self) -> bool {
        self.inner
            .aufzeichnung
            .lock()
            .as_ref()
            .is_some_and(|r| r.live)
    }

    pub fn connection_stats(&self) -> Option<ConnectionMetrics> {
        self.live(|rec| rec.connection.clone())
    }

    pub fn audio_levels(&self) -> Option<AudioMetrics> {
        self.live(|rec| rec.audio.clone())
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.live(Aufzeichnung::teilnehmer_liste).unwrap_or_default()
    }

    pub fn track_stats(&self) -> Option<TrackStats> {
        if !self.ist_aktiv() {
            return None;
        }
        Some(TrackStats::aus_records(self.inner.quelle.tracks()))
    }

    /// Bleibt nach dem Ende bis zur naechsten Verbindung abrufbar
    pub fn performance_metrics(&self) -> Option<PerformanceMetrics> {
        self.inner
            .aufzeichnung
            .lock()
            .as_ref()
            .map(Aufzeichnung::performance)
    }

    /// Bleibt nach dem Ende bis zur naechsten Verbindung abrufbar
    pub fn call_analytics(&self) -> Option<CallAnalytics> {
        self.inner
            .aufzeichnung
            .lock()
            .as_ref()
            .map(Aufzeichnung::call_analytics)
    }

    fn live<T>(&self, f: impl FnOnce(&Aufzeichnung) -> T) -> Option<T> {
        self.inner
            .aufzeichnung
            .lock()
            .as_ref()
            .filter(|r| r.live)
            .map(f)
    }
}

impl Drop for AnalyticsEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Inner {
    async fn tick(&self, transport: &dyn Transport, generation: u64) {
        let raw = match transport.stats().await {
            Ok(raw) => {
                self.stats_gestoert.store(false, Ordering::SeqCst);
                Some(raw)
            }
            Err(e) => {
                warn!(fehler = %e, "Transport-Statistik nicht verfuegbar");
                if self.generation.load(Ordering::SeqCst) == generation
                    && !self.stats_gestoert.swap(true, Ordering::SeqCst)
                {
                    self.events.fehler(
                        ErrorSource::Analytics,
                        format!("Transport-Statistik nicht verfuegbar: {}", e),
                    );
                }
                None
            }
        };

        // Quelle ohne eigenes Lock abfragen
        let pegel = self.quelle.pegel();
        let tracks = self.quelle.tracks();
        let jetzt = Instant::now();

        let (snapshot, qualitaet_neu) = {
            let mut guard = self.aufzeichnung.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                trace!("Veralteter Tick verworfen");
                return;
            }
            let Some(rec) = guard.as_mut().filter(|r| r.live) else {
                return;
            };

            let mut qualitaet_neu = None;
            if let Some(raw) = &raw {
                rec.statistik_uebernehmen(raw);
                let quality =
                    klassifizieren(rec.connection.latency_ms, rec.connection.packet_loss_pct);
                qualitaet_neu = rec.qualitaet_setzen(quality);
            }
            rec.stats.track_count = tracks.len();
            rec.pegel_uebernehmen(pegel, jetzt, self.einstellungen.silence_threshold);

            (rec.snapshot(tracks), qualitaet_neu)
        };

        if let Some(quality) = qualitaet_neu {
            debug!(%quality, "Verbindungsqualitaet geaendert");
            self.events.emit(SessionEvent::ConnectionQualityChanged {
                quality,
                participant: None,
            });
        }
        self.events.emit(SessionEvent::AnalyticsUpdated {
            snapshot: Box::new(snapshot),
        });
    }
}
