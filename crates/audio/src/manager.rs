//! Audio-Manager einer Session
//!
//! Haelt jeden bekannten Track in einer Arena (Track-ID -> Slot). Ein Slot
//! besitzt exklusiv hoechstens einen Playback-Sink und hoechstens eine
//! Capture-Pipeline; beides wird zusammen mit dem Slot freigegeben.
//!
//! Sink-Operationen, die Listener ausloesen koennen (Pause, Freigabe,
//! Erstellung), laufen ohne gehaltenes Zustands-Lock, damit Event-Listener
//! wieder auf den Manager zugreifen duerfen.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, trace, warn};
use voxlink_core::event::panic_nachricht;
use voxlink_core::metrics::TrackRecord;
use voxlink_core::types::{AudioDirection, TrackId};
use voxlink_core::{ErrorSource, EventEmitter, SessionEvent};

use crate::analyser::FrequencyAnalyser;
use crate::backend::{AudioBackend, GraphState, PlaybackListener, PlaybackSink, PlaybackStatus};
use crate::capture::{AudioCaptureConfig, CaptureCallback, CaptureChunk, CapturePipeline};
use crate::error::{AudioError, AudioResult};
use crate::volume::OutputVolume;

/// Wie oft ein von Listenern geaenderter Sink-Stand nachgezogen wird
const MAX_NACHZUG_RUNDEN: usize = 4;

/// Dekodierte PCM-Samples eines Tracks (mono, -1.0..1.0)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub track_id: TrackId,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Aktuelle Pegel beider Richtungen (RMS, 0.0..=1.0)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AudioPegel {
    pub user: f32,
    pub agent: f32,
}

enum CaptureSlot {
    Keine,
    Aktiv {
        pipeline: CapturePipeline,
        sample_rate: u32,
    },
    /// Pipeline konnte nicht gebaut werden, Track wird nicht aufgenommen
    Uebersprungen,
}

struct TrackSlot {
    record: TrackRecord,
    playback: Option<Box<dyn PlaybackSink>>,
    capture: CaptureSlot,
}

impl TrackSlot {
    fn richtung(&self) -> AudioDirection {
        richtung(&self.record)
    }
}

#[derive(Default)]
struct Zustand {
    tracks: HashMap<TrackId, TrackSlot>,
    volume: OutputVolume,
    mic_muted: bool,
    playback_paused: bool,
    capture: Option<AudioCaptureConfig>,
    input_analyser: Option<FrequencyAnalyser>,
    /// Folgt dem zuletzt abonnierten entfernten Audio-Track
    output_analyser: Option<(TrackId, FrequencyAnalyser)>,
    pegel: AudioPegel,
}

/// Verwaltet alle Audio-Ressourcen einer Session
pub struct AudioManager {
    backend: Arc<dyn AudioBackend>,
    events: Arc<EventEmitter>,
    zustand: Mutex<Zustand>,
    /// Serialisiert Sink-Operationen ausserhalb des Zustands-Locks
    sink_ops: ReentrantMutex<()>,
}

impl AudioManager {
    pub fn neu(backend: Arc<dyn AudioBackend>, events: Arc<EventEmitter>) -> Self {
        Self {
            backend,
            events,
            zustand: Mutex::new(Zustand::default()),
            sink_ops: ReentrantMutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Tracks
    // -----------------------------------------------------------------------

    /// Nimmt einen abonnierten oder lokal veroeffentlichten Track auf
    ///
    /// Entfernte Audio-Tracks bekommen einen Playback-Sink mit der aktuellen
    /// Lautstaerke. Schlaegt die Erstellung fehl, wird der Track trotzdem
    /// gefuehrt und ein Fehler gemeldet.
    pub fn track_hinzufuegen(&self, record: TrackRecord) {
        let _ops = self.sink_ops.lock();
        let id = record.id.clone();

        let playback = if record.ist_audio() && !record.local {
            let (volume, paused) = {
                let z = self.zustand.lock();
                (z.volume, z.playback_paused)
            };
            match self.playback_erstellen(&record, volume, paused) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    warn!(track = %id, fehler = %e, "Playback-Sink konnte nicht erstellt werden");
                    self.events.fehler(
                        ErrorSource::Audio,
                        format!("Wiedergabe fuer {} fehlgeschlagen: {}", id, e),
                    );
                    None
                }
            }
        } else {
            None
        };

        let (verdraengt, callback) = {
            let mut z = self.zustand.lock();
            if record.ist_audio() {
                if record.local {
                    z.input_analyser.get_or_insert_with(FrequencyAnalyser::neu);
                } else {
                    z.output_analyser = Some((id.clone(), FrequencyAnalyser::neu()));
                }
            }
            let alt = z.tracks.insert(
                id.clone(),
                TrackSlot {
                    record,
                    playback,
                    capture: CaptureSlot::Keine,
                },
            );
            (alt, z.capture.as_ref().map(|c| Arc::clone(&c.callback)))
        };

        if let Some(alt) = verdraengt {
            debug!(track = %id, "Track erneut gemeldet, alter Slot wird freigegeben");
            self.slot_freigeben(alt, callback.as_ref());
        }
        debug!(track = %id, "Track aufgenommen");
    }

    /// Entfernt einen Track und gibt seine Ressourcen frei
    ///
    /// Eine fehlschlagende Freigabe wird gemeldet, der Track ist danach
    /// trotzdem nicht mehr bekannt.
    pub fn track_entfernen(&self, track_id: &TrackId) -> Option<TrackRecord> {
        let _ops = self.sink_ops.lock();
        let (slot, callback) = {
            let mut guard = self.zustand.lock();
            let z = &mut *guard;
            let slot = z.tracks.remove(track_id)?;

            if z.output_analyser.as_ref().map(|(id, _)| id) == Some(track_id) {
                z.pegel.agent = 0.0;
                z.output_analyser = z
                    .tracks
                    .values()
                    .filter(|s| s.record.ist_audio() && !s.record.local)
                    .max_by_key(|s| s.record.subscribed_at)
                    .map(|s| (s.record.id.clone(), FrequencyAnalyser::neu()));
            }
            if slot.record.local && slot.record.ist_audio() {
                let weitere_lokale = z
                    .tracks
                    .values()
                    .any(|s| s.record.local && s.record.ist_audio());
                if !weitere_lokale {
                    z.input_analyser = None;
                    z.pegel.user = 0.0;
                }
            }
            (slot, z.capture.as_ref().map(|c| Arc::clone(&c.callback)))
        };

        let record = slot.record.clone();
        self.slot_freigeben(slot, callback.as_ref());
        debug!(track = %track_id, "Track entfernt");
        Some(record)
    }

    /// Setzt das Mute-Flag eines Tracks. Gibt false zurueck wenn unbekannt.
    pub fn track_stumm_setzen(&self, track_id: &TrackId, muted: bool) -> bool {
        match self.zustand.lock().tracks.get_mut(track_id) {
            Some(slot) => {
                slot.record.muted = muted;
                true
            }
            None => false,
        }
    }

    /// Alle bekannten Tracks in Abonnement-Reihenfolge
    pub fn tracks(&self) -> Vec<TrackRecord> {
        let mut tracks: Vec<TrackRecord> = self
            .zustand
            .lock()
            .tracks
            .values()
            .map(|s| s.record.clone())
            .collect();
        tracks.sort_by(|a, b| {
            a.subscribed_at
                .cmp(&b.subscribed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        tracks
    }

    pub fn track_anzahl(&self) -> usize {
        self.zustand.lock().tracks.len()
    }

    // -----------------------------------------------------------------------
    // Lautstaerke / Mute / Pause
    // -----------------------------------------------------------------------

    /// Setzt die Ausgabe-Lautstaerke fuer alle bestehenden und kuenftigen Sinks
    ///
    /// Gibt den tatsaechlich gesetzten (begrenzten) Wert zurueck.
    /// Fehler einzelner Sinks werden gesammelt und als ein Fehler-Event
    /// gemeldet.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let _ops = self.sink_ops.lock();
        let volume = OutputVolume::neu(volume);
        self.zustand.lock().volume = volume;

        let fehler = self.mit_sinks(|sink| sink.set_volume(volume.wert()));
        if !fehler.is_empty() {
            warn!(anzahl = fehler.len(), "Lautstaerke nicht auf alle Sinks anwendbar");
            self.events.fehler(
                ErrorSource::Audio,
                format!("Lautstaerke konnte nicht gesetzt werden: {}", fehler.join("; ")),
            );
        }
        volume.wert()
    }

    pub fn volume(&self) -> f32 {
        self.zustand.lock().volume.wert()
    }

    /// Merkt sich das Mikrofon-Mute (Weitergabe an den Transport macht die Session)
    pub fn set_mic_muted(&self, muted: bool) {
        let mut z = self.zustand.lock();
        z.mic_muted = muted;
        if muted {
            z.pegel.user = 0.0;
        }
    }

    pub fn is_mic_muted(&self) -> bool {
        self.zustand.lock().mic_muted
    }

    /// Pausiert bzw. startet die lokale Wiedergabe aller Sinks
    pub fn set_playback_paused(&self, paused: bool) {
        let _ops = self.sink_ops.lock();
        self.zustand.lock().playback_paused = paused;

        let fehler = self.mit_sinks(|sink| sink.set_paused(paused));
        if !fehler.is_empty() {
            self.events.fehler(
                ErrorSource::Audio,
                format!("Wiedergabe-Pause fehlgeschlagen: {}", fehler.join("; ")),
            );
        }
    }

    pub fn is_playback_paused(&self) -> bool {
        self.zustand.lock().playback_paused
    }

    // -----------------------------------------------------------------------
    // Analyse
    // -----------------------------------------------------------------------

    /// Byte-Spektrum des Mikrofons; leer ohne Audio-Graph
    pub fn input_byte_frequency_data(&self) -> Vec<u8> {
        if self.backend.graph_state() == GraphState::Closed {
            return Vec::new();
        }
        self.zustand
            .lock()
            .input_analyser
            .as_mut()
            .map(FrequencyAnalyser::byte_frequency_data)
            .unwrap_or_default()
    }

    /// Byte-Spektrum der Gegenseite; leer ohne Audio-Graph
    pub fn output_byte_frequency_data(&self) -> Vec<u8> {
        if self.backend.graph_state() == GraphState::Closed {
            return Vec::new();
        }
        self.zustand
            .lock()
            .output_analyser
            .as_mut()
            .map(|(_, a)| a.byte_frequency_data())
            .unwrap_or_default()
    }

    pub fn pegel(&self) -> AudioPegel {
        self.zustand.lock().pegel
    }

    // -----------------------------------------------------------------------
    // Frames und Capture
    // -----------------------------------------------------------------------

    /// Verarbeitet einen dekodierten Frame: Pegel, Analyse, Capture
    ///
    /// Leere Frames und Frames unbekannter Tracks werden ignoriert.
    pub fn ingest(&self, frame: AudioFrame) {
        if frame.samples.is_empty() || frame.sample_rate == 0 {
            trace!(track = %frame.track_id, "Leerer Frame ignoriert");
            return;
        }

        let mut fehler: Option<AudioError> = None;
        let (callback, richtung, sample_rate, chunks) = {
            let mut guard = self.zustand.lock();
            let z = &mut *guard;

            let Some(slot) = z.tracks.get_mut(&frame.track_id) else {
                trace!(track = %frame.track_id, "Frame fuer unbekannten Track ignoriert");
                return;
            };
            if !slot.record.ist_audio() {
                return;
            }

            let richtung = slot.richtung();
            let level = rms(&frame.samples);
            match richtung {
                AudioDirection::User => {
                    if z.mic_muted {
                        z.pegel.user = 0.0;
                        return;
                    }
                    z.pegel.user = level;
                    if let Some(a) = z.input_analyser.as_mut() {
                        a.einspeisen(&frame.samples);
                    }
                }
                AudioDirection::Agent => {
                    if let Some((id, a)) = z.output_analyser.as_mut() {
                        if *id == frame.track_id {
                            z.pegel.agent = level;
                            a.einspeisen(&frame.samples);
                        }
                    }
                }
            }

            let Some(config) = z.capture.as_ref() else {
                return;
            };
            if !config.source.umfasst(richtung) {
                return;
            }

            if matches!(slot.capture, CaptureSlot::Keine) {
                slot.capture =
                    match CapturePipeline::erstellen(config, self.backend.as_ref(), frame.sample_rate)
                    {
                        Ok(pipeline) => {
                            debug!(track = %frame.track_id, format = ?config.format, "Capture-Pipeline gestartet");
                            CaptureSlot::Aktiv {
                                pipeline,
                                sample_rate: frame.sample_rate,
                            }
                        }
                        Err(e) => {
                            fehler = Some(e);
                            CaptureSlot::Uebersprungen
                        }
                    };
            }

            let mut chunks = Vec::new();
            let mut sample_rate = frame.sample_rate;
            if let CaptureSlot::Aktiv {
                pipeline,
                sample_rate: rate,
            } = &mut slot.capture
            {
                sample_rate = *rate;
                match pipeline.push(&frame.samples) {
                    Ok(daten) => chunks = daten,
                    Err(e) => fehler = Some(e),
                }
            }
            (Arc::clone(&config.callback), richtung, sample_rate, chunks)
        };

        if let Some(e) = fehler {
            warn!(track = %frame.track_id, fehler = %e, "Capture fuer Track fehlgeschlagen");
            self.events.fehler(
                ErrorSource::Capture,
                format!("Capture fuer {} fehlgeschlagen: {}", frame.track_id, e),
            );
        }

        for data in chunks {
            self.liefern(
                &callback,
                CaptureChunk {
                    track_id: frame.track_id.clone(),
                    source: richtung,
                    sample_rate,
                    timestamp: Utc::now(),
                    data,
                },
            );
        }
    }

    /// Aktiviert die Roh-Audio-Capture (ersetzt eine vorherige Konfiguration)
    ///
    /// Ein angehaltener Audio-Graph wird dabei fortgesetzt.
    pub fn enable_capture(&self, config: AudioCaptureConfig) -> AudioResult<()> {
        match self.backend.graph_state() {
            GraphState::Closed => return Err(AudioError::KeinGraph),
            GraphState::Suspended => match self.backend.resume_graph() {
                Ok(()) => debug!("Angehaltener Audio-Graph fortgesetzt"),
                Err(e) => {
                    warn!(fehler = %e, "Audio-Graph konnte nicht fortgesetzt werden");
                    self.events.fehler(
                        ErrorSource::Audio,
                        format!("Audio-Graph konnte nicht fortgesetzt werden: {}", e),
                    );
                }
            },
            GraphState::Running => {}
        }

        self.disable_capture();
        info!(
            source = ?config.source,
            format = ?config.format,
            buffer_size = config.buffer_size,
            chunk_size_ms = config.chunk_size_ms,
            "Audio-Capture aktiviert"
        );
        self.zustand.lock().capture = Some(config);
        Ok(())
    }

    /// Stoppt alle Capture-Pipelines
    ///
    /// Stop-Fehler werden protokolliert und verschluckt; die Registrierungen
    /// sind danach in jedem Fall leer.
    pub fn disable_capture(&self) {
        let (pipelines, callback) = {
            let mut z = self.zustand.lock();
            let config = z.capture.take();
            let pipelines: Vec<_> = z
                .tracks
                .iter_mut()
                .filter_map(|(id, slot)| {
                    let richtung = slot.richtung();
                    match std::mem::replace(&mut slot.capture, CaptureSlot::Keine) {
                        CaptureSlot::Aktiv {
                            pipeline,
                            sample_rate,
                        } => Some((id.clone(), richtung, sample_rate, pipeline)),
                        _ => None,
                    }
                })
                .collect();
            (pipelines, config.map(|c| c.callback))
        };

        if callback.is_some() {
            info!(pipelines = pipelines.len(), "Audio-Capture deaktiviert");
        }
        for (track_id, richtung, sample_rate, mut pipeline) in pipelines {
            self.pipeline_stoppen(&track_id, richtung, sample_rate, &mut pipeline, callback.as_ref());
        }
    }

    pub fn capture_aktiv(&self) -> bool {
        self.zustand.lock().capture.is_some()
    }

    /// Anzahl laufender Capture-Pipelines
    pub fn capture_pipelines(&self) -> usize {
        self.zustand
            .lock()
            .tracks
            .values()
            .filter(|s| matches!(s.capture, CaptureSlot::Aktiv { .. }))
            .count()
    }

    // -----------------------------------------------------------------------
    // Aufraeumen
    // -----------------------------------------------------------------------

    /// Gibt alle Ressourcen frei (Ende der Session)
    ///
    /// Lautstaerke und Mikrofon-Mute bleiben erhalten.
    pub fn alles_freigeben(&self) {
        let _ops = self.sink_ops.lock();
        let (slots, callback) = {
            let mut z = self.zustand.lock();
            let config = z.capture.take();
            z.input_analyser = None;
            z.output_analyser = None;
            z.pegel = AudioPegel::default();
            z.playback_paused = false;
            let slots: Vec<TrackSlot> = z.tracks.drain().map(|(_, s)| s).collect();
            (slots, config.map(|c| c.callback))
        };

        let anzahl = slots.len();
        for slot in slots {
            self.slot_freigeben(slot, callback.as_ref());
        }
        info!(tracks = anzahl, "Audio-Ressourcen freigegeben");
    }

    // -----------------------------------------------------------------------
    // Intern
    // -----------------------------------------------------------------------

    fn playback_erstellen(
        &self,
        record: &TrackRecord,
        volume: OutputVolume,
        paused: bool,
    ) -> AudioResult<Box<dyn PlaybackSink>> {
        let events = Arc::clone(&self.events);
        let track_id = record.id.clone();
        let listener: PlaybackListener = Box::new(move |status| {
            let track_id = track_id.clone();
            let event = match status {
                PlaybackStatus::Playing => SessionEvent::Speaking { track_id },
                PlaybackStatus::Paused | PlaybackStatus::Ended => {
                    SessionEvent::Listening { track_id }
                }
            };
            events.emit(event);
        });

        let mut sink = self.backend.create_playback(record, listener)?;
        let eingestellt = sink
            .set_volume(volume.wert())
            .and_then(|()| if paused { sink.set_paused(true) } else { Ok(()) });
        if let Err(e) = eingestellt {
            if let Err(release) = sink.release() {
                debug!(fehler = %release, "Freigabe nach fehlgeschlagener Einrichtung");
            }
            return Err(e);
        }
        Ok(sink)
    }

    /// Wendet `f` auf alle Sinks an, ohne das Zustands-Lock zu halten
    ///
    /// Listener koennen waehrend `f` Lautstaerke oder Pause umstellen; die
    /// entnommenen Sinks sehen das nicht. Vor dem Zuruecklegen wird daher
    /// der aktuelle Stand nachgezogen.
    fn mit_sinks(
        &self,
        mut f: impl FnMut(&mut dyn PlaybackSink) -> AudioResult<()>,
    ) -> Vec<String> {
        let (mut sinks, mut stand) = {
            let mut z = self.zustand.lock();
            let stand = (z.volume.wert(), z.playback_paused);
            let sinks: Vec<(TrackId, Box<dyn PlaybackSink>)> = z
                .tracks
                .iter_mut()
                .filter_map(|(id, slot)| slot.playback.take().map(|p| (id.clone(), p)))
                .collect();
            (sinks, stand)
        };

        let mut fehler = Vec::new();
        for (id, sink) in sinks.iter_mut() {
            if let Err(e) = f(sink.as_mut()) {
                warn!(track = %id, fehler = %e, "Sink-Operation fehlgeschlagen");
                fehler.push(format!("{}: {}", id, e));
            }
        }

        let mut verwaist = Vec::new();
        for runde in 0.. {
            let mut z = self.zustand.lock();
            let aktuell = (z.volume.wert(), z.playback_paused);
            if aktuell == stand || runde == MAX_NACHZUG_RUNDEN {
                for (id, sink) in sinks.drain(..) {
                    match z.tracks.get_mut(&id) {
                        Some(slot) if slot.playback.is_none() => slot.playback = Some(sink),
                        _ => verwaist.push(sink),
                    }
                }
                break;
            }
            drop(z);

            debug!(volume = aktuell.0, paused = aktuell.1, "Sink-Stand nachgezogen");
            for (id, sink) in sinks.iter_mut() {
                let ergebnis = sink.set_volume(aktuell.0).and_then(|()| {
                    if aktuell.1 != stand.1 {
                        sink.set_paused(aktuell.1)
                    } else {
                        Ok(())
                    }
                });
                if let Err(e) = ergebnis {
                    warn!(track = %id, fehler = %e, "Sink-Stand nicht nachziehbar");
                    fehler.push(format!("{}: {}", id, e));
                }
            }
            stand = aktuell;
        }
        for mut sink in verwaist {
            if let Err(e) = sink.release() {
                debug!(fehler = %e, "Verwaister Sink nicht freigebbar");
            }
        }
        fehler
    }

    fn slot_freigeben(&self, slot: TrackSlot, callback: Option<&CaptureCallback>) {
        let richtung = slot.richtung();
        let TrackSlot {
            record,
            playback,
            capture,
        } = slot;

        if let CaptureSlot::Aktiv {
            mut pipeline,
            sample_rate,
        } = capture
        {
            self.pipeline_stoppen(&record.id, richtung, sample_rate, &mut pipeline, callback);
        }

        if let Some(mut sink) = playback {
            if let Err(e) = sink.release() {
                warn!(track = %record.id, fehler = %e, "Freigabe des Sinks fehlgeschlagen");
                self.events.fehler(
                    ErrorSource::Audio,
                    format!("Freigabe von {} fehlgeschlagen: {}", record.id, e),
                );
            }
        }
    }

    fn pipeline_stoppen(
        &self,
        track_id: &TrackId,
        richtung: AudioDirection,
        sample_rate: u32,
        pipeline: &mut CapturePipeline,
        callback: Option<&CaptureCallback>,
    ) {
        match pipeline.stop() {
            Ok(Some(data)) => {
                if let Some(callback) = callback {
                    self.liefern(
                        callback,
                        CaptureChunk {
                            track_id: track_id.clone(),
                            source: richtung,
                            sample_rate,
                            timestamp: Utc::now(),
                            data,
                        },
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(track = %track_id, fehler = %e, "Stoppen der Capture-Pipeline fehlgeschlagen, ignoriert");
            }
        }
    }

    fn liefern(&self, callback: &CaptureCallback, chunk: CaptureChunk) {
        let track_id = chunk.track_id.clone();
        trace!(track = %track_id, len = chunk.data.len(), "Capture-Chunk");
        if let Err(panik) = catch_unwind(AssertUnwindSafe(|| callback(chunk))) {
            let grund = panic_nachricht(panik.as_ref());
            warn!(track = %track_id, %grund, "Capture-Callback fehlgeschlagen");
            self.events.fehler(
                ErrorSource::Capture,
                format!("Capture-Callback fuer {} fehlgeschlagen: {}", track_id, grund),
            );
        }
    }
}

fn richtung(record: &TrackRecord) -> AudioDirection {
    if record.local {
        AudioDirection::User
    } else {
        AudioDirection::Agent
    }
}

/// RMS-Pegel, begrenzt auf 0.0..=1.0
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let summe: f32 = samples
        .iter()
        .map(|s| if s.is_finite() { s * s } else { 0.0 })
        .sum();
    (summe / samples.len() as f32).sqrt().min(1.0)
}
