//! Headless-Backend ohne Plattform-Audio
//!
//! Sinks merken sich nur Lautstaerke und Pause, der Graph laeuft immer.
//! Als Container-Typ wird ausschliesslich der Opus-Paketstrom
//! ([`OPUS_MIME`]) angeboten.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use voxlink_core::metrics::TrackRecord;
use voxlink_core::types::TrackId;

use crate::backend::{
    AudioBackend, ContainerEncoder, GraphState, PlaybackListener, PlaybackSink, PlaybackStatus,
};
use crate::codec::{OpusPacketEncoder, OPUS_MIME};
use crate::error::{AudioError, AudioResult};

/// Beobachtbarer Zustand eines Headless-Sinks
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkZustand {
    pub volume: f32,
    pub paused: bool,
    pub released: bool,
}

type SinkTabelle = Arc<Mutex<HashMap<TrackId, SinkZustand>>>;

/// Backend fuer Server, Tests und Kommandozeile
pub struct HeadlessBackend {
    sinks: SinkTabelle,
    graph: Mutex<GraphState>,
    container: bool,
}

impl HeadlessBackend {
    pub fn neu() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(HashMap::new())),
            graph: Mutex::new(GraphState::Running),
            container: true,
        }
    }

    /// Backend ohne jeden Container-Typ
    pub fn ohne_container() -> Self {
        Self {
            container: false,
            ..Self::neu()
        }
    }

    /// Zustand des Sinks eines Tracks
    pub fn sink_zustand(&self, track: &TrackId) -> Option<SinkZustand> {
        self.sinks.lock().get(track).copied()
    }

    /// Anzahl nicht freigegebener Sinks
    pub fn aktive_sinks(&self) -> usize {
        self.sinks.lock().values().filter(|s| !s.released).count()
    }

    /// Setzt den Graph-Zustand (z.B. angehalten durch das System)
    pub fn graph_setzen(&self, zustand: GraphState) {
        *self.graph.lock() = zustand;
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::neu()
    }
}

impl AudioBackend for HeadlessBackend {
    fn create_playback(
        &self,
        track: &TrackRecord,
        listener: PlaybackListener,
    ) -> AudioResult<Box<dyn PlaybackSink>> {
        if *self.graph.lock() == GraphState::Closed {
            return Err(AudioError::KeinGraph);
        }
        self.sinks.lock().insert(
            track.id.clone(),
            SinkZustand {
                volume: 1.0,
                paused: false,
                released: false,
            },
        );
        debug!(track = %track.id, "Headless-Sink erstellt");
        listener(PlaybackStatus::Playing);

        Ok(Box::new(HeadlessSink {
            track: track.id.clone(),
            sinks: Arc::clone(&self.sinks),
            listener,
        }))
    }

    fn graph_state(&self) -> GraphState {
        *self.graph.lock()
    }

    fn resume_graph(&self) -> AudioResult<()> {
        let mut graph = self.graph.lock();
        match *graph {
            GraphState::Closed => Err(AudioError::KeinGraph),
            _ => {
                *graph = GraphState::Running;
                Ok(())
            }
        }
    }

    fn is_container_type_supported(&self, mime_type: &str) -> bool {
        self.container && mime_type == OPUS_MIME
    }

    fn create_container_encoder(
        &self,
        mime_type: &str,
        sample_rate: u32,
        chunk_size_ms: u32,
    ) -> AudioResult<Box<dyn ContainerEncoder>> {
        if !self.is_container_type_supported(mime_type) {
            return Err(AudioError::FormatNichtUnterstuetzt(mime_type.to_string()));
        }
        Ok(Box::new(OpusPacketEncoder::new(sample_rate, chunk_size_ms)?))
    }
}

struct HeadlessSink {
    track: TrackId,
    sinks: SinkTabelle,
    listener: PlaybackListener,
}

impl HeadlessSink {
    fn aendern(&self, f: impl FnOnce(&mut SinkZustand)) -> AudioResult<()> {
        let mut sinks = self.sinks.lock();
        let zustand = sinks
            .get_mut(&self.track)
            .filter(|z| !z.released)
            .ok_or_else(|| AudioError::Wiedergabe {
                track: self.track.to_string(),
                grund: "Sink bereits freigegeben".into(),
            })?;
        f(zustand);
        Ok(())
    }
}

impl PlaybackSink for HeadlessSink {
    fn set_volume(&mut self, volume: f32) -> AudioResult<()> {
        self.aendern(|z| z.volume = volume)
    }

    fn set_paused(&mut self, paused: bool) -> AudioResult<()> {
        self.aendern(|z| z.paused = paused)?;
        (self.listener)(if paused {
            PlaybackStatus::Paused
        } else {
            PlaybackStatus::Playing
        });
        Ok(())
    }

    fn release(&mut self) -> AudioResult<()> {
        self.aendern(|z| z.released = true)?;
        (self.listener)(PlaybackStatus::Ended);
        Ok(())
    }
}
