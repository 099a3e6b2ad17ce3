//! Loopback-Transport
//!
//! Simuliert einen Raum mit einem Agenten: Teilnehmer, Tracks, Audio-Frames
//! (Sinus) und schwankende Verbindungsstatistiken. Gesendete Daten kommen
//! als Nachricht des Agenten zurueck.

use std::collections::HashMap;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
use voxlink_audio::AudioFrame;
use voxlink_core::metrics::{Participant, TrackRecord};
use voxlink_core::types::{ParticipantIdentity, TrackId, TrackKind};
use voxlink_session::{
    RawStats, RpcHandler, RpcInvocation, Transport, TransportError, TransportEvent,
    TransportEventSender, TransportResult,
};

const ABTASTRATE: u32 = 48_000;
const FRAME_MS: u64 = 20;
const FRAME_SAMPLES: usize = (ABTASTRATE as usize / 1000) * FRAME_MS as usize;

pub const AGENT: &str = "agent";
const AGENT_TRACK: &str = "TR_agent_audio";
const MIKROFON_TRACK: &str = "TR_local_mic";

struct Verbindung {
    sender: TransportEventSender,
    seit: Instant,
    generator: JoinHandle<()>,
}

#[derive(Default)]
pub struct LoopbackTransport {
    verbindung: Mutex<Option<Verbindung>>,
    mikrofon: Arc<AtomicBool>,
    rpc: Mutex<HashMap<String, RpcHandler>>,
}

impl LoopbackTransport {
    pub fn neu() -> Self {
        Self {
            mikrofon: Arc::new(AtomicBool::new(true)),
            ..Default::default()
        }
    }

    /// Ruft eine registrierte Methode so auf, wie es der Agent tun wuerde
    pub async fn rpc_aufrufen(&self, methode: &str, payload: Option<&str>) -> Option<String> {
        let handler = self.rpc.lock().get(methode).cloned()?;
        let antwort = handler(RpcInvocation {
            request_id: format!("loop-{}", Utc::now().timestamp_millis()),
            caller: ParticipantIdentity::new(AGENT),
            payload: payload.map(str::to_string),
        })
        .await;
        Some(antwort)
    }

    fn sender(&self) -> TransportResult<TransportEventSender> {
        self.verbindung
            .lock()
            .as_ref()
            .map(|v| v.sender.clone())
            .ok_or(TransportError::NichtVerbunden)
    }
}

fn track(id: &str, teilnehmer: &str, lokal: bool) -> TrackRecord {
    TrackRecord {
        id: TrackId::new(id),
        kind: TrackKind::Audio,
        participant: ParticipantIdentity::new(teilnehmer),
        local: lokal,
        subscribed_at: Utc::now(),
        muted: false,
        enabled: true,
        dimensions: None,
    }
}

fn sinus(frequenz: f32, amplitude: f32, start: usize) -> Vec<f32> {
    (start..start + FRAME_SAMPLES)
        .map(|i| amplitude * (2.0 * PI * frequenz * i as f32 / ABTASTRATE as f32).sin())
        .collect()
}

/// Erzeugt Frames im 20-ms-Takt; der Agent spricht abwechselnd 2 s und schweigt 1 s
async fn generator(sender: TransportEventSender, mikrofon: Arc<AtomicBool>) {
    let mut takt = tokio::time::interval(Duration::from_millis(FRAME_MS));
    let mut position = 0usize;
    let mut frame_nr = 0u64;

    loop {
        takt.tick().await;
        let agent_spricht = (frame_nr * FRAME_MS) % 3_000 < 2_000;
        let agent = if agent_spricht {
            sinus(220.0, 0.4, position)
        } else {
            vec![0.0; FRAME_SAMPLES]
        };

        let mut frames = vec![AudioFrame {
            track_id: TrackId::new(AGENT_TRACK),
            samples: agent,
            sample_rate: ABTASTRATE,
        }];
        if mikrofon.load(Ordering::Relaxed) {
            frames.push(AudioFrame {
                track_id: TrackId::new(MIKROFON_TRACK),
                samples: sinus(440.0, 0.1, position),
                sample_rate: ABTASTRATE,
            });
        }

        for frame in frames {
            if sender.send(TransportEvent::AudioFrame(frame)).is_err() {
                return;
            }
        }
        position += FRAME_SAMPLES;
        frame_nr += 1;
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        url: &str,
        _token: &str,
        events: TransportEventSender,
    ) -> TransportResult<()> {
        // Kurze Aufbauzeit wie bei einem echten Raum
        tokio::time::sleep(Duration::from_millis(50)).await;

        let einrichtung = [
            TransportEvent::ParticipantConnected(Participant {
                identity: ParticipantIdentity::new(AGENT),
                sid: "PA_loopback".into(),
                connected_at: Utc::now(),
                metadata: Some(r#"{"rolle":"agent"}"#.into()),
            }),
            TransportEvent::LocalTrackPublished(track(MIKROFON_TRACK, "demo", true)),
            TransportEvent::TrackSubscribed(track(AGENT_TRACK, AGENT, false)),
        ];
        for event in einrichtung {
            events
                .send(event)
                .map_err(|e| TransportError::Verbindung(e.to_string()))?;
        }

        let generator = tokio::spawn(generator(events.clone(), Arc::clone(&self.mikrofon)));
        *self.verbindung.lock() = Some(Verbindung {
            sender: events,
            seit: Instant::now(),
            generator,
        });
        info!(url, "Loopback verbunden");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Some(v) = self.verbindung.lock().take() {
            v.generator.abort();
            debug!("Loopback getrennt");
        }
        Ok(())
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> TransportResult<()> {
        self.mikrofon.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn publish_data(&self, payload: Bytes, _reliable: bool) -> TransportResult<()> {
        self.sender()?
            .send(TransportEvent::DataReceived {
                payload,
                sender: Some(ParticipantIdentity::new(AGENT)),
            })
            .map_err(|e| TransportError::Senden(e.to_string()))
    }

    async fn stats(&self) -> TransportResult<RawStats> {
        let seit = self
            .verbindung
            .lock()
            .as_ref()
            .map(|v| v.seit)
            .ok_or(TransportError::NichtVerbunden)?;
        let sekunden = seit.elapsed().as_secs_f64();

        // Latenz pendelt zwischen 20 und 70 ms, alle 10 s ein Verlust-Spike
        let latency = 45.0 + 25.0 * (sekunden / 4.0).sin();
        let loss = if (sekunden as u64) % 10 == 9 { 4.0 } else { 0.02 };
        Ok(RawStats {
            latency_ms: Some(latency),
            packet_loss_pct: Some(loss),
            jitter_ms: Some(latency / 10.0),
            bandwidth_bytes_per_sec: Some(4_000.0),
            bytes_sent: (sekunden * 4_000.0) as u64,
            bytes_received: (sekunden * 4_200.0) as u64,
            packets_lost: (sekunden / 10.0) as u64,
        })
    }

    fn register_rpc_method(&self, name: &str, handler: RpcHandler) -> TransportResult<()> {
        self.rpc.lock().insert(name.to_string(), handler);
        Ok(())
    }

    fn unregister_rpc_method(&self, name: &str) {
        self.rpc.lock().remove(name);
    }
}
