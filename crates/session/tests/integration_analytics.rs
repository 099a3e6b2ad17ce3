//! Integration-Tests fuer Analytics und Qualitaetseinstufung

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{anzahl, events_sammeln, remote_track, warten_bis, MockTransport, ProtokollBackend};
use voxlink_audio::AudioFrame;
use voxlink_core::types::{ConnectionQuality, ParticipantIdentity};
use voxlink_core::{ErrorSource, EventKind, SessionEvent};
use voxlink_session::{EngineConfig, RawStats, TransportEvent, VoiceSession};

fn qualitaeten(
    events: &parking_lot::Mutex<Vec<SessionEvent>>,
) -> Vec<(ConnectionQuality, Option<ParticipantIdentity>)> {
    events
        .lock()
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ConnectionQualityChanged {
                quality,
                participant,
            } => Some((*quality, participant.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn schnappschuss_vor_waehrend_und_nach_der_session() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let session = VoiceSession::neu(EngineConfig::default(), transport.clone(), backend);
    let events = events_sammeln(&session);

    assert!(session.connection_stats().is_none());
    assert!(session.audio_levels().is_none());
    assert!(session.performance_metrics().is_none());
    assert!(session.call_analytics().is_none());
    assert!(session.track_stats().is_none());
    assert!(session.participants().is_empty());

    transport.stats_setzen(RawStats {
        latency_ms: Some(80.0),
        packet_loss_pct: Some(0.0),
        bytes_sent: 1_000,
        bytes_received: 4_000,
        ..Default::default()
    });
    session.connect("token").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(anzahl(&events, EventKind::AnalyticsUpdated), 1);
    let stats = session.connection_stats().unwrap();
    assert_eq!(stats.latency_ms, Some(80.0));
    assert_eq!(stats.quality, ConnectionQuality::Good);
    assert!(session.audio_levels().is_some());
    assert_eq!(session.track_stats().unwrap().total, 0);
    let performance = session.performance_metrics().unwrap();
    assert_eq!(performance.bytes_received, 4_000);
    assert_eq!(performance.average_latency_ms, Some(80.0));

    session.disconnect().await.unwrap();

    assert!(session.connection_stats().is_none());
    assert!(session.audio_levels().is_none());
    assert!(session.track_stats().is_none());
    assert!(session.participants().is_empty());

    let eingefroren = session.performance_metrics().unwrap();
    assert_eq!(eingefroren.bytes_sent, 1_000);
    let analytics = session.call_analytics().unwrap();
    assert!(analytics.ended_at.is_some());
    assert!(analytics.user_initiated_end);

    // Nach dem Ende kommen keine Ticks mehr
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(anzahl(&events, EventKind::AnalyticsUpdated), 1);
    assert_eq!(
        session.call_analytics().unwrap().duration_ms,
        analytics.duration_ms
    );
}

fn analytics_fehler(events: &parking_lot::Mutex<Vec<SessionEvent>>) -> usize {
    events
        .lock()
        .iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::Error {
                    source: ErrorSource::Analytics,
                    ..
                }
            )
        })
        .count()
}

#[tokio::test(start_paused = true)]
async fn trennen_waehrend_statistik_abfrage() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let session = VoiceSession::neu(EngineConfig::default(), transport.clone(), backend);
    let events = events_sammeln(&session);

    transport.stats_setzen(RawStats {
        latency_ms: Some(400.0),
        bytes_received: 4_000,
        ..Default::default()
    });
    let sperre = transport.stats_anhalten();

    session.connect("token").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(transport.stats_aufrufe.load(Ordering::SeqCst), 1);
    assert_eq!(anzahl(&events, EventKind::AnalyticsUpdated), 0);

    session.disconnect().await.unwrap();
    let eingefroren = session.call_analytics().unwrap();

    sperre.notify_waiters();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(anzahl(&events, EventKind::AnalyticsUpdated), 0);
    assert_eq!(anzahl(&events, EventKind::ConnectionQualityChanged), 0);
    let danach = session.call_analytics().unwrap();
    assert_eq!(danach, eingefroren);
    assert_eq!(danach.stats.bytes_received, 0);
    assert!(danach.stats.audio_levels.is_empty());
}

#[tokio::test(start_paused = true)]
async fn gestoerte_statistik_wird_einmal_gemeldet() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let session = VoiceSession::neu(EngineConfig::default(), transport.clone(), backend);
    let events = events_sammeln(&session);

    transport.stats_fehler.store(true, Ordering::SeqCst);
    session.connect("token").await.unwrap();
    tokio::time::sleep(Duration::from_millis(3_100)).await;

    // Pegel laufen weiter, der Fehler kommt nur einmal
    assert_eq!(anzahl(&events, EventKind::AnalyticsUpdated), 3);
    assert_eq!(analytics_fehler(&events), 1);

    transport.stats_fehler.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    transport.stats_fehler.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(analytics_fehler(&events), 2);
}

#[tokio::test]
async fn verbindungsversuche_ueber_fehlschlag_hinweg() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let session = VoiceSession::neu(EngineConfig::default(), transport.clone(), backend);

    *transport.connect_fehler.lock() = Some("Raum voll".into());
    assert!(session.connect("token").await.is_err());
    *transport.connect_fehler.lock() = None;
    session.connect("token").await.unwrap();

    assert_eq!(session.performance_metrics().unwrap().connection_attempts, 2);
    assert_eq!(session.call_analytics().unwrap().stats.connection_attempts, 2);

    // Nach einer zustande gekommenen Session beginnt die Zaehlung neu
    session.disconnect().await.unwrap();
    session.connect("token").await.unwrap();
    assert_eq!(session.performance_metrics().unwrap().connection_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn beide_pfade_stufen_gleich_ein() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let session = VoiceSession::neu(EngineConfig::default(), transport.clone(), backend);
    let events = events_sammeln(&session);

    transport.stats_setzen(RawStats {
        latency_ms: Some(45.0),
        packet_loss_pct: Some(0.1),
        ..Default::default()
    });
    session.connect("token").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(qualitaeten(&events), vec![(ConnectionQuality::Good, None)]);

    // Der Adapter meldet "excellent", gemessen ist aber "good"
    let agent = ParticipantIdentity::new("agent");
    transport.senden(TransportEvent::ConnectionQualityChanged {
        participant: agent.clone(),
        quality: ConnectionQuality::Excellent,
    });
    warten_bis(|| qualitaeten(&events).len() == 2).await;
    assert_eq!(
        qualitaeten(&events)[1],
        (ConnectionQuality::Good, Some(agent))
    );

    // Unveraenderte Qualitaet wird vom Tick nicht erneut gemeldet
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(qualitaeten(&events).len(), 2);

    transport.stats_setzen(RawStats {
        latency_ms: Some(45.0),
        packet_loss_pct: Some(50.0),
        ..Default::default()
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(qualitaeten(&events)[2], (ConnectionQuality::Lost, None));
    assert_eq!(
        session.connection_stats().unwrap().quality,
        ConnectionQuality::Lost
    );
}

#[tokio::test]
async fn adaptermeldung_ohne_messwert_wird_uebernommen() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let session = VoiceSession::neu(EngineConfig::default(), transport.clone(), backend);
    let events = events_sammeln(&session);

    session.connect("token").await.unwrap();
    transport.senden(TransportEvent::ConnectionQualityChanged {
        participant: ParticipantIdentity::new("agent"),
        quality: ConnectionQuality::Poor,
    });
    warten_bis(|| !qualitaeten(&events).is_empty()).await;
    assert_eq!(qualitaeten(&events)[0].0, ConnectionQuality::Poor);
    assert_eq!(
        session.connection_stats().unwrap().quality,
        ConnectionQuality::Poor
    );
}

#[tokio::test(start_paused = true)]
async fn sprechzeit_des_agenten() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let session = VoiceSession::neu(EngineConfig::default(), transport.clone(), backend);

    session.connect("token").await.unwrap();
    transport.senden(TransportEvent::TrackSubscribed(remote_track("agent-audio")));
    transport.senden(TransportEvent::AudioFrame(AudioFrame {
        track_id: remote_track("agent-audio").id,
        samples: vec![0.5; 480],
        sample_rate: 48_000,
    }));
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let audio = session.audio_levels().unwrap();
    assert!(audio.agent.level > 0.4);
    assert!(audio.agent.speaking_time_ms >= 1_000);
    assert_eq!(audio.user.speaking_time_ms, 0);
    assert!(audio.user.echo_cancellation);
    assert_eq!(session.call_analytics().unwrap().stats.track_count, 1);
}

#[tokio::test(start_paused = true)]
async fn sampling_abschaltbar() {
    let transport = MockTransport::neu();
    let backend = ProtokollBackend::neu();
    let mut config = EngineConfig::default();
    config.analytics.enabled = false;
    let session = VoiceSession::neu(config, transport.clone(), backend);
    let events = events_sammeln(&session);

    session.connect("token").await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(anzahl(&events, EventKind::AnalyticsUpdated), 0);
    assert!(session.connection_stats().is_some());
}
