//! voxlink Demo
//!
//! Faehrt eine komplette Session gegen den Loopback-Transport und den
//! Headless-Audio-Backend: Verbinden, Tool-Aufruf, Datennachricht,
//! Analytics-Ticks, Trennen. Konfiguration wie bei einer eingebetteten
//! Engine aus TOML, Log-Ausgabe ueber tracing.

mod loopback;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use voxlink_audio::{CaptureChunk, HeadlessBackend};
use voxlink_core::{EventKind, SessionEvent};
use voxlink_observability::logging_initialisieren;
use voxlink_session::{EngineConfig, ToolDefinition, VoiceSession};

use loopback::LoopbackTransport;

const STANDARD_SEKUNDEN: u64 = 5;

fn chunk_protokollieren(zaehler: &AtomicUsize, chunk: &CaptureChunk) {
    let groesse = chunk.data.len();
    zaehler.fetch_add(groesse, Ordering::Relaxed);
    tracing::debug!(
        track = %chunk.track_id,
        quelle = ?chunk.source,
        groesse,
        "Capture-Chunk"
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_pfad =
        std::env::var("VOXLINK_CONFIG").unwrap_or_else(|_| "voxlink.toml".to_string());
    let config = EngineConfig::laden(&config_pfad)?;

    logging_initialisieren(&config.logging.level, &config.logging.format)?;

    let sekunden = match std::env::var("VOXLINK_DEMO_SEKUNDEN") {
        Ok(wert) => wert
            .parse::<u64>()
            .with_context(|| format!("VOXLINK_DEMO_SEKUNDEN ungueltig: '{}'", wert))?,
        Err(_) => STANDARD_SEKUNDEN,
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_pfad,
        sekunden,
        "voxlink Demo wird gestartet"
    );

    let deklarative_capture = config.audio_capture.enabled;
    let transport = Arc::new(LoopbackTransport::neu());
    let samples = Arc::new(AtomicUsize::new(0));

    let zaehler = Arc::clone(&samples);
    let session = VoiceSession::neu(
        config,
        transport.clone(),
        Arc::new(HeadlessBackend::neu()),
    )
    .with_capture_callback(move |chunk| chunk_protokollieren(&zaehler, &chunk));

    session.on(EventKind::AnalyticsUpdated, |event| {
        if let SessionEvent::AnalyticsUpdated { snapshot } = event {
            tracing::info!(
                qualitaet = ?snapshot.connection.quality,
                latenz_ms = ?snapshot.connection.latency_ms,
                agent_pegel = snapshot.audio.agent.level,
                nutzer_pegel = snapshot.audio.user.level,
                teilnehmer = snapshot.participants.len(),
                tracks = snapshot.tracks.total,
                "Analytics"
            );
        }
    });
    session.on(EventKind::ConnectionQualityChanged, |event| {
        tracing::info!(?event, "Verbindungsqualitaet geaendert");
    });
    session.on(EventKind::Custom, |event| {
        if let SessionEvent::Custom {
            event_type,
            payload,
            ..
        } = event
        {
            tracing::info!(%event_type, %payload, "Nachricht empfangen");
        }
    });
    session.on(EventKind::Error, |event| {
        tracing::warn!(?event, "Fehler gemeldet");
    });

    session.register_tools(vec![
        ToolDefinition::neu("uhrzeit", |_| async {
            Ok::<_, String>(json!(Utc::now().to_rfc3339()))
        }),
        ToolDefinition::neu("summe", |args: Vec<Value>| async move {
            let summe: f64 = args.iter().filter_map(Value::as_f64).sum();
            Ok::<_, String>(json!(summe))
        }),
    ]);

    if !deklarative_capture {
        let zaehler = Arc::clone(&samples);
        session
            .enable_simple_audio_capture(move |chunk| chunk_protokollieren(&zaehler, &chunk))?;
    }

    let session_id = session.connect("demo-token").await?;
    tracing::info!(%session_id, "Session verbunden");

    // Der Agent ruft die Tools wie ein entfernter Teilnehmer auf
    if let Some(antwort) = transport.rpc_aufrufen("uhrzeit", None).await {
        tracing::info!(%antwort, "Tool 'uhrzeit'");
    }
    if let Some(antwort) = transport
        .rpc_aufrufen("summe", Some(r#"{"a": 2, "b": 3.5}"#))
        .await
    {
        tracing::info!(%antwort, "Tool 'summe'");
    }

    session
        .send_message(&json!({ "type": "demo", "text": "hallo agent" }))
        .await?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(sekunden)) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Abbruch angefordert");
        }
    }

    session.disconnect().await?;

    if let Some(analytics) = session.call_analytics() {
        tracing::info!(
            dauer_ms = analytics.duration_ms,
            bytes_empfangen = analytics.stats.bytes_received,
            pegel_samples = analytics.stats.audio_levels.len(),
            agent_sprechzeit_ms = analytics.audio.agent.speaking_time_ms,
            "Session beendet"
        );
        println!("{}", serde_json::to_string_pretty(&analytics)?);
    }
    tracing::info!(
        capture_samples = samples.load(Ordering::Relaxed),
        "voxlink Demo beendet"
    );

    Ok(())
}
