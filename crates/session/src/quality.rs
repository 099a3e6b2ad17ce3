//! Einstufung der Verbindungsqualitaet
//!
//! Eine Tabelle fuer beide Wege: den periodischen Analytics-Tick und die
//! Qualitaetsmeldung des Adapters. Ausgewertet wird vom schwersten Bucket
//! abwaerts; ein fehlender Messwert wird nicht beruecksichtigt.

use voxlink_core::types::ConnectionQuality;

/// Schwelle fuer einen Bucket (Verlust in %, Latenz in ms)
struct Schwelle {
    quality: ConnectionQuality,
    verlust_pct: f64,
    latenz_ms: f64,
}

const TABELLE: [Schwelle; 3] = [
    Schwelle {
        quality: ConnectionQuality::Lost,
        verlust_pct: 20.0,
        latenz_ms: 1000.0,
    },
    Schwelle {
        quality: ConnectionQuality::Poor,
        verlust_pct: 3.0,
        latenz_ms: 300.0,
    },
    Schwelle {
        quality: ConnectionQuality::Good,
        verlust_pct: 0.05,
        latenz_ms: 40.0,
    },
];

/// Stuft Latenz und Paketverlust ein. Ohne jeden Messwert: `Unknown`.
pub fn klassifizieren(latency_ms: Option<f64>, packet_loss_pct: Option<f64>) -> ConnectionQuality {
    let latenz = latency_ms.filter(|v| v.is_finite());
    let verlust = packet_loss_pct.filter(|v| v.is_finite());
    if latenz.is_none() && verlust.is_none() {
        return ConnectionQuality::Unknown;
    }

    TABELLE
        .iter()
        .find(|s| {
            verlust.is_some_and(|v| v >= s.verlust_pct) || latenz.is_some_and(|l| l >= s.latenz_ms)
        })
        .map(|s| s.quality)
        .unwrap_or(ConnectionQuality::Excellent)
}
