//! Structured Logging Setup via tracing-subscriber
//!
//! Level und Format kommen aus der Konfiguration und lassen sich per
//! Umgebungsvariable ueberschreiben:
//! - `VOX_LOG_LEVEL`: Filter-Direktive (z.B. `debug` oder
//!   `info,voxlink_session=trace`)
//! - `VOX_LOG_FORMAT`: `text` oder `json`

use std::str::FromStr;

use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

pub const ENV_LEVEL: &str = "VOX_LOG_LEVEL";
pub const ENV_FORMAT: &str = "VOX_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum LoggingFehler {
    #[error("Unbekanntes Log-Format '{0}' (erlaubt: text, json)")]
    UnbekanntesFormat(String),

    #[error("Ungueltiger Log-Filter '{filter}': {grund}")]
    UngueltigerFilter { filter: String, grund: String },

    #[error("Logging bereits initialisiert")]
    BereitsInitialisiert,
}

/// Ausgabeformat der Log-Zeilen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingFehler;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            anderes => Err(LoggingFehler::UnbekanntesFormat(anderes.to_string())),
        }
    }
}

/// Umgebungsvariable schlaegt Konfiguration; leere Werte zaehlen nicht
fn aufloesen(konfiguriert: &str, umgebung: Option<String>) -> String {
    umgebung
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| konfiguriert.to_string())
}

fn filter_bauen(direktive: &str) -> Result<EnvFilter, LoggingFehler> {
    EnvFilter::try_new(direktive).map_err(|e| LoggingFehler::UngueltigerFilter {
        filter: direktive.to_string(),
        grund: e.to_string(),
    })
}

/// Initialisiert den globalen Subscriber
///
/// Darf pro Prozess nur einmal erfolgreich aufgerufen werden.
pub fn logging_initialisieren(level: &str, format: &str) -> Result<LogFormat, LoggingFehler> {
    let level = aufloesen(level, std::env::var(ENV_LEVEL).ok());
    let format: LogFormat = aufloesen(format, std::env::var(ENV_FORMAT).ok()).parse()?;
    let filter = filter_bauen(&level)?;

    let ergebnis = match format {
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(true)
            .try_init(),
        LogFormat::Text => fmt().with_env_filter(filter).with_target(true).try_init(),
    };
    ergebnis.map_err(|_| LoggingFehler::BereitsInitialisiert)?;

    tracing::debug!(%level, ?format, "Logging initialisiert");
    Ok(format)
}
