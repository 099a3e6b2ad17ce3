//! # voxlink-observability
//!
//! Structured Logging (Text oder JSON) via tracing-subscriber fuer
//! Engine und Kommandozeile.

pub mod logging;

pub use logging::{logging_initialisieren, LogFormat, LoggingFehler};
