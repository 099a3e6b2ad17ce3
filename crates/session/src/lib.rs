//! voxlink-session – Voice-Session-Engine
//!
//! Fassade [`VoiceSession`] ueber:
//! - [`connection`] – Lebenszyklus und Zustandsmaschine
//! - [`analytics`] – sekuendliche Verbindungs- und Audio-Metriken
//! - [`tools`] – per RPC aufrufbare Client-Funktionen
//! - [`message`] – Anwendungsnachrichten ueber den Datenkanal
//!
//! Die Medienverbindung selbst liefert ein Adapter hinter dem
//! [`Transport`]-Trait.

pub mod analytics;
pub mod config;
pub mod connection;
pub mod message;
pub mod quality;
pub mod session;
pub mod tools;
pub mod transport;

pub use analytics::{AnalyticsEngine, AudioQuelle, TICK_INTERVALL};
pub use config::{AnalyticsEinstellungen, AudioEinstellungen, EngineConfig, LoggingEinstellungen};
pub use connection::{ConnectionManager, Session};
pub use quality::klassifizieren;
pub use session::VoiceSession;
pub use tools::{ToolDefinition, ToolHandler, ToolRegistry};
pub use transport::{
    RawStats, RpcFuture, RpcHandler, RpcInvocation, Transport, TransportError, TransportEvent,
    TransportEventSender, TransportResult,
};
