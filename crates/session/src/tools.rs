//! Tool-Registry – Client-Funktionen, die der Agent per RPC aufruft
//!
//! Jede Registrierung ersetzt den vorherigen Satz vollstaendig. Ein Aufruf
//! liefert immer einen Antwort-String; Fehler und Panics des Handlers werden
//! als `{"error": ...}` serialisiert und nie weitergereicht.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use voxlink_core::event::panic_nachricht;
use voxlink_core::{ErrorSource, EventEmitter};

use crate::transport::{RpcFuture, RpcHandler, RpcInvocation, Transport};

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Handler eines Tools; erhaelt die Argumente positionsweise
pub type ToolHandler = Arc<dyn Fn(Vec<Value>) -> ToolFuture + Send + Sync>;

/// Ein registrierbares Tool
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub handler: ToolHandler,
}

impl ToolDefinition {
    pub fn neu<F, Fut, E>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display,
    {
        let handler: ToolHandler = Arc::new(move |args: Vec<Value>| -> ToolFuture {
            let fut = handler(args);
            Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
        });
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ToolRegistry {
    transport: Option<Arc<dyn Transport>>,
    events: Arc<EventEmitter>,
    tools: DashMap<String, ToolHandler>,
    /// Beim Transport registrierte Namen, in Registrierungsreihenfolge
    registriert: Mutex<Vec<String>>,
}

impl ToolRegistry {
    pub fn neu(transport: Option<Arc<dyn Transport>>, events: Arc<EventEmitter>) -> Self {
        Self {
            transport,
            events,
            tools: DashMap::new(),
            registriert: Mutex::new(Vec::new()),
        }
    }

    /// Ersetzt alle Tools; gibt die Anzahl registrierter Tools zurueck
    pub fn registrieren(&self, definitionen: Vec<ToolDefinition>) -> usize {
        let Some(transport) = self.transport.as_ref() else {
            debug!("Kein Transport, Tool-Registrierung uebersprungen");
            return 0;
        };

        let mut registriert = self.registriert.lock();
        for alt in registriert.drain(..) {
            transport.unregister_rpc_method(&alt);
        }
        self.tools.clear();

        for def in definitionen {
            let name = def.name.as_str();
            if name.trim().is_empty() {
                warn!("Tool ohne Namen uebersprungen");
                continue;
            }
            // Die Gegenseite ruft exakt den deklarierten Namen auf
            if name.trim() != name {
                warn!(tool = ?name, "Tool-Name mit Leerraum am Rand uebersprungen");
                continue;
            }
            if self.tools.contains_key(name) {
                warn!(tool = %name, "Doppelter Tool-Name uebersprungen");
                continue;
            }

            let handler = Arc::clone(&def.handler);
            let rpc: RpcHandler = Arc::new(move |aufruf: RpcInvocation| -> RpcFuture {
                let handler = Arc::clone(&handler);
                Box::pin(async move { aufrufen(handler, aufruf.payload.as_deref()).await })
            });

            if let Err(e) = transport.register_rpc_method(name, rpc) {
                warn!(tool = %name, fehler = %e, "RPC-Registrierung fehlgeschlagen");
                self.events.fehler(
                    ErrorSource::Tools,
                    format!("Tool '{}' nicht registriert: {}", name, e),
                );
                continue;
            }
            self.tools.insert(name.to_string(), def.handler);
            registriert.push(name.to_string());
        }

        info!(anzahl = registriert.len(), "Tools registriert");
        registriert.len()
    }

    /// Registrierte Namen in Registrierungsreihenfolge
    pub fn namen(&self) -> Vec<String> {
        self.registriert.lock().clone()
    }

    /// Fuehrt ein Tool lokal aus (gleiches Protokoll wie ein RPC-Aufruf)
    pub async fn ausfuehren(&self, name: &str, payload: Option<&str>) -> Option<String> {
        let handler = self.tools.get(name).map(|h| Arc::clone(h.value()))?;
        Some(aufrufen(handler, payload).await)
    }
}

// ---------------------------------------------------------------------------
// Aufruf
// ---------------------------------------------------------------------------

/// Zerlegt die Nutzlast in Argumente, ruft den Handler und serialisiert
/// das Ergebnis
pub async fn aufrufen(handler: ToolHandler, payload: Option<&str>) -> String {
    let args = match argumente(payload) {
        Ok(args) => args,
        Err(e) => return fehler_antwort(format!("Invalid JSON payload: {}", e)),
    };

    // Eigener Task, damit ein Panic im Handler als JoinError ankommt
    let ergebnis = tokio::spawn(async move { handler(args).await }).await;
    match ergebnis {
        Ok(Ok(wert)) => wert.to_string(),
        Ok(Err(meldung)) => {
            debug!(fehler = %meldung, "Tool-Handler meldet Fehler");
            fehler_antwort(meldung)
        }
        Err(e) if e.is_panic() => {
            let meldung = panic_nachricht(e.into_panic().as_ref());
            warn!(panic = %meldung, "Tool-Handler in Panic");
            fehler_antwort(meldung)
        }
        Err(e) => fehler_antwort(e.to_string()),
    }
}

/// Objekt → Werte in Deklarationsreihenfolge, Array → Elemente, Skalar → ein Argument
fn argumente(payload: Option<&str>) -> Result<Vec<Value>, serde_json::Error> {
    let Some(text) = payload.filter(|p| !p.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    Ok(match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        Value::Array(werte) => werte,
        skalar => vec![skalar],
    })
}

fn fehler_antwort(meldung: impl Into<String>) -> String {
    json!({ "error": meldung.into() }).to_string()
}
