//! Session-Events und Listener-Verteilung
//!
//! Jede Benachrichtigung der Engine ist ein [`SessionEvent`]. Der
//! [`EventEmitter`] haelt pro [`EventKind`] eine explizite Listener-Liste;
//! jeder Listener-Aufruf ist einzeln gegen Panics abgesichert, sodass ein
//! fehlerhafter Listener die Zustellung an die uebrigen nicht verhindert.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::metrics::{AnalyticsSnapshot, Participant, TrackRecord};
use crate::types::{ConnectionQuality, ConnectionState, ParticipantIdentity, SessionId, TrackId};

/// Grund fuer das Ende einer Session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Lokal ueber `disconnect()` beendet
    UserInitiated,
    /// Vom Transport gemeldetes Ende
    Remote(String),
}

/// Herkunft einer Fehlermeldung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    Transport,
    Audio,
    Capture,
    Tools,
    Analytics,
    Message,
}

/// Metadaten einer eingehenden Anwendungsnachricht
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub timestamp: DateTime<Utc>,
    pub sender: Option<ParticipantIdentity>,
    /// Unveraenderte Rohnachricht
    pub raw: String,
}

/// Alle Benachrichtigungen, die eine Session ausstrahlt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected {
        session_id: SessionId,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    /// Gegenseite gibt Audio wieder
    Speaking {
        track_id: TrackId,
    },
    /// Wiedergabe der Gegenseite pausiert oder beendet
    Listening {
        track_id: TrackId,
    },
    TrackSubscribed {
        track: TrackRecord,
    },
    TrackUnsubscribed {
        track_id: TrackId,
    },
    ParticipantConnected {
        participant: Participant,
    },
    ParticipantDisconnected {
        identity: ParticipantIdentity,
    },
    ConnectionQualityChanged {
        quality: ConnectionQuality,
        participant: Option<ParticipantIdentity>,
    },
    ConnectionStateChanged {
        state: ConnectionState,
    },
    Reconnecting,
    Reconnected,
    AnalyticsUpdated {
        snapshot: Box<AnalyticsSnapshot>,
    },
    /// Anwendungsdefiniertes Event aus einer Datennachricht
    Custom {
        event_type: String,
        payload: serde_json::Value,
        metadata: MessageMetadata,
    },
    Error {
        source: ErrorSource,
        message: String,
    },
}

/// Art eines Events (Schluessel der Listener-Listen)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Speaking,
    Listening,
    TrackSubscribed,
    TrackUnsubscribed,
    ParticipantConnected,
    ParticipantDisconnected,
    ConnectionQualityChanged,
    ConnectionStateChanged,
    Reconnecting,
    Reconnected,
    AnalyticsUpdated,
    Custom,
    Error,
}

impl SessionEvent {
    /// Gibt die Event-Art zurueck
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Speaking { .. } => EventKind::Speaking,
            Self::Listening { .. } => EventKind::Listening,
            Self::TrackSubscribed { .. } => EventKind::TrackSubscribed,
            Self::TrackUnsubscribed { .. } => EventKind::TrackUnsubscribed,
            Self::ParticipantConnected { .. } => EventKind::ParticipantConnected,
            Self::ParticipantDisconnected { .. } => EventKind::ParticipantDisconnected,
            Self::ConnectionQualityChanged { .. } => EventKind::ConnectionQualityChanged,
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::Reconnecting => EventKind::Reconnecting,
            Self::Reconnected => EventKind::Reconnected,
            Self::AnalyticsUpdated { .. } => EventKind::AnalyticsUpdated,
            Self::Custom { .. } => EventKind::Custom,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Kurzform fuer ein Fehler-Event
    pub fn fehler(source: ErrorSource, message: impl Into<String>) -> Self {
        Self::Error {
            source,
            message: message.into(),
        }
    }
}

/// Kennung eines registrierten Listeners (fuer `off`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener-Callback
pub type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Verteiler fuer Session-Events
///
/// Listener werden vor dem Aufruf kopiert, das Lock ist waehrend der
/// Zustellung nicht gehalten. Listener duerfen also selbst `on`/`off`
/// aufrufen.
pub struct EventEmitter {
    per_kind: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    any: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    /// Erstellt einen Verteiler ohne Listener
    pub fn neu() -> Self {
        Self {
            per_kind: RwLock::new(HashMap::new()),
            any: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn naechste_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registriert einen Listener fuer eine Event-Art
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.naechste_id();
        self.per_kind
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Registriert einen Listener fuer alle Event-Arten
    pub fn on_any<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.naechste_id();
        self.any.write().push((id, Arc::new(listener)));
        id
    }

    /// Entfernt einen Listener. Gibt false zurueck wenn die ID unbekannt ist.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entfernt = false;
        for liste in self.per_kind.write().values_mut() {
            let vorher = liste.len();
            liste.retain(|(lid, _)| *lid != id);
            entfernt |= liste.len() != vorher;
        }
        let mut any = self.any.write();
        let vorher = any.len();
        any.retain(|(lid, _)| *lid != id);
        entfernt | (any.len() != vorher)
    }

    /// Anzahl Listener, die ein Event dieser Art erreichen wuerde
    pub fn listener_anzahl(&self, kind: EventKind) -> usize {
        let spezifisch = self.per_kind.read().get(&kind).map_or(0, Vec::len);
        spezifisch + self.any.read().len()
    }

    /// Verteilt ein Event an alle passenden Listener
    ///
    /// Gibt die Anzahl erfolgreicher Zustellungen zurueck. Ein Listener, der
    /// paniert, wird protokolliert und uebersprungen.
    pub fn emit(&self, event: SessionEvent) -> usize {
        let kind = event.kind();
        let mut empfaenger: Vec<Listener> = self
            .per_kind
            .read()
            .get(&kind)
            .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();
        empfaenger.extend(self.any.read().iter().map(|(_, f)| Arc::clone(f)));

        if empfaenger.is_empty() {
            if let SessionEvent::Error { source, message } = &event {
                warn!(?source, %message, "Fehler-Event ohne Listener verworfen");
            } else {
                trace!(?kind, "Event ohne Listener");
            }
            return 0;
        }

        let mut zugestellt = 0;
        for listener in empfaenger {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(()) => zugestellt += 1,
                Err(panik) => {
                    warn!(
                        ?kind,
                        grund = %panic_nachricht(panik.as_ref()),
                        "Listener fehlgeschlagen, Zustellung an uebrige geht weiter"
                    );
                }
            }
        }
        zugestellt
    }

    /// Kurzform: Fehler-Event verteilen
    pub fn fehler(&self, source: ErrorSource, message: impl Into<String>) -> usize {
        self.emit(SessionEvent::fehler(source, message))
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::neu()
    }
}

/// Extrahiert die Nachricht aus einer Panic-Payload
pub fn panic_nachricht(panik: &(dyn Any + Send)) -> String {
    if let Some(s) = panik.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panik.downcast_ref::<String>() {
        s.clone()
    } else {
        "unbekannte Panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn event_kind_zuordnung() {
        assert_eq!(SessionEvent::Reconnecting.kind(), EventKind::Reconnecting);
        let e = SessionEvent::fehler(ErrorSource::Audio, "x");
        assert_eq!(e.kind(), EventKind::Error);
    }

    #[test]
    fn listener_nur_fuer_eigene_art() {
        let emitter = EventEmitter::neu();
        let zaehler = Arc::new(AtomicUsize::new(0));
        let z = Arc::clone(&zaehler);
        emitter.on(EventKind::Reconnected, move |_| {
            z.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(SessionEvent::Reconnecting);
        emitter.emit(SessionEvent::Reconnected);
        assert_eq!(zaehler.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panik_im_listener_blockiert_andere_nicht() {
        let emitter = EventEmitter::neu();
        let zaehler = Arc::new(AtomicUsize::new(0));
        emitter.on(EventKind::Reconnecting, |_| panic!("kaputt"));
        let z = Arc::clone(&zaehler);
        emitter.on(EventKind::Reconnecting, move |_| {
            z.fetch_add(1, Ordering::SeqCst);
        });

        let zugestellt = emitter.emit(SessionEvent::Reconnecting);
        assert_eq!(zugestellt, 1);
        assert_eq!(zaehler.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fehler_ohne_listener_wird_verworfen() {
        let emitter = EventEmitter::neu();
        assert_eq!(emitter.fehler(ErrorSource::Transport, "weg"), 0);
    }

    #[test]
    fn off_entfernt_listener() {
        let emitter = EventEmitter::neu();
        let id = emitter.on(EventKind::Speaking, |_| {});
        let any = emitter.on_any(|_| {});
        assert_eq!(emitter.listener_anzahl(EventKind::Speaking), 2);

        assert!(emitter.off(id));
        assert!(emitter.off(any));
        assert!(!emitter.off(id));
        assert_eq!(emitter.listener_anzahl(EventKind::Speaking), 0);
    }

    #[test]
    fn on_any_empfaengt_alles() {
        let emitter = EventEmitter::neu();
        let zaehler = Arc::new(AtomicUsize::new(0));
        let z = Arc::clone(&zaehler);
        emitter.on_any(move |_| {
            z.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(SessionEvent::Reconnecting);
        emitter.emit(SessionEvent::fehler(ErrorSource::Tools, "x"));
        assert_eq!(zaehler.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panic_nachricht_aus_string() {
        let panik = std::panic::catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_nachricht(panik.as_ref()), "boom 1");
    }

    #[test]
    fn event_ist_serde_kompatibel() {
        let event = SessionEvent::ConnectionQualityChanged {
            quality: ConnectionQuality::Poor,
            participant: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("connection_quality_changed"));
        let zurueck: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(zurueck, event);
    }
}
