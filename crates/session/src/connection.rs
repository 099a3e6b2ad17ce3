//! Connection-Manager – Lebenszyklus einer Session
//!
//! Zustandsmaschine:
//! ```text
//! Idle → Connecting → Connected ⇄ Paused
//!                       ⇅
//!                  Reconnecting
//! (jeder aktive Zustand) → Ended
//! ```
//! Ein fehlgeschlagener Aufbau fuehrt zurueck nach `Idle`. Zustandswechsel
//! werden als `ConnectionStateChanged` gemeldet; den Wechsel nach `Ended`
//! meldet die Session erst nach dem Aufraeumen.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use voxlink_core::types::{ConnectionState, SessionId};
use voxlink_core::{ErrorSource, EventEmitter, Result, SessionEvent, VoxError};

use crate::transport::{Transport, TransportEventSender};

/// Eine Session (ein Anruf)
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub state: ConnectionState,
    pub started_at: DateTime<Utc>,
    pub paused: bool,
    pub user_initiated_end: bool,
}

#[derive(Default)]
struct Zustand {
    session: Option<Session>,
    /// Bricht einen laufenden `verbinden` ab
    abbruch: Option<oneshot::Sender<()>>,
}

/// Verwaltet den Verbindungszustand und vermittelt Transport-Aufrufe
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    events: Arc<EventEmitter>,
    zustand: Mutex<Zustand>,
}

impl ConnectionManager {
    pub fn neu(transport: Arc<dyn Transport>, events: Arc<EventEmitter>) -> Self {
        Self {
            transport,
            events,
            zustand: Mutex::new(Zustand::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Abfragen
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.zustand
            .lock()
            .session
            .as_ref()
            .map_or(ConnectionState::Idle, |s| s.state)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Paused
        )
    }

    pub fn is_paused(&self) -> bool {
        self.state() == ConnectionState::Paused
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.zustand.lock().session.as_ref().map(|s| s.id)
    }

    pub fn session(&self) -> Option<Session> {
        self.zustand.lock().session.clone()
    }

    // -----------------------------------------------------------------------
    // Aufbau
    // -----------------------------------------------------------------------

    /// Legt eine neue Session im Zustand `Connecting` an
    ///
    /// Schlaegt fehl, solange eine andere Session lebt.
    pub fn beginnen(&self) -> Result<SessionId> {
        let id = {
            let mut z = self.zustand.lock();
            if z.session.as_ref().is_some_and(|s| s.state.ist_aktiv()) {
                return Err(VoxError::BereitsAktiv);
            }
            let session = Session {
                id: SessionId::new(),
                state: ConnectionState::Connecting,
                started_at: Utc::now(),
                paused: false,
                user_initiated_end: false,
            };
            let id = session.id;
            z.session = Some(session);
            id
        };
        info!(session = %id, "Verbindungsaufbau gestartet");
        self.zustand_melden(ConnectionState::Connecting);
        Ok(id)
    }

    /// Delegiert den Aufbau an den Transport
    ///
    /// Kein automatischer Wiederholversuch. Wird waehrenddessen `beenden`
    /// aufgerufen, endet der Aufbau mit [`VoxError::Abgebrochen`].
    pub async fn verbinden(
        &self,
        url: &str,
        token: &str,
        events: TransportEventSender,
    ) -> Result<()> {
        let (abbruch_tx, abbruch_rx) = oneshot::channel();
        let id = {
            let mut z = self.zustand.lock();
            match z.session.as_ref() {
                Some(s) if s.state == ConnectionState::Connecting => {
                    let id = s.id;
                    z.abbruch = Some(abbruch_tx);
                    id
                }
                _ => return Err(VoxError::Abgebrochen),
            }
        };

        let ergebnis = tokio::select! {
            r = self.transport.connect(url, token, events) => Some(r),
            _ = abbruch_rx => None,
        };

        let Some(ergebnis) = ergebnis else {
            info!(session = %id, "Verbindungsaufbau abgebrochen");
            return Err(VoxError::Abgebrochen);
        };

        let mut z = self.zustand.lock();
        z.abbruch = None;
        let noch_aktuell = z
            .session
            .as_ref()
            .is_some_and(|s| s.id == id && s.state == ConnectionState::Connecting);

        match ergebnis {
            Ok(()) if noch_aktuell => {
                if let Some(s) = z.session.as_mut() {
                    s.state = ConnectionState::Connected;
                }
                drop(z);
                info!(session = %id, "Verbunden");
                self.zustand_melden(ConnectionState::Connected);
                Ok(())
            }
            Ok(()) => Err(VoxError::Abgebrochen),
            Err(e) => {
                if noch_aktuell {
                    z.session = None;
                }
                drop(z);
                warn!(session = %id, fehler = %e, "Verbindungsaufbau fehlgeschlagen");
                self.events
                    .fehler(ErrorSource::Transport, format!("Verbindung fehlgeschlagen: {}", e));
                if noch_aktuell {
                    self.zustand_melden(ConnectionState::Idle);
                }
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pause / Fortsetzen
    // -----------------------------------------------------------------------

    /// Deaktiviert das Mikrofon ueber den Transport, die Verbindung bleibt offen
    ///
    /// Gibt `false` zurueck, wenn die Session bereits pausiert war.
    pub async fn pausieren(&self) -> Result<bool> {
        match self.state() {
            ConnectionState::Paused => return Ok(false),
            ConnectionState::Connected => {}
            zustand => {
                return Err(VoxError::UngueltigerZustand {
                    operation: "pause",
                    zustand,
                })
            }
        }

        if let Err(e) = self.transport.set_microphone_enabled(false).await {
            warn!(fehler = %e, "Pause fehlgeschlagen, Zustand bleibt");
            self.events
                .fehler(ErrorSource::Transport, format!("Pause fehlgeschlagen: {}", e));
            return Err(e.into());
        }

        if self.wechseln(ConnectionState::Connected, ConnectionState::Paused) {
            info!("Session pausiert");
            Ok(true)
        } else {
            Err(VoxError::Abgebrochen)
        }
    }

    /// Aktiviert das Mikrofon wieder (sofern `mikrofon_an`)
    ///
    /// Gibt `false` zurueck, wenn die Session nicht pausiert war.
    pub async fn fortsetzen(&self, mikrofon_an: bool) -> Result<bool> {
        match self.state() {
            ConnectionState::Connected => return Ok(false),
            ConnectionState::Paused => {}
            zustand => {
                return Err(VoxError::UngueltigerZustand {
                    operation: "resume",
                    zustand,
                })
            }
        }

        if let Err(e) = self.transport.set_microphone_enabled(mikrofon_an).await {
            warn!(fehler = %e, "Fortsetzen fehlgeschlagen, Zustand bleibt");
            self.events
                .fehler(ErrorSource::Transport, format!("Fortsetzen fehlgeschlagen: {}", e));
            return Err(e.into());
        }

        if self.wechseln(ConnectionState::Paused, ConnectionState::Connected) {
            info!("Session fortgesetzt");
            Ok(true)
        } else {
            Err(VoxError::Abgebrochen)
        }
    }

    // -----------------------------------------------------------------------
    // Reconnect
    // -----------------------------------------------------------------------

    /// Transport versucht die Verbindung wiederherzustellen
    pub fn reconnecting(&self) -> bool {
        let gewechselt = {
            let mut z = self.zustand.lock();
            match z.session.as_mut() {
                Some(s) if matches!(s.state, ConnectionState::Connected | ConnectionState::Paused) => {
                    s.paused = s.state == ConnectionState::Paused;
                    s.state = ConnectionState::Reconnecting;
                    true
                }
                _ => false,
            }
        };
        if gewechselt {
            self.zustand_melden(ConnectionState::Reconnecting);
        }
        gewechselt
    }

    /// Verbindung wiederhergestellt; eine vorherige Pause bleibt bestehen
    pub fn reconnected(&self) -> bool {
        let neu = {
            let mut z = self.zustand.lock();
            match z.session.as_mut() {
                Some(s) if s.state == ConnectionState::Reconnecting => {
                    s.state = if s.paused {
                        ConnectionState::Paused
                    } else {
                        ConnectionState::Connected
                    };
                    Some(s.state)
                }
                _ => None,
            }
        };
        if let Some(state) = neu {
            self.zustand_melden(state);
        }
        neu.is_some()
    }

    // -----------------------------------------------------------------------
    // Ende
    // -----------------------------------------------------------------------

    /// Markiert die Session als beendet
    ///
    /// Bricht einen laufenden Aufbau ab. Gibt `false` zurueck, wenn keine
    /// aktive Session existiert (wiederholtes Beenden). Meldet den
    /// Zustandswechsel nicht.
    pub fn beenden(&self, user_initiated: bool) -> bool {
        let mut z = self.zustand.lock();
        let Some(session) = z.session.as_mut().filter(|s| s.state.ist_aktiv()) else {
            return false;
        };
        session.state = ConnectionState::Ended;
        session.user_initiated_end = user_initiated;
        debug!(session = %session.id, user_initiated, "Session beendet");

        if let Some(abbruch) = z.abbruch.take() {
            let _ = abbruch.send(());
        }
        true
    }

    /// Meldet einen Zustandswechsel an die Listener
    pub fn zustand_melden(&self, state: ConnectionState) {
        self.events
            .emit(SessionEvent::ConnectionStateChanged { state });
    }

    fn wechseln(&self, von: ConnectionState, nach: ConnectionState) -> bool {
        let gewechselt = {
            let mut z = self.zustand.lock();
            match z.session.as_mut() {
                Some(s) if s.state == von => {
                    s.state = nach;
                    s.paused = nach == ConnectionState::Paused;
                    true
                }
                _ => false,
            }
        };
        if gewechselt {
            self.zustand_melden(nach);
        }
        gewechselt
    }
}
