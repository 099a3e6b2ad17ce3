//! Anwendungsnachrichten ueber den Datenkanal
//!
//! Eingehend: JSON-Objekte mit String-Feld `type` werden zu
//! `Custom`-Events dieses Typs, jedes andere gueltige JSON zu `Custom`
//! mit Typ `"message"`. Nicht dekodierbare Nachrichten werden als
//! `Error` (Quelle `Message`) gemeldet.

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use voxlink_core::event::MessageMetadata;
use voxlink_core::types::ParticipantIdentity;
use voxlink_core::{ErrorSource, Result, SessionEvent};

/// Event-Typ fuer Nachrichten ohne eigenes `type`-Feld
pub const STANDARD_TYP: &str = "message";

/// Wandelt eine eingehende Datennachricht in ein Session-Event
pub fn dekodieren(payload: &[u8], sender: Option<ParticipantIdentity>) -> SessionEvent {
    let raw = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            return SessionEvent::fehler(
                ErrorSource::Message,
                format!("Nachricht ist kein UTF-8: {}", e),
            )
        }
    };

    let wert: Value = match serde_json::from_str(raw) {
        Ok(wert) => wert,
        Err(e) => {
            return SessionEvent::fehler(
                ErrorSource::Message,
                format!("Nachricht ist kein JSON: {}", e),
            )
        }
    };

    let event_type = wert
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(STANDARD_TYP)
        .to_string();

    SessionEvent::Custom {
        event_type,
        payload: wert,
        metadata: MessageMetadata {
            timestamp: Utc::now(),
            sender,
            raw: raw.to_string(),
        },
    }
}

/// Serialisiert eine ausgehende Nachricht
pub fn kodieren(wert: &Value) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(wert)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typ_aus_nachricht() {
        let event = dekodieren(
            br#"{"type":"transcript","text":"hallo"}"#,
            Some(ParticipantIdentity::new("agent")),
        );
        let SessionEvent::Custom {
            event_type,
            payload,
            metadata,
        } = event
        else {
            panic!("Custom erwartet");
        };
        assert_eq!(event_type, "transcript");
        assert_eq!(payload["text"], "hallo");
        assert_eq!(metadata.sender, Some(ParticipantIdentity::new("agent")));
        assert_eq!(metadata.raw, r#"{"type":"transcript","text":"hallo"}"#);
    }

    #[test]
    fn ohne_typ_wird_message() {
        let rohe: [&[u8]; 3] = [b"[1,2]", b"{\"type\":5}", b"\"text\""];
        for roh in rohe {
            match dekodieren(roh, None) {
                SessionEvent::Custom { event_type, .. } => assert_eq!(event_type, STANDARD_TYP),
                andere => panic!("unerwartet: {:?}", andere),
            }
        }
    }

    #[test]
    fn kaputte_nachricht_wird_fehler() {
        let rohe: [&[u8]; 2] = [b"{nicht json", &[0xff, 0xfe]];
        for roh in rohe {
            assert!(matches!(
                dekodieren(roh, None),
                SessionEvent::Error {
                    source: ErrorSource::Message,
                    ..
                }
            ));
        }
    }

    #[test]
    fn kodieren_liefert_json() {
        let bytes = kodieren(&json!({"type": "ping"})).unwrap();
        assert_eq!(&bytes[..], br#"{"type":"ping"}"#);
    }
}
