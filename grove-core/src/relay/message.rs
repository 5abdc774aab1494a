//! NIP-01 / NIP-42 wire frames.
//!
//! Every frame is a JSON array whose first element names the message type.
//!
//! | Direction | Frame |
//! |-----------|-------|
//! | client → relay | `["EVENT", event]`, `["REQ", id, filter…]`, `["CLOSE", id]`, `["AUTH", event]` |
//! | relay → client | `["EVENT", id, event]`, `["EOSE", id]`, `["OK", event_id, accepted, message]`, `["NOTICE", message]`, `["CLOSED", id, message]`, `["AUTH", challenge]` |
//!
//! Encoding and decoding go through the `nostr` crate's message types. The
//! frames here carry this crate's [`Event`] and [`Filter`], which keep the
//! canonical form needed for subscription hashing and the verified-event
//! typestate.

use nostr::{EventId, JsonUtil, SubscriptionId};

use crate::nostr::{Event, Filter, NostrError, Result};

/// A frame sent from the client to a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Publish a signed event.
    Event(Event),

    /// Open a subscription.
    Req {
        /// Subscription id.
        subscription_id: String,
        /// Filters combined with OR semantics.
        filters: Vec<Filter>,
    },

    /// Close a subscription.
    Close(String),

    /// Answer an authentication challenge.
    Auth(Event),
}

/// A frame sent from a relay to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// An event matching a subscription. Not yet verified.
    Event {
        /// Subscription id the event belongs to.
        subscription_id: String,
        /// The event as received.
        event: Box<Event>,
    },

    /// End of stored events for a subscription.
    Eose(String),

    /// Acceptance or rejection of a published event.
    Ok {
        /// Id of the event being acknowledged.
        event_id: String,
        /// Whether the relay accepted it.
        accepted: bool,
        /// Human-readable reason, possibly empty.
        message: String,
    },

    /// Human-readable message from the relay.
    Notice(String),

    /// The relay ended a subscription.
    Closed {
        /// Subscription id that was closed.
        subscription_id: String,
        /// Reason given by the relay.
        message: String,
    },

    /// Authentication challenge.
    Auth {
        /// Challenge string to sign.
        challenge: String,
    },
}

impl ClientMessage {
    /// Encodes the frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`NostrError::Encoding`] if an event or filter cannot be
    /// represented on the wire.
    pub fn to_json(&self) -> Result<String> {
        let wire = match self {
            Self::Event(event) => nostr::ClientMessage::event(to_wire_event(event)?),
            Self::Req {
                subscription_id,
                filters,
            } => nostr::ClientMessage::req(
                SubscriptionId::new(subscription_id),
                filters
                    .iter()
                    .map(to_wire_filter)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Self::Close(subscription_id) => {
                nostr::ClientMessage::close(SubscriptionId::new(subscription_id))
            }
            Self::Auth(event) => nostr::ClientMessage::auth(to_wire_event(event)?),
        };
        wire.try_as_json()
            .map_err(|e| NostrError::Encoding(e.to_string()))
    }

    /// Decodes a client frame.
    ///
    /// # Errors
    ///
    /// Returns [`NostrError::Encoding`] for anything that is not a known
    /// client frame.
    pub fn from_json(json: &str) -> Result<Self> {
        let wire = nostr::ClientMessage::from_json(json)
            .map_err(|e| NostrError::Encoding(format!("Malformed client frame: {e}")))?;

        match wire {
            nostr::ClientMessage::Event(event) => Ok(Self::Event(from_wire_event(&event)?)),
            nostr::ClientMessage::Auth(event) => Ok(Self::Auth(from_wire_event(&event)?)),
            nostr::ClientMessage::Close(subscription_id) => {
                Ok(Self::Close(subscription_id.as_str().to_string()))
            }
            nostr::ClientMessage::Req {
                subscription_id,
                filters,
            } => Ok(Self::Req {
                subscription_id: subscription_id.as_str().to_string(),
                filters: filters
                    .iter()
                    .map(|filter| from_wire_filter(filter))
                    .collect::<Result<Vec<_>>>()?,
            }),
            _ => Err(NostrError::Encoding(
                "Unsupported client frame type".to_string(),
            )),
        }
    }
}

impl RelayMessage {
    /// Decodes a relay frame.
    ///
    /// # Errors
    ///
    /// Returns [`NostrError::Encoding`] for malformed JSON, unknown or
    /// unsupported frame types and missing fields.
    pub fn from_json(json: &str) -> Result<Self> {
        let wire = nostr::RelayMessage::from_json(json)
            .map_err(|e| NostrError::Encoding(format!("Malformed relay frame: {e}")))?;

        match wire {
            nostr::RelayMessage::Event {
                subscription_id,
                event,
            } => Ok(Self::Event {
                subscription_id: subscription_id.as_str().to_string(),
                event: Box::new(from_wire_event(&event)?),
            }),
            nostr::RelayMessage::EndOfStoredEvents(subscription_id) => {
                Ok(Self::Eose(subscription_id.as_str().to_string()))
            }
            nostr::RelayMessage::Ok {
                event_id,
                status,
                message,
            } => Ok(Self::Ok {
                event_id: event_id.to_hex(),
                accepted: status,
                message: message.into_owned(),
            }),
            nostr::RelayMessage::Notice(message) => Ok(Self::Notice(message.into_owned())),
            nostr::RelayMessage::Closed {
                subscription_id,
                message,
            } => Ok(Self::Closed {
                subscription_id: subscription_id.as_str().to_string(),
                message: message.into_owned(),
            }),
            nostr::RelayMessage::Auth { challenge } => Ok(Self::Auth {
                challenge: challenge.into_owned(),
            }),
            _ => Err(NostrError::Encoding(
                "Unsupported relay frame type".to_string(),
            )),
        }
    }

    /// Encodes the frame as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`NostrError::Encoding`] if the event payload or the
    /// acknowledged event id cannot be represented on the wire.
    pub fn to_json(&self) -> Result<String> {
        let wire = match self {
            Self::Event {
                subscription_id,
                event,
            } => nostr::RelayMessage::event(
                SubscriptionId::new(subscription_id),
                to_wire_event(event)?,
            ),
            Self::Eose(subscription_id) => {
                nostr::RelayMessage::eose(SubscriptionId::new(subscription_id))
            }
            Self::Ok {
                event_id,
                accepted,
                message,
            } => {
                let event_id = EventId::from_hex(event_id)
                    .map_err(|e| NostrError::Encoding(format!("Invalid event id: {e}")))?;
                nostr::RelayMessage::ok(event_id, *accepted, message.as_str())
            }
            Self::Notice(message) => nostr::RelayMessage::notice(message.as_str()),
            Self::Closed {
                subscription_id,
                message,
            } => nostr::RelayMessage::closed(
                SubscriptionId::new(subscription_id),
                message.as_str(),
            ),
            Self::Auth { challenge } => nostr::RelayMessage::auth(challenge.as_str()),
        };
        wire.try_as_json()
            .map_err(|e| NostrError::Encoding(e.to_string()))
    }
}

fn to_wire_event(event: &Event) -> Result<nostr::Event> {
    nostr::Event::from_json(event.to_json()?)
        .map_err(|e| NostrError::Encoding(format!("Invalid event: {e}")))
}

fn from_wire_event(event: &nostr::Event) -> Result<Event> {
    let json = event
        .try_as_json()
        .map_err(|e| NostrError::Encoding(e.to_string()))?;
    Event::from_json(&json)
}

fn to_wire_filter(filter: &Filter) -> Result<nostr::Filter> {
    filter.validate()?;
    nostr::Filter::from_json(filter.to_json()?)
        .map_err(|e| NostrError::Encoding(format!("Invalid filter: {e}")))
}

fn from_wire_filter(filter: &nostr::Filter) -> Result<Filter> {
    let json = filter
        .try_as_json()
        .map_err(|e| NostrError::Encoding(e.to_string()))?;
    Filter::from_json(&json)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::nostr::event_tests::signed_note;

    fn secret() -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[31] = 3;
        bytes
    }

    #[test]
    fn req_frame_layout() {
        let msg = ClientMessage::Req {
            subscription_id: "abc".to_string(),
            filters: vec![Filter::new().kind(1).limit(10), Filter::new().kind(7)],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value[0], "REQ");
        assert_eq!(value[1], "abc");
        assert_eq!(value[2]["kinds"], json!([1]));
        assert_eq!(value[2]["limit"], 10);
        assert_eq!(value[3]["kinds"], json!([7]));
        assert_eq!(ClientMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn req_frame_carries_tag_constraints() {
        let msg = ClientMessage::Req {
            subscription_id: "tags".to_string(),
            filters: vec![Filter::new().kind(1).tag('t', ["grove"])],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value[2]["#t"], json!(["grove"]));
        assert_eq!(ClientMessage::from_json(&msg.to_json().unwrap()).unwrap(), msg);
    }

    #[test]
    fn close_and_event_frames() {
        let close = ClientMessage::Close("abc".to_string());
        assert_eq!(close.to_json().unwrap(), r#"["CLOSE","abc"]"#);

        let event = signed_note(secret(), 10, "hi");
        let frame = ClientMessage::Event(event.clone()).to_json().unwrap();
        assert!(frame.starts_with(r#"["EVENT",{"#));
        assert_eq!(
            ClientMessage::from_json(&frame).unwrap(),
            ClientMessage::Event(event)
        );
    }

    #[test]
    fn parses_relay_event() {
        let event = signed_note(secret(), 10, "hi");
        let frame = format!(r#"["EVENT","sub",{}]"#, event.to_json().unwrap());
        match RelayMessage::from_json(&frame).unwrap() {
            RelayMessage::Event {
                subscription_id,
                event: parsed,
            } => {
                assert_eq!(subscription_id, "sub");
                assert_eq!(*parsed, event);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_control_frames() {
        let id = "a".repeat(64);
        assert_eq!(
            RelayMessage::from_json(r#"["EOSE","sub"]"#).unwrap(),
            RelayMessage::Eose("sub".to_string())
        );
        assert_eq!(
            RelayMessage::from_json(r#"["NOTICE","slow down"]"#).unwrap(),
            RelayMessage::Notice("slow down".to_string())
        );
        assert_eq!(
            RelayMessage::from_json(r#"["AUTH","challenge-1"]"#).unwrap(),
            RelayMessage::Auth {
                challenge: "challenge-1".to_string()
            }
        );
        assert_eq!(
            RelayMessage::from_json(&format!(r#"["OK","{id}",false,"auth-required: sign in"]"#))
                .unwrap(),
            RelayMessage::Ok {
                event_id: id,
                accepted: false,
                message: "auth-required: sign in".to_string(),
            }
        );
        assert_eq!(
            RelayMessage::from_json(r#"["CLOSED","sub","error: shutting down"]"#).unwrap(),
            RelayMessage::Closed {
                subscription_id: "sub".to_string(),
                message: "error: shutting down".to_string(),
            }
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        for frame in [
            "not json",
            r#"{"EVENT":1}"#,
            "[]",
            "[1]",
            r#"["WAT","x"]"#,
            r#"["EOSE"]"#,
            r#"["OK","id"]"#,
            r#"["OK","not-an-id",true,""]"#,
            r#"["EVENT","sub",{"id":1}]"#,
            r#"["COUNT","sub",{"count":3}]"#,
        ] {
            assert!(
                matches!(RelayMessage::from_json(frame), Err(NostrError::Encoding(_))),
                "accepted {frame}"
            );
        }
    }

    #[test]
    fn relay_frames_encode_for_test_relays() {
        let frame = RelayMessage::Closed {
            subscription_id: "s".to_string(),
            message: "error: shutting down".to_string(),
        };
        assert_eq!(
            frame.to_json().unwrap(),
            r#"["CLOSED","s","error: shutting down"]"#
        );

        let ok = RelayMessage::Ok {
            event_id: "b".repeat(64),
            accepted: true,
            message: String::new(),
        };
        assert_eq!(RelayMessage::from_json(&ok.to_json().unwrap()).unwrap(), ok);

        let bad_id = RelayMessage::Ok {
            event_id: "nope".to_string(),
            accepted: true,
            message: String::new(),
        };
        assert!(matches!(bad_id.to_json(), Err(NostrError::Encoding(_))));
    }
}
