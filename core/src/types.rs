//! Domain types shared by the request builder and the event loop.

use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;

/// Domain polled when the caller does not name one.
pub const DEFAULT_DOMAIN: &str = "private";

/// Identity of a logged-in gamer, as returned by the login call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GamerCredentials {
    pub gamer_id: String,
    pub gamer_secret: String,
}

impl GamerCredentials {
    pub fn new(gamer_id: &str, gamer_secret: &str) -> Self {
        Self {
            gamer_id: gamer_id.to_string(),
            gamer_secret: gamer_secret.to_string(),
        }
    }
}

/// One message delivered by the long-poll endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    pub domain: String,
    pub message: Bundle,
}

impl DomainEvent {
    pub fn new(domain: &str, message: Bundle) -> Self {
        Self {
            domain: domain.to_string(),
            message,
        }
    }

    /// Server-assigned message id, used as the acknowledgement token.
    pub fn id(&self) -> Option<&str> {
        match self.message.get("id") {
            Bundle::String(id) if !id.is_empty() => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn event_type(&self) -> &str {
        self.message.get("type").as_str("")
    }

    /// Application payload of the message, when the server wraps one.
    pub fn payload(&self) -> &Bundle {
        self.message.get("event")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_accessors() {
        let message = Bundle::from_json(
            r#"{"id":"m1","type":"godchild","event":{"godchild":{"gamer_id":"g2"}}}"#,
        )
        .unwrap();
        let event = DomainEvent::new("private", message);
        assert_eq!(event.id(), Some("m1"));
        assert_eq!(event.event_type(), "godchild");
        assert_eq!(event.payload().get("godchild").get("gamer_id").as_str(""), "g2");
    }

    #[test]
    fn event_without_id_has_no_ack_token() {
        let event = DomainEvent::new("private", Bundle::from_json(r#"{"id":""}"#).unwrap());
        assert_eq!(event.id(), None);
        assert_eq!(event.event_type(), "");
    }

    #[test]
    fn credentials_use_camel_case() {
        let creds: GamerCredentials =
            serde_json::from_str(r#"{"gamerId":"g1","gamerSecret":"s1"}"#).unwrap();
        assert_eq!(creds, GamerCredentials::new("g1", "s1"));
    }
}
