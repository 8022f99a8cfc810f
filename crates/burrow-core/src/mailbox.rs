//! Rendezvous-channel messages — dilation control traffic that rides the
//! outer wormhole's key/value message channel as JSON.
//!
//! Phases carry the generation in their name (`lets-dilate-3`, `hints-3`)
//! as well as in the body, so a peer can cheaply discard stale traffic.

use serde::{Deserialize, Serialize};

/// Minimum `can-dilate` value both peers must advertise.
pub const REQUIRED_DILATION_VERSION: u64 = 1;

/// Read the `can-dilate` key of a peer's version advertisement.
/// An absent or non-integer value counts as 0.
pub fn peer_can_dilate(versions: &serde_json::Value) -> bool {
    versions
        .get("can-dilate")
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
        >= REQUIRED_DILATION_VERSION
}

/// A reachability candidate for one L2 attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Hint {
    pub hostname: String,
    pub port: u16,
    #[serde(default)]
    pub priority: f64,
    #[serde(rename = "type")]
    pub kind: HintKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    Direct,
    Relay,
}

/// Sent by a peer that wants dilation but cannot start it (the follower,
/// or either peer before roles are known).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PleaseDilate {
    pub side: String,
}

/// Leader → follower: start connecting for generation `n`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LetsDilate {
    #[serde(rename = "n")]
    pub generation: u64,
    pub hints: Vec<Hint>,
}

/// Additional listening hints within a generation, either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionHints {
    #[serde(rename = "n")]
    pub generation: u64,
    pub hints: Vec<Hint>,
}

/// A decoded inbound rendezvous message.
#[derive(Debug, Clone, PartialEq)]
pub enum MailboxMessage {
    PleaseDilate(PleaseDilate),
    LetsDilate(LetsDilate),
    Hints(ConnectionHints),
}

impl MailboxMessage {
    /// Phase string this message is published under.
    pub fn phase(&self) -> String {
        match self {
            MailboxMessage::PleaseDilate(_) => "please-dilate".to_string(),
            MailboxMessage::LetsDilate(m) => format!("lets-dilate-{}", m.generation),
            MailboxMessage::Hints(m) => format!("hints-{}", m.generation),
        }
    }

    /// Serialize the body for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let result = match self {
            MailboxMessage::PleaseDilate(m) => serde_json::to_vec(m),
            MailboxMessage::LetsDilate(m) => serde_json::to_vec(m),
            MailboxMessage::Hints(m) => serde_json::to_vec(m),
        };
        result.expect("mailbox message serialization failed")
    }

    /// Decode a message from its phase and JSON body.
    ///
    /// Unknown phases and malformed bodies yield `None`: other
    /// applications share the channel, and hostile input must not error
    /// out of the dispatch loop.
    pub fn decode(phase: &str, body: &[u8]) -> Option<MailboxMessage> {
        if phase == "please-dilate" {
            return serde_json::from_slice(body)
                .ok()
                .map(MailboxMessage::PleaseDilate);
        }
        if let Some(suffix) = phase.strip_prefix("lets-dilate-") {
            suffix.parse::<u64>().ok()?;
            return serde_json::from_slice(body)
                .ok()
                .map(MailboxMessage::LetsDilate);
        }
        if let Some(suffix) = phase.strip_prefix("hints-") {
            suffix.parse::<u64>().ok()?;
            return serde_json::from_slice(body).ok().map(MailboxMessage::Hints);
        }
        None
    }
}
