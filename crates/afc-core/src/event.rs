// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lifecycle events published on the `system` topic and the heartbeat
//! convention used on the `orch` topic.

use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, Payload};

/// Topic carrying lifecycle events.
pub const TOPIC_SYSTEM: &str = "system";
/// Topic carrying runner heartbeats.
pub const TOPIC_ORCH: &str = "orch";

/// Kind of lifecycle transition being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    /// An agent was registered.
    Register,
    /// A runner was restarted.
    Restart,
    /// An agent was swapped for a stub.
    Quarantine,
    /// A runner was paused by the regression guard.
    Pause,
    /// A paused runner was resumed.
    Resume,
}

impl LifecycleKind {
    /// Wire name of the event kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Restart => "restart",
            Self::Quarantine => "quarantine",
            Self::Pause => "pause",
            Self::Resume => "resume",
        }
    }
}

/// A lifecycle announcement for a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// What happened.
    pub kind: LifecycleKind,
    /// Name of the agent concerned.
    pub agent: String,
    /// Capability tags, present on `register` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
}

impl LifecycleEvent {
    /// Create an event without capability tags.
    #[must_use]
    pub fn new(kind: LifecycleKind, agent: impl Into<String>) -> Self {
        Self {
            kind,
            agent: agent.into(),
            capabilities: None,
        }
    }

    /// Attach capability tags (used for `register`).
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Render as a `system`-topic envelope from the orchestrator.
    #[must_use]
    pub fn envelope(&self, ts: f64) -> Envelope {
        let mut payload = Payload::new();
        payload.insert("event", self.kind.as_str());
        payload.insert("agent", self.agent.clone());
        if let Some(caps) = &self.capabilities {
            payload.insert("capabilities", serde_json::json!(caps));
        }
        Envelope::new(crate::ORCHESTRATOR, TOPIC_SYSTEM)
            .with_payload(payload)
            .with_ts(ts)
    }

    /// Parse a `system`-topic envelope back into an event, if it is one.
    #[must_use]
    pub fn from_envelope(env: &Envelope) -> Option<Self> {
        let kind = match env.payload.get("event")?.as_str()? {
            "register" => LifecycleKind::Register,
            "restart" => LifecycleKind::Restart,
            "quarantine" => LifecycleKind::Quarantine,
            "pause" => LifecycleKind::Pause,
            "resume" => LifecycleKind::Resume,
            _ => return None,
        };
        let agent = env.payload.get("agent")?.as_str()?.to_string();
        let capabilities = env.payload.get("capabilities").and_then(|v| {
            v.as_array().map(|a| {
                a.iter()
                    .filter_map(|x| x.as_str().map(str::to_string))
                    .collect()
            })
        });
        Some(Self {
            kind,
            agent,
            capabilities,
        })
    }
}

/// Build a heartbeat envelope from `sender` to the `orch` topic.
#[must_use]
pub fn heartbeat(sender: &str, ts: f64) -> Envelope {
    let mut payload = Payload::new();
    payload.insert("heartbeat", true);
    Envelope::new(sender, TOPIC_ORCH)
        .with_payload(payload)
        .with_ts(ts)
}

/// Returns `true` when the envelope is a heartbeat.
#[must_use]
pub fn is_heartbeat(env: &Envelope) -> bool {
    env.payload
        .get("heartbeat")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_event_roundtrip() {
        let event = LifecycleEvent::new(LifecycleKind::Register, "planner")
            .with_capabilities(vec!["planning".into()]);
        let env = event.envelope(10.0);
        assert_eq!(env.recipient, TOPIC_SYSTEM);
        assert_eq!(env.sender, crate::ORCHESTRATOR);
        assert_eq!(env.ts, 10.0);
        assert_eq!(LifecycleEvent::from_envelope(&env), Some(event));
    }

    #[test]
    fn restart_event_has_no_capabilities() {
        let env = LifecycleEvent::new(LifecycleKind::Restart, "fail").envelope(1.0);
        let back = LifecycleEvent::from_envelope(&env).unwrap();
        assert_eq!(back.kind, LifecycleKind::Restart);
        assert!(back.capabilities.is_none());
    }

    #[test]
    fn non_event_envelope_parses_to_none() {
        let env = Envelope::new("x", TOPIC_SYSTEM);
        assert!(LifecycleEvent::from_envelope(&env).is_none());
    }

    #[test]
    fn heartbeat_is_recognised() {
        let env = heartbeat("planner", 5.0);
        assert_eq!(env.recipient, TOPIC_ORCH);
        assert!(is_heartbeat(&env));
        assert!(!is_heartbeat(&Envelope::new("a", "b")));
    }

    #[test]
    fn kind_strings_match_wire_names() {
        assert_eq!(LifecycleKind::Quarantine.as_str(), "quarantine");
        assert_eq!(
            serde_json::to_string(&LifecycleKind::Pause).unwrap(),
            r#""pause""#
        );
    }
}
