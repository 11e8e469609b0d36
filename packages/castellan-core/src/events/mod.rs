//! Event system for real-time client communication.
//!
//! Every backend publishes [`Event`] records onto its outbound channel;
//! [`merge`] fans the per-backend channels into one stream and the
//! [`broadcaster`] fans it back out to any number of filtered subscribers.

mod broadcaster;
mod merge;

pub use broadcaster::{spawn_driver, Broadcaster, SubscriptionId, SUBSCRIBER_CHANNEL_CAPACITY};
pub use merge::{merge_events, MERGED_CHANNEL_CAPACITY};

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{json, Value};

/// Capacity of each backend's outbound event channel.
///
/// Sends into a full channel block the producing watcher; the merge stage
/// propagates that back-pressure rather than dropping.
pub const BACKEND_CHANNEL_CAPACITY: usize = 16;

/// Closed enumeration of event types on the wire.
///
/// Consumers depend only on the tag and the documented payload shape per
/// tag; unknown tags must be tolerated by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    #[serde(rename = "player.updated")]
    PlayerUpdated,
    #[serde(rename = "player.added")]
    PlayerAdded,
    #[serde(rename = "player.removed")]
    PlayerRemoved,
    #[serde(rename = "audio.updated")]
    AudioUpdated,
    #[serde(rename = "service.updated")]
    ServiceUpdated,
    #[serde(rename = "power.action")]
    PowerAction,
    /// Stream-control messages (keep-alive, farewell) on `/events`.
    #[serde(rename = "server.info")]
    ServerInfo,
}

impl EventType {
    /// The wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayerUpdated => "player.updated",
            Self::PlayerAdded => "player.added",
            Self::PlayerRemoved => "player.removed",
            Self::AudioUpdated => "audio.updated",
            Self::ServiceUpdated => "service.updated",
            Self::PowerAction => "power.action",
            Self::ServerInfo => "server.info",
        }
    }

    /// Parses a wire name; unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "player.updated" => Some(Self::PlayerUpdated),
            "player.added" => Some(Self::PlayerAdded),
            "player.removed" => Some(Self::PlayerRemoved),
            "audio.updated" => Some(Self::AudioUpdated),
            "service.updated" => Some(Self::ServiceUpdated),
            "power.action" => Some(Self::PowerAction),
            "server.info" => Some(Self::ServerInfo),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged value shared by all producers.
///
/// The payload shape is determined by the tag. Consumers must treat every
/// `*.updated` payload as authoritative for the entity it names, never as a
/// delta, because slow subscribers may have missed intermediate events.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Tag from the closed [`EventType`] enumeration.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Tag-specific payload.
    pub data: Value,
}

impl Event {
    /// Creates an event with an arbitrary JSON payload.
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self { event_type, data }
    }

    /// Creates a `server.info` stream-control event ("love", "bye").
    pub fn server_info(message: &str) -> Self {
        Self::new(EventType::ServerInfo, json!(message))
    }
}

/// Subsystem names accepted by the `?backend=` stream query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Players,
    Audio,
    Services,
    Power,
}

impl BackendKind {
    /// Parses a query name; unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "players" => Some(Self::Players),
            "audio" => Some(Self::Audio),
            "services" => Some(Self::Services),
            "power" => Some(Self::Power),
            _ => None,
        }
    }

    /// The event types this subsystem produces.
    pub fn event_types(&self) -> &'static [EventType] {
        match self {
            Self::Players => &[
                EventType::PlayerUpdated,
                EventType::PlayerAdded,
                EventType::PlayerRemoved,
            ],
            Self::Audio => &[EventType::AudioUpdated],
            Self::Services => &[EventType::ServiceUpdated],
            Self::Power => &[EventType::PowerAction],
        }
    }
}

/// Per-subscriber filter predicate. `None` means "all events pass".
pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Builds a filter from the stream query parameters.
///
/// `types` is a CSV of wire names, `backends` a CSV of subsystem names
/// expanded through [`BackendKind::event_types`]; the effective set is the
/// union of both. Unknown names are ignored; an empty effective set yields
/// `None` (pass-all).
pub fn filter_from_query(types: Option<&str>, backends: Option<&str>) -> Option<EventFilter> {
    let mut selected: HashSet<EventType> = HashSet::new();

    if let Some(types) = types {
        for name in types.split(',') {
            if let Some(event_type) = EventType::parse(name.trim()) {
                selected.insert(event_type);
            }
        }
    }

    if let Some(backends) = backends {
        for name in backends.split(',') {
            if let Some(backend) = BackendKind::parse(name.trim()) {
                selected.extend(backend.event_types().iter().copied());
            }
        }
    }

    if selected.is_empty() {
        return None;
    }
    Some(Box::new(move |event| selected.contains(&event.event_type)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names_round_trip() {
        for event_type in [
            EventType::PlayerUpdated,
            EventType::PlayerAdded,
            EventType::PlayerRemoved,
            EventType::AudioUpdated,
            EventType::ServiceUpdated,
            EventType::PowerAction,
            EventType::ServerInfo,
        ] {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::parse("nope"), None);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::new(EventType::AudioUpdated, json!({"x": 1}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "audio.updated");
        assert_eq!(value["data"]["x"], 1);
    }

    #[test]
    fn type_filter_passes_only_listed_types() {
        let filter = filter_from_query(Some("audio.updated,player.added"), None).unwrap();
        assert!(filter(&Event::new(EventType::AudioUpdated, json!(null))));
        assert!(filter(&Event::new(EventType::PlayerAdded, json!(null))));
        assert!(!filter(&Event::new(EventType::PlayerUpdated, json!(null))));
    }

    #[test]
    fn backend_filter_expands_to_all_backend_types() {
        let filter = filter_from_query(None, Some("players")).unwrap();
        assert!(filter(&Event::new(EventType::PlayerUpdated, json!(null))));
        assert!(filter(&Event::new(EventType::PlayerAdded, json!(null))));
        assert!(filter(&Event::new(EventType::PlayerRemoved, json!(null))));
        assert!(!filter(&Event::new(EventType::AudioUpdated, json!(null))));
    }

    #[test]
    fn combined_filters_take_the_union() {
        let filter = filter_from_query(Some("audio.updated"), Some("power")).unwrap();
        assert!(filter(&Event::new(EventType::AudioUpdated, json!(null))));
        assert!(filter(&Event::new(EventType::PowerAction, json!(null))));
        assert!(!filter(&Event::new(EventType::ServiceUpdated, json!(null))));
    }

    #[test]
    fn unknown_names_are_ignored_and_empty_set_passes_all() {
        assert!(filter_from_query(Some("bogus,also.bogus"), Some("nothing")).is_none());
        assert!(filter_from_query(None, None).is_none());
    }
}
