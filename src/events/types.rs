//! Event envelope, typed payloads and the event type tree.

use crate::module::ModuleState;
use crate::types::{Error, ErrorKind, EventId, Identity, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Root of the event type tree. A subscription to it matches everything.
pub const ROOT_EVENT: &str = "Event";

// =============================================================================
// Event envelope
// =============================================================================

/// A broadcast notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub origin: Identity,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(origin: Identity, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: EventId::new(),
            origin,
            timestamp: Utc::now(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Wrap a typed payload.
    pub fn from_payload<E: EventPayload>(origin: Identity, payload: &E) -> Result<Self> {
        Ok(Self::new(origin, E::EVENT_TYPE, serde_json::to_value(payload)?))
    }

    pub fn is<E: EventPayload>(&self) -> bool {
        self.event_type == E::EVENT_TYPE
    }

    /// Decode the payload as `E`. The event type tag must match exactly.
    pub fn decode<E: EventPayload>(&self) -> Result<E> {
        if !self.is::<E>() {
            return Err(Error::validation(format!(
                "event {} is a {}, not a {}",
                self.id,
                self.event_type,
                E::EVENT_TYPE
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// A payload type bound to one node of the event type tree.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;
}

macro_rules! event_payload {
    ($($ty:ident),* $(,)?) => {
        $(
            impl EventPayload for $ty {
                const EVENT_TYPE: &'static str = stringify!($ty);
            }
        )*
    };
}

// =============================================================================
// Built-in payloads
// =============================================================================

/// One log record broadcast by a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    pub level: String,
    /// Module path the record was logged from.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
}

/// Announced by a module after it connects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOpenedEvent {
    pub label: String,
    pub version: String,
}

/// Announced by a module before it disconnects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleClosedEvent {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStateChangedEvent {
    pub old: ModuleState,
    pub new: ModuleState,
    /// Kind of the error that caused the transition, none on reset.
    pub kind: Option<ErrorKind>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionStatusChangedEvent {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureStatusChangedEvent {
    pub last: String,
    pub current: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewImageEvent {
    pub filename: String,
    #[serde(default)]
    pub image_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FocusFoundEvent {
    pub focus: f64,
    pub error: f64,
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoodWeatherEvent {
    /// Expected time the roof may open.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BadWeatherEvent {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoofOpenedEvent {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoofClosingEvent {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveAltAzEvent {
    pub alt: f64,
    pub az: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRaDecEvent {
    pub ra: f64,
    pub dec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetsAltAzEvent {
    pub dalt: f64,
    pub daz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetsRaDecEvent {
    pub dra: f64,
    pub ddec: f64,
}

event_payload!(
    LogEvent,
    ModuleOpenedEvent,
    ModuleClosedEvent,
    ModuleStateChangedEvent,
    MotionStatusChangedEvent,
    ExposureStatusChangedEvent,
    NewImageEvent,
    FocusFoundEvent,
    GoodWeatherEvent,
    BadWeatherEvent,
    RoofOpenedEvent,
    RoofClosingEvent,
    MoveAltAzEvent,
    MoveRaDecEvent,
    OffsetsAltAzEvent,
    OffsetsRaDecEvent,
);

// =============================================================================
// Type tree
// =============================================================================

/// Registry of `(type, parent)` pairs rooted at [`ROOT_EVENT`].
#[derive(Debug, Clone)]
pub struct EventTypeTree {
    parents: HashMap<String, Option<String>>,
}

impl Default for EventTypeTree {
    fn default() -> Self {
        Self::builtin()
    }
}

impl EventTypeTree {
    /// Tree holding only the root.
    pub fn new() -> Self {
        let mut parents = HashMap::new();
        parents.insert(ROOT_EVENT.to_string(), None);
        Self { parents }
    }

    /// Tree seeded with the built-in event types.
    pub fn builtin() -> Self {
        let mut tree = Self::new();
        let edges: &[(&str, &str)] = &[
            ("LogEvent", ROOT_EVENT),
            ("ModuleOpenedEvent", ROOT_EVENT),
            ("ModuleClosedEvent", ROOT_EVENT),
            ("ModuleStateChangedEvent", ROOT_EVENT),
            ("MotionStatusChangedEvent", ROOT_EVENT),
            ("ExposureStatusChangedEvent", ROOT_EVENT),
            ("NewImageEvent", ROOT_EVENT),
            ("FocusFoundEvent", ROOT_EVENT),
            ("WeatherEvent", ROOT_EVENT),
            ("GoodWeatherEvent", "WeatherEvent"),
            ("BadWeatherEvent", "WeatherEvent"),
            ("RoofEvent", ROOT_EVENT),
            ("RoofOpenedEvent", "RoofEvent"),
            ("RoofClosingEvent", "RoofEvent"),
            ("MoveEvent", ROOT_EVENT),
            ("MoveAltAzEvent", "MoveEvent"),
            ("MoveRaDecEvent", "MoveEvent"),
            ("OffsetsEvent", ROOT_EVENT),
            ("OffsetsAltAzEvent", "OffsetsEvent"),
            ("OffsetsRaDecEvent", "OffsetsEvent"),
        ];
        for (name, parent) in edges {
            tree.parents
                .insert((*name).to_string(), Some((*parent).to_string()));
        }
        tree
    }

    /// Add a type under an existing parent. Re-registering the same edge is
    /// a no-op; moving a type to another parent is rejected.
    pub fn register(&mut self, name: &str, parent: &str) -> Result<()> {
        if name.is_empty() || name == ROOT_EVENT {
            return Err(Error::validation(format!("invalid event type name: {:?}", name)));
        }
        if !self.parents.contains_key(parent) {
            return Err(Error::validation(format!("unknown parent event type: {}", parent)));
        }
        match self.parents.get(name) {
            Some(Some(existing)) if existing == parent => Ok(()),
            Some(existing) => Err(Error::validation(format!(
                "event type {} already registered under {}",
                name,
                existing.as_deref().unwrap_or("<none>")
            ))),
            None => {
                self.parents.insert(name.to_string(), Some(parent.to_string()));
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parents.contains_key(name)
    }

    pub fn parent(&self, name: &str) -> Option<&str> {
        self.parents.get(name).and_then(|p| p.as_deref())
    }

    /// True if `event_type` is `ancestor` or one of its descendants.
    ///
    /// Unregistered types are treated as direct children of the root.
    pub fn is_a(&self, event_type: &str, ancestor: &str) -> bool {
        if ancestor == ROOT_EVENT || event_type == ancestor {
            return true;
        }
        let mut current = self.parent(event_type);
        // Registration forbids cycles; the bound only caps the walk.
        for _ in 0..self.parents.len() {
            match current {
                Some(name) if name == ancestor => return true,
                Some(name) => current = self.parent(name),
                None => return false,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn origin() -> Identity {
        Identity::parse("weather").unwrap()
    }

    #[test]
    fn test_typed_payload_round_trip() {
        let event = Event::from_payload(origin(), &MoveRaDecEvent { ra: 10.5, dec: -20.0 }).unwrap();
        assert_eq!(event.event_type, "MoveRaDecEvent");
        assert_eq!(event.payload, json!({"ra": 10.5, "dec": -20.0}));
        let decoded: MoveRaDecEvent = event.decode().unwrap();
        assert_eq!(decoded.dec, -20.0);
    }

    #[test]
    fn test_decode_wrong_type_fails() {
        let event = Event::from_payload(origin(), &BadWeatherEvent {}).unwrap();
        assert!(event.decode::<GoodWeatherEvent>().is_err());
    }

    #[test]
    fn test_builtin_hierarchy() {
        let tree = EventTypeTree::builtin();
        assert!(tree.is_a("GoodWeatherEvent", "WeatherEvent"));
        assert!(tree.is_a("GoodWeatherEvent", ROOT_EVENT));
        assert!(!tree.is_a("GoodWeatherEvent", "RoofEvent"));
        assert!(!tree.is_a("WeatherEvent", "GoodWeatherEvent"));
        assert!(tree.is_a("RoofClosingEvent", "RoofEvent"));
    }

    #[test]
    fn test_unknown_type_only_matches_root_and_itself() {
        let tree = EventTypeTree::builtin();
        assert!(tree.is_a("FilterChangedEvent", ROOT_EVENT));
        assert!(tree.is_a("FilterChangedEvent", "FilterChangedEvent"));
        assert!(!tree.is_a("FilterChangedEvent", "WeatherEvent"));
    }

    #[test]
    fn test_register_rules() {
        let mut tree = EventTypeTree::builtin();
        tree.register("SunsetEvent", "WeatherEvent").unwrap();
        tree.register("SunsetEvent", "WeatherEvent").unwrap();
        assert!(tree.register("SunsetEvent", "RoofEvent").is_err());
        assert!(tree.register("Orphan", "NoSuchParent").is_err());
        assert!(tree.register(ROOT_EVENT, ROOT_EVENT).is_err());
        assert!(tree.is_a("SunsetEvent", "WeatherEvent"));
    }

    proptest! {
        #[test]
        fn prop_chain_ancestry(depth in 1usize..12, index in 0usize..12) {
            let mut tree = EventTypeTree::new();
            let mut parent = ROOT_EVENT.to_string();
            let mut names = Vec::new();
            for i in 0..depth {
                let name = format!("Level{}Event", i);
                tree.register(&name, &parent).unwrap();
                names.push(name.clone());
                parent = name;
            }
            let leaf = names.last().unwrap();
            for (i, name) in names.iter().enumerate() {
                prop_assert!(tree.is_a(leaf, name));
                prop_assert!(tree.is_a(name, ROOT_EVENT));
                if i + 1 < names.len() {
                    prop_assert!(!tree.is_a(name, leaf));
                }
            }
            let index = index % depth;
            prop_assert_eq!(tree.is_a(&names[index], &names[0]), true);
        }
    }
}
