//! Typed events and the local event bus.
//!
//! Events form a tree rooted at [`ROOT_EVENT`]. Subscribing to a type
//! matches that type and every descendant, so a subscriber on
//! `WeatherEvent` sees both `GoodWeatherEvent` and `BadWeatherEvent`.

pub mod bus;
pub mod types;

pub use bus::{BusStats, DeliveryQueue, EventBus, PushOutcome, Subscription};
pub use types::{
    BadWeatherEvent, Event, EventPayload, EventTypeTree, ExposureStatusChangedEvent,
    FocusFoundEvent, GoodWeatherEvent, LogEvent, ModuleClosedEvent, ModuleOpenedEvent,
    ModuleStateChangedEvent, MotionStatusChangedEvent, MoveAltAzEvent, MoveRaDecEvent,
    NewImageEvent, OffsetsAltAzEvent, OffsetsRaDecEvent, RoofClosingEvent, RoofOpenedEvent,
    ROOT_EVENT,
};
