//! Local publish/subscribe bus with type-tree routing.
//!
//! Every subscriber owns a bounded [`DeliveryQueue`], so publishing never
//! waits on a slow consumer. When a queue is full the configured
//! [`OverflowPolicy`] decides which event is lost, and the loss is counted
//! on the subscription and in [`BusStats`].

use super::types::{Event, EventPayload, EventTypeTree};
use crate::types::{BusConfig, Identity, OverflowPolicy, Result, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, RwLock};

// =============================================================================
// Delivery queue
// =============================================================================

/// Outcome of pushing into a delivery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest entry.
    EvictedOldest,
    /// Rejected because the queue was full.
    RejectedNewest,
    /// The subscription is gone.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Event>,
    dropped: u64,
    closed: bool,
}

/// Bounded single-consumer queue feeding one subscription.
#[derive(Debug)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: Event) -> PushOutcome {
        let mut state = self.lock();
        if state.closed {
            return PushOutcome::Closed;
        }
        let outcome = if state.items.len() < self.capacity {
            PushOutcome::Queued
        } else {
            state.dropped += 1;
            match self.policy {
                OverflowPolicy::DropOldest => {
                    state.items.pop_front();
                    PushOutcome::EvictedOldest
                }
                OverflowPolicy::DropNewest => return PushOutcome::RejectedNewest,
            }
        };
        state.items.push_back(event);
        drop(state);
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next event. Returns `None` once closed and drained.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut state = self.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Event> {
        self.lock().items.pop_front()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug)]
struct Subscriber {
    id: SubscriptionId,
    owner: Identity,
    event_type: String,
    queue: Arc<DeliveryQueue>,
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    event_type: String,
    queue: Arc<DeliveryQueue>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Next matching event, or `None` after the bus closed the subscription.
    pub async fn recv(&self) -> Option<Event> {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.queue.try_pop()
    }

    /// Next event decoded as `E`; events of other types are skipped.
    pub async fn recv_payload<E: EventPayload>(&self) -> Option<Result<(Event, E)>> {
        loop {
            let event = self.recv().await?;
            if event.is::<E>() {
                return Some(event.decode().map(|payload| (event, payload)));
            }
        }
    }

    /// Events lost to overflow on this subscription.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

// =============================================================================
// Event bus
// =============================================================================

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub active_subscribers: usize,
}

/// In-process event bus.
#[derive(Debug)]
pub struct EventBus {
    config: BusConfig,
    tree: RwLock<EventTypeTree>,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    stats: RwLock<BusStats>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_tree(config, EventTypeTree::builtin())
    }

    pub fn with_tree(config: BusConfig, tree: EventTypeTree) -> Self {
        Self {
            config,
            tree: RwLock::new(tree),
            subscribers: RwLock::new(Vec::new()),
            stats: RwLock::new(BusStats::default()),
        }
    }

    /// Extend the type tree at runtime.
    pub async fn register_event_type(&self, name: &str, parent: &str) -> Result<()> {
        self.tree.write().await.register(name, parent)
    }

    pub async fn is_a(&self, event_type: &str, ancestor: &str) -> bool {
        self.tree.read().await.is_a(event_type, ancestor)
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Deliver to every subscriber whose filter is the event's type or one
    /// of its ancestors. Returns the number of queues the event entered.
    pub async fn publish(&self, event: Event) -> usize {
        // Snapshot: subscriptions added or removed from here on do not
        // affect this delivery.
        let snapshot: Vec<Arc<Subscriber>> = self.subscribers.read().await.clone();

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        {
            let tree = self.tree.read().await;
            for subscriber in &snapshot {
                if !tree.is_a(&event.event_type, &subscriber.event_type) {
                    continue;
                }
                let outcome = subscriber.queue.push(event.clone());
                match outcome {
                    PushOutcome::Queued => delivered += 1,
                    PushOutcome::EvictedOldest => {
                        delivered += 1;
                        dropped += 1;
                    }
                    PushOutcome::RejectedNewest => dropped += 1,
                    PushOutcome::Closed => {}
                }
                if matches!(outcome, PushOutcome::EvictedOldest | PushOutcome::RejectedNewest) {
                    tracing::debug!(
                        "Subscriber {} ({}) queue full, policy={:?}",
                        subscriber.id,
                        subscriber.owner,
                        self.config.overflow
                    );
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.events_published += 1;
        stats.events_delivered += delivered;
        stats.events_dropped += dropped;

        tracing::debug!(
            "Published event type={} origin={} to {} subscribers",
            event.event_type,
            event.origin,
            delivered
        );

        delivered as usize
    }

    // =========================================================================
    // Subscribe
    // =========================================================================

    /// Subscribe to an event type and all of its descendants.
    pub async fn subscribe(&self, owner: Identity, event_type: impl Into<String>) -> Subscription {
        let event_type = event_type.into();
        let queue = Arc::new(DeliveryQueue::new(
            self.config.queue_capacity,
            self.config.overflow,
        ));
        let subscriber = Arc::new(Subscriber {
            id: SubscriptionId::new(),
            owner,
            event_type: event_type.clone(),
            queue: queue.clone(),
        });
        let id = subscriber.id.clone();

        if !self.tree.read().await.contains(&event_type) {
            tracing::warn!(
                "Subscription {} to unregistered event type {}; only exact matches will arrive",
                id,
                event_type
            );
        }

        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.queue.is_closed());
        subscribers.push(subscriber);
        let active = subscribers.len();
        drop(subscribers);

        self.stats.write().await.active_subscribers = active;
        tracing::debug!("Subscription {} registered for {}", id, event_type);

        Subscription {
            id,
            event_type,
            queue,
        }
    }

    /// Subscribe to the type a payload struct is bound to.
    pub async fn subscribe_to<E: EventPayload>(&self, owner: Identity) -> Subscription {
        self.subscribe(owner, E::EVENT_TYPE).await
    }

    /// Remove a subscription. Pending events stay readable.
    pub async fn unsubscribe(&self, id: &SubscriptionId) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| {
            if s.id == *id {
                s.queue.close();
            }
            !s.queue.is_closed()
        });
        let active = subscribers.len();
        drop(subscribers);

        self.stats.write().await.active_subscribers = active;
        tracing::debug!("Unsubscribed: {}", id);
    }

    /// Close every subscription; receivers drain and then see `None`.
    pub async fn close_all(&self) {
        let mut subscribers = self.subscribers.write().await;
        for subscriber in subscribers.drain(..) {
            subscriber.queue.close();
        }
        self.stats.write().await.active_subscribers = 0;
    }

    pub async fn get_stats(&self) -> BusStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_subscribers = self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|s| !s.queue.is_closed())
            .count();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{
        BadWeatherEvent, GoodWeatherEvent, RoofOpenedEvent, ROOT_EVENT,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn me() -> Identity {
        Identity::parse("scheduler").unwrap()
    }

    fn numbered(i: usize) -> Event {
        Event::new(me(), "LogEvent", json!({ "level": "info", "message": i.to_string() }))
    }

    fn seq(event: &Event) -> String {
        event.payload["message"].as_str().unwrap_or_default().to_string()
    }

    fn small_bus(capacity: usize, overflow: OverflowPolicy) -> EventBus {
        EventBus::new(BusConfig {
            queue_capacity: capacity,
            overflow,
        })
    }

    // =========================================================================
    // Routing
    // =========================================================================

    #[tokio::test]
    async fn test_base_subscription_receives_descendants() {
        let bus = EventBus::default();
        let weather = bus.subscribe(me(), "WeatherEvent").await;

        bus.publish(Event::from_payload(me(), &GoodWeatherEvent::default()).unwrap())
            .await;
        bus.publish(Event::from_payload(me(), &RoofOpenedEvent {}).unwrap())
            .await;
        bus.publish(Event::from_payload(me(), &BadWeatherEvent {}).unwrap())
            .await;

        assert_eq!(weather.try_recv().unwrap().event_type, "GoodWeatherEvent");
        assert_eq!(weather.try_recv().unwrap().event_type, "BadWeatherEvent");
        assert!(weather.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_no_delivery_of_events_published_before_subscribing() {
        let bus = EventBus::default();
        bus.publish(numbered(0)).await;

        let sub = bus.subscribe(me(), ROOT_EVENT).await;
        bus.publish(numbered(1)).await;

        assert_eq!(seq(&sub.recv().await.unwrap()), "1");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_exact_subscription_ignores_parent_type() {
        let bus = EventBus::default();
        let sub = bus.subscribe(me(), "GoodWeatherEvent").await;
        bus.publish(Event::new(me(), "WeatherEvent", json!({}))).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_runtime_registered_type_routes_to_parent() {
        let bus = EventBus::default();
        bus.register_event_type("DomeSlewEvent", "RoofEvent").await.unwrap();
        let sub = bus.subscribe(me(), "RoofEvent").await;

        bus.publish(Event::new(me(), "DomeSlewEvent", json!({"az": 90.0}))).await;
        assert_eq!(sub.try_recv().unwrap().event_type, "DomeSlewEvent");
        assert!(bus.is_a("DomeSlewEvent", ROOT_EVENT).await);
    }

    #[tokio::test]
    async fn test_recv_payload_skips_other_types() {
        let bus = EventBus::default();
        let sub = bus.subscribe(me(), "WeatherEvent").await;
        bus.publish(Event::from_payload(me(), &BadWeatherEvent {}).unwrap()).await;
        bus.publish(Event::from_payload(me(), &GoodWeatherEvent::default()).unwrap())
            .await;

        let (event, payload) = sub.recv_payload::<GoodWeatherEvent>().await.unwrap().unwrap();
        assert_eq!(event.event_type, "GoodWeatherEvent");
        assert_eq!(payload, GoodWeatherEvent::default());
    }

    // =========================================================================
    // Ordering and overflow
    // =========================================================================

    #[tokio::test]
    async fn test_in_order_delivery_without_overflow() {
        let bus = small_bus(100, OverflowPolicy::DropOldest);
        let sub = bus.subscribe(me(), "LogEvent").await;
        for i in 0..100 {
            bus.publish(numbered(i)).await;
        }
        for i in 0..100 {
            assert_eq!(seq(&sub.recv().await.unwrap()), i.to_string());
        }
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let bus = small_bus(3, OverflowPolicy::DropOldest);
        let sub = bus.subscribe(me(), ROOT_EVENT).await;
        for i in 0..5 {
            bus.publish(numbered(i)).await;
        }
        let kept: Vec<String> = std::iter::from_fn(|| sub.try_recv()).map(|e| seq(&e)).collect();
        assert_eq!(kept, vec!["2", "3", "4"]);
        assert_eq!(sub.dropped(), 2);

        let stats = bus.get_stats().await;
        assert_eq!(stats.events_published, 5);
        assert_eq!(stats.events_delivered, 5);
        assert_eq!(stats.events_dropped, 2);
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_first() {
        let bus = small_bus(3, OverflowPolicy::DropNewest);
        let sub = bus.subscribe(me(), ROOT_EVENT).await;
        for i in 0..5 {
            bus.publish(numbered(i)).await;
        }
        let kept: Vec<String> = std::iter::from_fn(|| sub.try_recv()).map(|e| seq(&e)).collect();
        assert_eq!(kept, vec!["0", "1", "2"]);
        assert_eq!(sub.dropped(), 2);
        assert_eq!(bus.get_stats().await.events_delivered, 3);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_others() {
        let bus = small_bus(2, OverflowPolicy::DropNewest);
        let slow = bus.subscribe(me(), ROOT_EVENT).await;
        let fast = bus.subscribe(me(), ROOT_EVENT).await;

        for i in 0..4 {
            bus.publish(numbered(i)).await;
            assert_eq!(seq(&fast.recv().await.unwrap()), i.to_string());
        }
        assert_eq!(slow.pending(), 2);
        assert_eq!(slow.dropped(), 2);
        assert_eq!(fast.dropped(), 0);
    }

    // =========================================================================
    // Subscription lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = EventBus::default();
        let first = bus.subscribe(me(), ROOT_EVENT).await;
        let _second = bus.subscribe(me(), ROOT_EVENT).await;
        assert_eq!(bus.get_stats().await.active_subscribers, 2);

        drop(first);
        assert_eq!(bus.get_stats().await.active_subscribers, 1);
        assert_eq!(bus.publish(numbered(0)).await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream_after_drain() {
        let bus = EventBus::default();
        let sub = bus.subscribe(me(), ROOT_EVENT).await;
        bus.publish(numbered(7)).await;
        bus.unsubscribe(sub.id()).await;
        bus.publish(numbered(8)).await;

        assert_eq!(seq(&sub.recv().await.unwrap()), "7");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::default());
        let sub = bus.subscribe(me(), ROOT_EVENT).await;

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                bus.publish(numbered(42)).await
            })
        };

        assert_eq!(seq(&sub.recv().await.unwrap()), "42");
        assert_eq!(publisher.await.unwrap(), 1);
    }
}
