//! Event bus for components outside the graphs.
//!
//! Observers are called synchronously, in subscription order, on the
//! publishing thread. The subscriber list is snapshotted before delivery so
//! no lock is held while an observer runs; an observer may subscribe or
//! unsubscribe from inside a callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use meridian_transport::events::TransportEvent;

type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&TransportEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn publish(&self, event: &TransportEvent) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let snapshot: Vec<Handler> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.observers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_transport::events::Feature;

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let log: Arc<Mutex<Vec<(u8, TransportEvent)>>> = Arc::default();
        for tag in 0..3u8 {
            let log = Arc::clone(&log);
            bus.subscribe(move |e| log.lock().unwrap().push((tag, e.clone())));
        }
        let event = TransportEvent::FeatureToggled {
            feature: Feature::Nack,
            enabled: false,
        };
        bus.publish(&event);
        let log = log.lock().unwrap();
        assert_eq!(log.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(log.iter().all(|(_, e)| *e == event));
    }

    #[test]
    fn unsubscribe_from_inside_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let id = Arc::new(Mutex::new(None));
        {
            let bus_ref = Arc::clone(&bus);
            let calls = Arc::clone(&calls);
            let id_slot = Arc::clone(&id);
            let sid = bus.subscribe(move |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                if let Some(sid) = *id_slot.lock().unwrap() {
                    bus_ref.unsubscribe(sid);
                }
            });
            *id.lock().unwrap() = Some(sid);
        }
        bus.publish(&TransportEvent::PayloadTypesCleared);
        bus.publish(&TransportEvent::PayloadTypesCleared);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.published(), 2);
    }
}
