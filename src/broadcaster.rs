//! Real-time fan-out of readings to live subscribers (the WebSocket
//! endpoint). Every subscriber gets its own bounded `flume` queue; a full
//! queue counts as a drop, and a subscriber that drops three Publish calls
//! in a row is evicted rather than silently losing history — the
//! documented, tested eviction policy for §4.8's "permitted alternative".

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::store::Reading;

struct Subscription {
    id: Uuid,
    tx: flume::Sender<Reading>,
    consecutive_drops: AtomicU32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcasterStats {
    pub subscriber_count: usize,
    pub total_published: u64,
    pub total_dropped: u64,
    pub total_evicted: u64,
}

pub struct Broadcaster {
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    queue_capacity: usize,
    evict_after_drops: u32,
    total_published: AtomicU64,
    total_dropped: AtomicU64,
    total_evicted: AtomicU64,
}

pub struct SubscriptionHandle {
    id: Uuid,
    broadcaster: Arc<Broadcaster>,
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

impl Broadcaster {
    pub fn new(queue_capacity: usize, evict_after_drops: u32) -> Arc<Self> {
        Arc::new(Broadcaster {
            subscriptions: Mutex::new(Vec::new()),
            queue_capacity,
            evict_after_drops,
            total_published: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            total_evicted: AtomicU64::new(0),
        })
    }

    /// Returns a receiver for live readings and a handle whose drop
    /// unsubscribes. Idempotent unsubscription is provided by `Drop`.
    pub fn subscribe(self: &Arc<Self>) -> (flume::Receiver<Reading>, SubscriptionHandle) {
        let (tx, rx) = flume::bounded(self.queue_capacity);
        let id = Uuid::new_v4();
        let sub = Arc::new(Subscription {
            id,
            tx,
            consecutive_drops: AtomicU32::new(0),
        });
        self.subscriptions.lock().push(sub);
        (
            rx,
            SubscriptionHandle {
                id,
                broadcaster: self.clone(),
            },
        )
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let mut subs = self.subscriptions.lock();
        subs.retain(|s| s.id != id);
    }

    /// Non-blocking fan-out: completes in O(subscribers) regardless of any
    /// individual subscriber's consumption rate.
    pub fn publish(&self, reading: Reading) {
        self.total_published.fetch_add(1, Ordering::Relaxed);
        let mut evicted = Vec::new();
        {
            let subs = self.subscriptions.lock();
            for sub in subs.iter() {
                match sub.tx.try_send(reading.clone()) {
                    Ok(()) => {
                        sub.consecutive_drops.store(0, Ordering::Relaxed);
                    }
                    Err(flume::TrySendError::Full(_)) => {
                        self.total_dropped.fetch_add(1, Ordering::Relaxed);
                        let drops = sub.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        if drops >= self.evict_after_drops {
                            evicted.push(sub.id);
                        }
                    }
                    Err(flume::TrySendError::Disconnected(_)) => {
                        evicted.push(sub.id);
                    }
                }
            }
        }
        if !evicted.is_empty() {
            self.total_evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            let mut subs = self.subscriptions.lock();
            subs.retain(|s| !evicted.contains(&s.id));
        }
    }

    pub fn stats(&self) -> BroadcasterStats {
        BroadcasterStats {
            subscriber_count: self.subscriptions.lock().len(),
            total_published: self.total_published.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            total_evicted: self.total_evicted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReadingStatus;
    use chrono::Utc;

    fn sample() -> Reading {
        Reading {
            id: None,
            device_id: 1,
            device_name: "probe-1".into(),
            timestamp: Utc::now(),
            value: Some(20.0),
            ambient_temp: None,
            status: ReadingStatus::Ok,
            raw_hex: None,
            error_message: None,
        }
    }

    #[test]
    fn publish_delivers_to_subscriber() {
        let broadcaster = Broadcaster::new(4, 3);
        let (rx, _handle) = broadcaster.subscribe();
        broadcaster.publish(sample());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let broadcaster = Broadcaster::new(4, 3);
        let (_rx, handle) = broadcaster.subscribe();
        drop(handle);
        assert_eq!(broadcaster.stats().subscriber_count, 0);
    }

    #[test]
    fn slow_subscriber_is_evicted_after_k_consecutive_drops() {
        let broadcaster = Broadcaster::new(1, 3);
        let (_rx, _handle) = broadcaster.subscribe();
        // fill the one-slot queue, then overflow it repeatedly without
        // ever draining — simulates a subscriber that never reads.
        broadcaster.publish(sample());
        for _ in 0..3 {
            broadcaster.publish(sample());
        }
        assert_eq!(broadcaster.stats().subscriber_count, 0);
        assert_eq!(broadcaster.stats().total_evicted, 1);
    }

    #[test]
    fn publish_with_no_subscribers_is_a_no_op() {
        let broadcaster = Broadcaster::new(4, 3);
        broadcaster.publish(sample());
        assert_eq!(broadcaster.stats().total_published, 1);
    }
}
