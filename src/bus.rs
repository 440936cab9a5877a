// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Typed in-process pub/sub with bounded, lossy-on-overflow fan-out.
//!
//! Built on [`tokio::sync::broadcast`], whose ring-buffer semantics already match the
//! newest-wins overflow policy: a slow subscriber that falls more than the channel capacity
//! behind has its oldest unseen events silently dropped and sees a lag count on its next recv.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// The closed set of event kinds the bus carries. No component may publish or subscribe to an
/// ad hoc kind; new kinds are added here.
#[derive(Debug, Clone)]
pub enum BusEvent {
    ServiceStarted { component: &'static str },
    ServiceStopped { component: &'static str },
    ServiceError { component: &'static str, message: String },
    TunnelUp,
    TunnelDown,
    AnomalyDetected { camera_id: String, event_id: uuid::Uuid },
    ClipReady { event_id: uuid::Uuid, path: String },
    RetentionRan { purged: i64, freed_bytes: i64 },
    DiskPressure { used_percent: f64 },
    EventPoisoned { event_id: uuid::Uuid },
    QueueFull { camera_id: String },
}

struct Inner {
    tx: broadcast::Sender<BusEvent>,
    drops: AtomicU64,
}

/// A typed, bounded, lossy-on-overflow event bus shared by every component.
#[derive(Clone)]
pub struct EventBus(Arc<Inner>);

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus(Arc::new(Inner {
            tx,
            drops: AtomicU64::new(0),
        }))
    }

    /// Publishes non-blocking; if every subscriber's channel is full the event is dropped for
    /// that subscriber, not retried. Returns the number of subscribers that received it.
    pub fn publish(&self, event: BusEvent) -> usize {
        match self.0.tx.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(_)) => 0,
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        Subscriber {
            rx: self.0.tx.subscribe(),
            bus: self.clone(),
        }
    }

    /// Count of receive-side drops observed by any subscriber so far. Approximate: summed
    /// lazily as subscribers notice lag, not tracked per-publish.
    pub fn drop_count(&self) -> u64 {
        self.0.drops.load(Ordering::Relaxed)
    }

    fn record_lag(&self, n: u64) {
        self.0.drops.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscriber {
    rx: broadcast::Receiver<BusEvent>,
    bus: EventBus,
}

impl Subscriber {
    /// Awaits the next event, transparently skipping past a lag notification (recording the
    /// drop count first) rather than surfacing it as an error to callers.
    pub async fn recv(&mut self) -> BusEvent {
        loop {
            match self.rx.recv().await {
                Ok(event) => return event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.bus.record_lag(n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                    unreachable!("bus sender outlives every subscriber for process lifetime");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(BusEvent::TunnelUp);
        match sub.recv().await {
            BusEvent::TunnelUp => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_is_counted() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(BusEvent::TunnelDown);
        }
        // The subscriber is behind by more than capacity; its next recv should observe the lag
        // and then successfully continue receiving rather than erroring out.
        let _ = sub.recv().await;
        assert!(bus.drop_count() > 0);
    }
}
