use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::lease::LeaseId;
use crate::worker::{BackendStatus, WorkerId};

/// Metadata envelope attached to every pool event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            worker_id,
            timestamp: Utc::now(),
        }
    }
}

/// Pool event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolEvent {
    pub meta: EventMeta,
    pub payload: PoolEventPayload,
}

impl PoolEvent {
    pub fn new(worker_id: WorkerId, payload: PoolEventPayload) -> Self {
        Self {
            meta: EventMeta::new(worker_id),
            payload,
        }
    }
}

/// Event payload emitted for worker lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PoolEventPayload {
    /// Worker was added to the pool.
    Registered { type_id: String, is_real: bool },
    /// Worker status changed.
    StatusChanged {
        from: BackendStatus,
        to: BackendStatus,
    },
    /// Worker settings were replaced.
    Edited { modcount: u64 },
    /// Worker was leased.
    LeaseAcquired { lease_id: LeaseId },
    /// Lease was released.
    LeaseReleased { lease_id: LeaseId },
    /// Worker was removed from the pool.
    Deleted,
}

/// Sink for pool events.
#[async_trait]
pub trait PoolEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: PoolEvent) -> anyhow::Result<()>;

    /// Subscribe to events, returning a broadcast receiver.
    fn subscribe(&self) -> broadcast::Receiver<PoolEvent>;
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for slow subscribers; a subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged`. Publishing with
/// no subscribers is not an error.
pub struct InProcEventBus {
    sender: broadcast::Sender<PoolEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Publish without awaiting; used from synchronous pool paths.
    pub fn emit(&self, event: PoolEvent) {
        // Err only means there are no subscribers right now.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl PoolEventPublisher for InProcEventBus {
    async fn publish(&self, event: PoolEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_to_all_subscribers() {
        let bus = InProcEventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(PoolEvent::new(
            WorkerId(1),
            PoolEventPayload::StatusChanged {
                from: BackendStatus::Loading,
                to: BackendStatus::Running,
            },
        ))
        .await
        .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.meta.worker_id, WorkerId(1));
            assert!(matches!(
                event.payload,
                PoolEventPayload::StatusChanged {
                    to: BackendStatus::Running,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(1);
        bus.publish(PoolEvent::new(WorkerId(9), PoolEventPayload::Deleted))
            .await
            .unwrap();
    }

    #[test]
    fn payload_serializes_with_tag() {
        let json = serde_json::to_value(PoolEventPayload::Edited { modcount: 2 }).unwrap();
        assert_eq!(json["event"], "edited");
        assert_eq!(json["modcount"], 2);
    }
}
