use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

use crate::db::models::CopyStatus;
use crate::repository::restic::{BackupProgress, BackupSummary};
use crate::types::{BackupStatus, VolumeStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum Event {
    #[serde(rename = "backup:started")]
    BackupStarted {
        schedule_id: String,
        schedule: String,
        volume: String,
        repository: String,
    },
    #[serde(rename = "backup:progress")]
    BackupProgress {
        schedule_id: String,
        progress: BackupProgress,
    },
    #[serde(rename = "backup:completed")]
    BackupCompleted {
        schedule_id: String,
        status: BackupStatus,
        error: Option<String>,
        summary: Option<BackupSummary>,
    },
    #[serde(rename = "volume:mounted")]
    VolumeMounted { volume_id: String, name: String },
    #[serde(rename = "volume:unmounted")]
    VolumeUnmounted { volume_id: String, name: String },
    #[serde(rename = "volume:status_changed")]
    VolumeStatusChanged {
        volume_id: String,
        name: String,
        status: VolumeStatus,
        error: Option<String>,
    },
    #[serde(rename = "mirror:started")]
    MirrorStarted {
        schedule_id: String,
        repository_id: String,
    },
    #[serde(rename = "mirror:completed")]
    MirrorCompleted {
        schedule_id: String,
        repository_id: String,
        status: CopyStatus,
        error: Option<String>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::BackupStarted { .. } => "backup:started",
            Event::BackupProgress { .. } => "backup:progress",
            Event::BackupCompleted { .. } => "backup:completed",
            Event::VolumeMounted { .. } => "volume:mounted",
            Event::VolumeUnmounted { .. } => "volume:unmounted",
            Event::VolumeStatusChanged { .. } => "volume:status_changed",
            Event::MirrorStarted { .. } => "mirror:started",
            Event::MirrorCompleted { .. } => "mirror:completed",
        }
    }
}

/// Fan-out of lifecycle events. Emitting never blocks; slow subscribers
/// miss events instead of holding up the publisher.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: Event) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event = name, receivers, "event emitted"),
            Err(_) => trace!(event = name, "event dropped; no subscribers"),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            inner: BroadcastStream::new(self.sender.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A live event stream. Dropping it unsubscribes immediately.
pub struct Subscription {
    inner: BroadcastStream<Event>,
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_receive_events_and_unsubscribe_on_drop() {
        let bus = EventBus::new();
        bus.emit(Event::VolumeMounted {
            volume_id: "v0".to_string(),
            name: "lost".to_string(),
        });

        let mut first = bus.subscribe();
        let second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(Event::VolumeMounted {
            volume_id: "v1".to_string(),
            name: "media".to_string(),
        });
        let event = first.next().await.expect("event");
        assert_eq!(event.name(), "volume:mounted");

        drop(second);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn events_serialize_with_their_wire_name() {
        let event = Event::MirrorStarted {
            schedule_id: "s1".to_string(),
            repository_id: "r2".to_string(),
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["event"], "mirror:started");
        assert_eq!(json["scheduleId"], "s1");
    }
}
