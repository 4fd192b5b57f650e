//! Subscription transport.
//!
//! Wraps one [`broadcast::Receiver`] into a lazy, cancellable sequence
//! filtered to a single `(topic, session-id)`. At-most-once: a lagged
//! receiver (slow client, full channel) is treated as dropped events, not an
//! error — clients recover by re-reading the message store, which is the
//! durable source of truth the bus never tries to be.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::Stream;
use tokio::sync::{Notify, broadcast};
use tracing::warn;
use uuid::Uuid;

use super::bus::{Event, EventBus};

/// Which of the three per-session topics a subscription watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Session,
    Messages,
    Agent,
}

/// One event delivered to a subscriber, tagged with a client-visible
/// identifier: the message-id for `messages`, `<session>-<running>`
/// for `agent`, and the new status for `session`.
#[derive(Debug, Clone)]
pub struct SubscriptionItem {
    pub client_id: String,
    pub event: Event,
}

fn client_id_for(event: &Event) -> String {
    match event {
        Event::SessionUpdate { session_id, status } => format!("{session_id}-{status:?}"),
        Event::NewMessage { message_id, .. } => message_id.clone(),
        Event::AgentRunning { session_id, running } => format!("{session_id}-{running}"),
    }
}

/// An external cancellation signal a caller can flip to end a subscription
/// within one event-loop turn.
#[derive(Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A single subscription: registers a receiver against the bus, then hands
/// back a lazy stream filtered to one topic and session.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    session_id: Uuid,
    topic: Topic,
    cancel: CancelSignal,
}

impl Subscription {
    pub fn new(bus: &EventBus, session_id: Uuid, topic: Topic) -> (Self, CancelSignal) {
        let cancel = CancelSignal::new();
        let sub = Self { receiver: bus.subscribe(), session_id, topic, cancel: cancel.clone() };
        (sub, cancel)
    }

    fn matches(&self, event: &Event) -> bool {
        if event.session_id() != self.session_id {
            return false;
        }
        matches!(
            (self.topic, event),
            (Topic::Session, Event::SessionUpdate { .. })
                | (Topic::Messages, Event::NewMessage { .. })
                | (Topic::Agent, Event::AgentRunning { .. })
        )
    }

    /// Turn this subscription into a lazy stream of matching, client-tagged items.
    pub fn into_stream(self) -> impl Stream<Item = SubscriptionItem> {
        futures::stream::unfold(self, |mut sub| async move {
            loop {
                if sub.cancel.is_cancelled() {
                    return None;
                }
                tokio::select! {
                    biased;
                    _ = sub.cancel.notify.notified() => {
                        if sub.cancel.is_cancelled() {
                            return None;
                        }
                    }
                    received = sub.receiver.recv() => {
                        match received {
                            Ok(event) if sub.matches(&event) => {
                                let item = SubscriptionItem { client_id: client_id_for(&event), event };
                                return Some((item, sub));
                            }
                            Ok(_) => continue,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(
                                    "subscription for session {} topic {:?} lagged, dropped {} events",
                                    sub.session_id, sub.topic, skipped
                                );
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::SessionStatus;
    use futures::StreamExt;

    #[tokio::test]
    async fn filters_to_matching_session_and_topic() {
        let bus = EventBus::new();
        let session_id = Uuid::new_v4();
        let other_session = Uuid::new_v4();
        let (sub, _cancel) = Subscription::new(&bus, session_id, Topic::Agent);
        let mut stream = Box::pin(sub.into_stream());

        bus.emit_session_update(session_id, SessionStatus::Running); // wrong topic
        bus.emit_agent_running(other_session, true); // wrong session
        bus.emit_agent_running(session_id, true); // match

        let item = stream.next().await.unwrap();
        assert!(matches!(item.event, Event::AgentRunning { running: true, .. }));
        assert_eq!(item.client_id, format!("{session_id}-true"));
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let bus = EventBus::new();
        let session_id = Uuid::new_v4();
        let (sub, cancel) = Subscription::new(&bus, session_id, Topic::Agent);
        let mut stream = Box::pin(sub.into_stream());

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn message_events_are_tagged_by_message_id() {
        let bus = EventBus::new();
        let session_id = Uuid::new_v4();
        let (sub, _cancel) = Subscription::new(&bus, session_id, Topic::Messages);
        let mut stream = Box::pin(sub.into_stream());

        bus.emit_new_message(session_id, 0, "msg_1", "{}");
        let item = stream.next().await.unwrap();
        assert_eq!(item.client_id, "msg_1");
    }
}
