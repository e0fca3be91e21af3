//! Per-conversation fan-out of outbound events.
//!
//! Each conversation id maps to the set of live subscriber connections
//! watching it. Subscribers are compared by identity. Broadcast sends to a
//! snapshot of the group, so a slow or dead subscriber never holds the
//! group's shard lock, and removes every subscriber whose delivery failed
//! once the pass is over.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, error, warn};

use parley_core::events::ConversationEvent;
use parley_core::ids::ConversationId;

use crate::error::DeliveryError;

/// One subscriber connection as seen by the registry.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, frame: &str) -> Result<(), DeliveryError>;
}

pub type Subscriber = Arc<dyn EventSink>;

fn same_subscriber(a: &Subscriber, b: &Subscriber) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Outcome of one broadcast pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: usize,
}

pub struct ConnectionGroups {
    groups: DashMap<ConversationId, Vec<Subscriber>>,
    send_timeout: Duration,
}

impl ConnectionGroups {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            send_timeout,
        }
    }

    /// Returns `false` if this connection was already in the group.
    pub fn subscribe(&self, key: &ConversationId, subscriber: Subscriber) -> bool {
        let mut group = self.groups.entry(key.clone()).or_default();
        if group.iter().any(|s| same_subscriber(s, &subscriber)) {
            return false;
        }
        group.push(subscriber);
        debug!(conversation_id = %key, subscribers = group.len(), "subscriber added");
        true
    }

    /// Returns whether the connection was present. Drops the group when it
    /// becomes empty.
    pub fn unsubscribe(&self, key: &ConversationId, subscriber: &Subscriber) -> bool {
        let Entry::Occupied(mut entry) = self.groups.entry(key.clone()) else {
            return false;
        };
        let before = entry.get().len();
        entry.get_mut().retain(|s| !same_subscriber(s, subscriber));
        let removed = entry.get().len() != before;
        if entry.get().is_empty() {
            entry.remove();
            debug!(conversation_id = %key, "group removed");
        }
        removed
    }

    /// Deliver `event` to every subscriber of its conversation. Failed
    /// subscribers are unsubscribed after the pass; nothing is returned to the
    /// caller as an error.
    pub async fn broadcast(&self, event: &ConversationEvent) -> BroadcastReport {
        let key = event.conversation_id();
        let snapshot: Vec<Subscriber> = match self.groups.get(key) {
            Some(group) => group.clone(),
            None => return BroadcastReport::default(),
        };

        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(conversation_id = %key, kind = event.kind(), error = %e, "failed to encode event");
                return BroadcastReport::default();
            }
        };

        let attempts = snapshot.iter().map(|subscriber| {
            let frame = frame.as_str();
            async move {
                match tokio::time::timeout(self.send_timeout, subscriber.send(frame)).await {
                    Ok(result) => result,
                    Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
                }
            }
        });
        let results = join_all(attempts).await;

        let mut report = BroadcastReport::default();
        for (subscriber, result) in snapshot.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(conversation_id = %key, kind = event.kind(), error = %e, "dropping subscriber");
                    if self.unsubscribe(key, subscriber) {
                        report.removed += 1;
                    }
                }
            }
        }

        debug!(
            conversation_id = %key,
            kind = event.kind(),
            delivered = report.delivered,
            removed = report.removed,
            "broadcast complete"
        );
        report
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn subscriber_count(&self, key: &ConversationId) -> usize {
        self.groups.get(key).map(|g| g.len()).unwrap_or(0)
    }

    pub fn total_subscribers(&self) -> usize {
        self.groups.iter().map(|g| g.value().len()).sum()
    }

    pub fn contains_group(&self, key: &ConversationId) -> bool {
        self.groups.contains_key(key)
    }
}
