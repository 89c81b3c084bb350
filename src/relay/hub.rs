//! Relay hub
//!
//! Holds the set of live connections and fans every `locationUpdate`
//! frame out to them verbatim. The hub keeps no location history and
//! attaches no identity to a connection; identity lives only inside the
//! payloads it forwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::location::LOCATION_UPDATE;
use crate::protocol::Envelope;

pub type ConnectionId = Uuid;

/// Frames buffered per connection before further broadcasts to it are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A text frame shared across every recipient of one broadcast.
pub type Frame = Arc<str>;

/// Whether the sender of an update also receives it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPolicy {
    /// Never deliver an update back to its sender
    #[default]
    ExcludeSender,
    IncludeSender,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub forwarded: u64,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    // write-locked only on connect/disconnect, so no broadcast sees a half-updated set
    connections: RwLock<HashMap<ConnectionId, mpsc::Sender<Frame>>>,
    echo: EchoPolicy,
    queue_capacity: usize,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(EchoPolicy::default())
    }
}

impl RelayHub {
    pub fn new(echo: EchoPolicy) -> Self {
        Self::with_queue_capacity(echo, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(echo: EchoPolicy, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: RwLock::new(HashMap::new()),
                echo,
                queue_capacity: queue_capacity.max(1),
                forwarded: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn echo_policy(&self) -> EchoPolicy {
        self.inner.echo
    }

    /// Register a new connection. Frames for it arrive on the returned receiver.
    pub fn on_connect(&self) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);

        let count = {
            let mut connections = self.inner.connections.write();
            connections.insert(id, tx);
            connections.len()
        };
        tracing::info!(connection = %id, connections = count, "participant connected");

        (id, rx)
    }

    /// Handle one inbound text frame from `from`.
    ///
    /// Returns the number of connections the frame was delivered to.
    /// Frames that are not `locationUpdate` envelopes are dropped; the
    /// payload itself is never inspected. A connection whose queue is full
    /// misses this frame and it is counted as dropped.
    pub fn on_message(&self, from: ConnectionId, text: &str) -> usize {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(connection = %from, "dropping frame: {e}");
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        };
        if envelope.event != LOCATION_UPDATE {
            tracing::debug!(connection = %from, event = %envelope.event, "dropping unknown event");
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let frame: Frame = Arc::from(text);
        let mut delivered = 0;
        let mut lagging = 0;
        let mut closed = Vec::new();
        {
            let connections = self.inner.connections.read();
            if !connections.contains_key(&from) {
                tracing::debug!(connection = %from, "frame from unregistered connection");
                return 0;
            }

            for (id, tx) in connections.iter() {
                if *id == from && self.inner.echo == EchoPolicy::ExcludeSender {
                    continue;
                }
                match tx.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(connection = %id, "queue full; frame dropped");
                        lagging += 1;
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        // receivers that went away without a disconnect
        for id in closed {
            self.on_disconnect(id);
        }

        self.inner
            .forwarded
            .fetch_add(delivered as u64, Ordering::Relaxed);
        if lagging > 0 {
            self.inner.dropped.fetch_add(lagging, Ordering::Relaxed);
        }
        tracing::trace!(connection = %from, delivered, "relayed location update");
        delivered
    }

    /// Remove a connection. Unknown ids are ignored.
    pub fn on_disconnect(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut connections = self.inner.connections.write();
            let removed = connections.remove(&id).is_some();
            (removed, connections.len())
        };
        if removed {
            tracing::info!(connection = %id, connections = count, "participant disconnected");
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connection_count(),
            forwarded: self.inner.forwarded.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationSample;

    fn update(id: &str, lat: f64, lng: f64) -> String {
        Envelope::location_update(&LocationSample::new(id, lat, lng)).encode()
    }

    #[test]
    fn test_fan_out_excludes_sender() {
        let hub = RelayHub::default();
        let (a, mut rx_a) = hub.on_connect();
        let (_b, mut rx_b) = hub.on_connect();
        let (_c, mut rx_c) = hub.on_connect();

        let frame = update("A", 10.0, 20.0);
        assert_eq!(hub.on_message(a, &frame), 2);

        assert_eq!(rx_b.try_recv().unwrap().as_ref(), frame);
        assert_eq!(rx_c.try_recv().unwrap().as_ref(), frame);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_fan_out_with_echo() {
        let hub = RelayHub::new(EchoPolicy::IncludeSender);
        let (a, mut rx_a) = hub.on_connect();
        let (_b, mut rx_b) = hub.on_connect();

        let frame = update("A", 1.0, 2.0);
        assert_eq!(hub.on_message(a, &frame), 2);
        assert_eq!(rx_a.try_recv().unwrap().as_ref(), frame);
        assert_eq!(rx_b.try_recv().unwrap().as_ref(), frame);
    }

    #[test]
    fn test_disconnect_excludes_connection() {
        let hub = RelayHub::default();
        let (a, _rx_a) = hub.on_connect();
        let (b, rx_b) = hub.on_connect();
        let (_c, mut rx_c) = hub.on_connect();

        assert!(hub.on_disconnect(b));
        drop(rx_b);

        assert_eq!(hub.on_message(a, &update("A", 1.0, 1.0)), 1);
        assert!(rx_c.try_recv().is_ok());
        assert!(!hub.on_disconnect(b));
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let hub = RelayHub::default();
        let (a, _rx_a) = hub.on_connect();
        let (_b, rx_b) = hub.on_connect();
        drop(rx_b);

        assert_eq!(hub.on_message(a, &update("A", 1.0, 1.0)), 0);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn test_payload_forwarded_unvalidated() {
        let hub = RelayHub::default();
        let (a, _rx_a) = hub.on_connect();
        let (_b, mut rx_b) = hub.on_connect();

        let frame = r#"{"event":"locationUpdate","data":{"id":"A"}}"#;
        assert_eq!(hub.on_message(a, frame), 1);
        assert_eq!(rx_b.try_recv().unwrap().as_ref(), frame);
    }

    #[test]
    fn test_stalled_connection_queue_is_bounded() {
        let hub = RelayHub::with_queue_capacity(EchoPolicy::ExcludeSender, 4);
        let (a, _rx_a) = hub.on_connect();
        let (_stalled, mut rx_stalled) = hub.on_connect();
        let (_live, mut rx_live) = hub.on_connect();

        for i in 0..10 {
            let frame = update("A", i as f64, 0.0);
            hub.on_message(a, &frame);
            // the reading connection keeps up
            assert_eq!(rx_live.try_recv().unwrap().as_ref(), frame);
        }

        let mut queued = 0;
        while rx_stalled.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);
        assert_eq!(hub.stats().dropped, 6);
        assert_eq!(hub.stats().forwarded, 14);
        assert_eq!(hub.connection_count(), 3);
    }

    #[test]
    fn test_non_update_frames_dropped() {
        let hub = RelayHub::default();
        let (a, _rx_a) = hub.on_connect();
        let (_b, mut rx_b) = hub.on_connect();

        assert_eq!(hub.on_message(a, "garbage"), 0);
        assert_eq!(hub.on_message(a, r#"{"event":"chat","data":"hi"}"#), 0);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.stats().dropped, 2);
    }
}
