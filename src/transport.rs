//! Transport channel
//!
//! A message-oriented link from one participant to the relay, carrying
//! named events. Two links are available: a WebSocket connection to a
//! remote relay, and a direct in-process attachment to a [`RelayHub`].
//! Both deliver inbound events in arrival order on a single task.
//!
//! One handler is kept per event name; `on` replaces any previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::{with_retry, GeoError, RetryPolicy};
use crate::protocol::Envelope;
use crate::relay::RelayHub;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

enum Outgoing {
    Frame(String),
    Close,
}

/// State shared with the background tasks.
struct Shared {
    handlers: DashMap<String, Handler>,
    connected: AtomicBool,
    closed: Notify,
}

impl Shared {
    fn dispatch(&self, text: &str) {
        if !self.connected.load(Ordering::Acquire) {
            return;
        }
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!("dropping inbound frame: {e}");
                return;
            }
        };

        // clone out so a handler may call on/off without deadlocking the map
        let handler = self
            .handlers
            .get(&envelope.event)
            .map(|h| h.value().clone());
        match handler {
            Some(handler) => handler(&envelope.data),
            None => tracing::trace!(event = %envelope.event, "no handler registered"),
        }
    }

    fn mark_closed(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::warn!("channel disconnected");
        }
        self.closed.notify_waiters();
    }
}

#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    reader: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Channel {
    /// Connect to a relay over WebSocket, retrying per `policy`.
    pub async fn connect(url: &str, policy: &RetryPolicy) -> Result<Self, GeoError> {
        let url = Url::parse(url).map_err(|e| GeoError::Config(format!("invalid ws url: {e}")))?;

        let target = &url;
        let (ws_stream, _) = with_retry(policy, || async move {
            tokio_tungstenite::connect_async(target.as_str())
                .await
                .map_err(|e| GeoError::Transport(e.to_string()))
        })
        .await?;
        tracing::info!(%url, "connected to relay");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let shared = Self::new_shared();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();

        // local -> relay
        let writer_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(out) = outbound_rx.recv().await {
                match out {
                    Outgoing::Frame(text) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_shared.mark_closed();
        });

        // relay -> local
        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => reader_shared.dispatch(text.as_str()),
                    Ok(Message::Binary(bin)) => {
                        if let Ok(text) = std::str::from_utf8(&bin) {
                            reader_shared.dispatch(text);
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("websocket error: {e}");
                        break;
                    }
                }
            }
            reader_shared.mark_closed();
        });

        Ok(Self::assemble(shared, outbound, reader))
    }

    /// Attach directly to a hub running in this process.
    pub fn in_process(hub: &RelayHub) -> Self {
        let (conn_id, mut inbound) = hub.on_connect();
        let shared = Self::new_shared();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();

        let writer_hub = hub.clone();
        let writer_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(out) = outbound_rx.recv().await {
                match out {
                    Outgoing::Frame(text) => {
                        writer_hub.on_message(conn_id, &text);
                    }
                    Outgoing::Close => break,
                }
            }
            writer_hub.on_disconnect(conn_id);
            writer_shared.mark_closed();
        });

        let reader_shared = shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                reader_shared.dispatch(&frame);
            }
            reader_shared.mark_closed();
        });

        Self::assemble(shared, outbound, reader)
    }

    fn new_shared() -> Arc<Shared> {
        Arc::new(Shared {
            handlers: DashMap::new(),
            connected: AtomicBool::new(true),
            closed: Notify::new(),
        })
    }

    fn assemble(
        shared: Arc<Shared>,
        outbound: mpsc::UnboundedSender<Outgoing>,
        reader: JoinHandle<()>,
    ) -> Self {
        Self {
            shared,
            outbound,
            reader: Arc::new(Mutex::new(Some(reader))),
        }
    }

    pub fn emit(&self, event: &str, payload: Value) -> Result<(), GeoError> {
        if !self.is_connected() {
            return Err(GeoError::ChannelDisconnected);
        }
        let frame = Envelope::new(event, payload).encode();
        self.outbound
            .send(Outgoing::Frame(frame))
            .map_err(|_| GeoError::ChannelDisconnected)
    }

    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .insert(event.to_string(), Arc::new(handler));
    }

    pub fn off(&self, event: &str) {
        self.shared.handlers.remove(event);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Resolves once the link is gone, whether closed locally or by the relay.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.closed.notified();
            if !self.is_connected() {
                return;
            }
            notified.await;
        }
    }

    /// Close the link and drop every handler. Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.shared.handlers.clear();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
            let _ = self.outbound.send(Outgoing::Close);
            self.shared.mark_closed();
            tracing::debug!("channel torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::{LocationSample, LOCATION_UPDATE};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_in_process_delivery() {
        let hub = RelayHub::default();
        let a = Channel::in_process(&hub);
        let b = Channel::in_process(&hub);

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.on(LOCATION_UPDATE, move |payload| {
            let _ = tx.send(payload.clone());
        });

        a.emit(LOCATION_UPDATE, LocationSample::new("A", 1.0, 2.0).to_payload())
            .unwrap();

        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(LocationSample::from_payload(&got).unwrap(), LocationSample::new("A", 1.0, 2.0));
    }

    #[tokio::test]
    async fn test_off_stops_delivery() {
        let hub = RelayHub::default();
        let a = Channel::in_process(&hub);
        let b = Channel::in_process(&hub);

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        b.on(LOCATION_UPDATE, move |payload| {
            let _ = tx.send(payload.clone());
        });
        b.off(LOCATION_UPDATE);

        a.emit(LOCATION_UPDATE, LocationSample::new("A", 1.0, 2.0).to_payload())
            .unwrap();
        // the handler (and its sender) is gone, so nothing can arrive
        assert!(!matches!(
            timeout(Duration::from_millis(200), rx.recv()).await,
            Ok(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub = RelayHub::default();
        let a = Channel::in_process(&hub);
        assert_eq!(hub.connection_count(), 1);

        a.disconnect();
        a.disconnect();
        timeout(Duration::from_secs(1), a.closed()).await.unwrap();

        assert!(!a.is_connected());
        assert!(matches!(
            a.emit(LOCATION_UPDATE, Value::Null),
            Err(GeoError::ChannelDisconnected)
        ));

        // writer task unregisters from the hub
        timeout(Duration::from_secs(1), async {
            while hub.connection_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connect_bad_url() {
        let result = Channel::connect("not a url", &RetryPolicy::no_retry()).await;
        assert!(matches!(result, Err(GeoError::Config(_))));
    }
}
