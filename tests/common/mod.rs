#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use geoshare::relay::server;
use geoshare::{EchoPolicy, RelayHub};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestRelay {
    pub addr: SocketAddr,
    pub hub: RelayHub,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    pub async fn start(echo: EchoPolicy) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let hub = RelayHub::new(echo);
        let (tx, rx) = oneshot::channel::<()>();

        tokio::spawn(server::serve_with_shutdown(listener, hub.clone(), async move {
            let _ = rx.await;
        }));

        Self {
            addr,
            hub,
            shutdown: Some(tx),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn raw_client(&self) -> (SplitSink<Ws, Message>, SplitStream<Ws>) {
        let (ws, _) = tokio_tungstenite::connect_async(self.url())
            .await
            .expect("ws connect");
        ws.split()
    }

    /// Wait until the hub has registered exactly `n` connections.
    pub async fn wait_for_connections(&self, n: usize) {
        timeout(Duration::from_secs(3), async {
            while self.hub.connection_count() != n {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("hub never reached {n} connections"));
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn update_frame(id: &str, lat: f64, lng: f64) -> Message {
    let text = serde_json::json!({
        "event": "locationUpdate",
        "data": {"id": id, "lat": lat, "lng": lng}
    })
    .to_string();
    Message::Text(text.into())
}

pub async fn send(write: &mut SplitSink<Ws, Message>, msg: Message) {
    write.send(msg).await.expect("ws send");
}

/// Next `locationUpdate` payload, or None if nothing arrives within `wait`.
pub async fn next_update(read: &mut SplitStream<Ws>, wait: Duration) -> Option<Value> {
    timeout(wait, async {
        while let Some(msg) = read.next().await {
            if let Ok(Message::Text(t)) = msg {
                let value: Value = serde_json::from_str(t.as_str()).ok()?;
                if value["event"] == "locationUpdate" {
                    return Some(value["data"].clone());
                }
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

pub async fn eventually<F: Fn() -> bool>(check: F) {
    timeout(Duration::from_secs(3), async {
        while !check() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}
