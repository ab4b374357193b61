//! WebSocket hubs and stream handlers.
//!
//! Two independent hubs back the streaming endpoints: metrics (throttled to
//! one broadcast per 100 ms) and notifications (unthrottled). A connection
//! whose send buffer is full is disconnected rather than allowed to stall
//! the broadcast loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::server::AppState;

const CLIENT_BUFFER: usize = 100;

const ADJECTIVES: &[&str] = &[
    "Quick", "Lazy", "Happy", "Sad", "Brave", "Clever", "Calm", "Bold",
];
const ANIMALS: &[&str] = &["Fox", "Dog", "Cat", "Bear", "Wolf", "Lion", "Tiger", "Hawk"];

fn random_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"Quick");
    let animal = ANIMALS.choose(&mut rng).unwrap_or(&"Fox");
    format!("{adjective}{animal}")
}

struct WsClient {
    name: String,
    tx: mpsc::Sender<String>,
}

/// Set of active WebSocket connections with broadcast fan-out.
pub struct WsHub {
    clients: Mutex<HashMap<u64, WsClient>>,
    next_id: AtomicU64,
    min_broadcast_interval: Option<Duration>,
    last_broadcast: Mutex<Option<Instant>>,
}

impl WsHub {
    /// `min_broadcast_interval` throttles broadcasts while at least one
    /// client is connected; `None` broadcasts everything.
    pub fn new(min_broadcast_interval: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            min_broadcast_interval,
            last_broadcast: Mutex::new(None),
        })
    }

    /// Registers a connection, generating a name when none is supplied.
    fn register(&self, name: Option<String>) -> (u64, String, mpsc::Receiver<String>) {
        let name = match name {
            Some(name) if !name.trim().is_empty() => name,
            _ => random_name(),
        };
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock();
        clients.insert(
            id,
            WsClient {
                name: name.clone(),
                tx,
            },
        );
        tracing::debug!(client = id, name = %name, total = clients.len(), "ws client registered");
        (id, name, rx)
    }

    fn unregister(&self, id: u64) {
        let mut clients = self.clients.lock();
        if clients.remove(&id).is_some() {
            tracing::debug!(client = id, total = clients.len(), "ws client unregistered");
        }
    }

    /// Names of all connected clients.
    pub fn client_names(&self) -> Vec<String> {
        self.clients.lock().values().map(|c| c.name.clone()).collect()
    }

    /// Broadcasts a message to every connection. A client whose buffer is
    /// full is dropped; its pump sees the closed channel and shuts the
    /// socket.
    pub fn broadcast(&self, message: String) {
        if let Some(min_interval) = self.min_broadcast_interval {
            let mut last = self.last_broadcast.lock();
            if let Some(previous) = *last {
                if !self.clients.lock().is_empty() && previous.elapsed() < min_interval {
                    tracing::trace!("throttling ws broadcast");
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let mut stale = Vec::new();
        {
            let clients = self.clients.lock();
            for (id, client) in clients.iter() {
                match client.tx.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(client = id, name = %client.name, "ws buffer full, disconnecting");
                        stale.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => stale.push(*id),
                }
            }
        }
        for id in stale {
            self.unregister(id);
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub name: Option<String>,
}

/// `GET /api/ws/metrics`
pub async fn ws_metrics(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.dashboard.metrics_hub();
    ws.on_upgrade(move |socket| async move {
        let (id, _name, rx) = hub.register(query.name);
        pump(socket, rx).await;
        hub.unregister(id);
    })
}

/// `GET /api/ws/notifications`
pub async fn ws_notifications(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let dashboard = state.dashboard;
    ws.on_upgrade(move |socket| async move {
        let hub = dashboard.notify_hub();
        let (id, name, rx) = hub.register(query.name);
        dashboard.notify(
            "joined",
            json!({"joined": name, "all": hub.client_names()}),
        );

        pump(socket, rx).await;

        hub.unregister(id);
        dashboard.notify("left", json!({"left": name, "all": hub.client_names()}));
    })
}

/// Forwards hub messages to the socket and watches for the peer closing.
async fn pump(socket: WebSocket, mut rx: mpsc::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Dropped by the hub (stale or shutting down)
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                // We only read to notice disconnects
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}
