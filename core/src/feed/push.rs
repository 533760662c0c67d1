/// Push strategy: one WebSocket per view, frames dispatched by their `type` field
use super::{FeedEvent, FeedSender, IncrementalFeed};
use crate::config::ReconnectPolicy;
use crate::error::Result;
use crate::model::Id;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Frame categories understood by the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Added,
    Updated,
    Deleted,
}

impl FrameKind {
    pub fn from_type(kind: &str) -> Option<Self> {
        match kind {
            "item_added" | "new_message" | "message" | "new_question" | "question" => {
                Some(FrameKind::Added)
            }
            "item_updated" | "message_updated" | "question_updated" | "upvote"
            | "vote_update" => Some(FrameKind::Updated),
            "item_deleted" | "message_deleted" | "question_deleted" => Some(FrameKind::Deleted),
            _ => None,
        }
    }
}

/// Payload object of a frame. Accepts `{type, payload: {...}}` as well as the
/// flat `{type, id, ...}` shape.
fn frame_payload(frame: &Map<String, Value>) -> Map<String, Value> {
    for key in ["payload", "message", "question", "data"] {
        if let Some(Value::Object(inner)) = frame.get(key) {
            return inner.clone();
        }
    }
    let mut flat = frame.clone();
    flat.remove("type");
    flat
}

fn payload_id(payload: &Map<String, Value>) -> Option<Id> {
    payload
        .get("id")
        .and_then(|v| serde_json::from_value::<Id>(v.clone()).ok())
}

/// Decode one text frame. Malformed or unknown frames are logged and dropped.
pub fn parse_frame(text: &str) -> Option<FeedEvent> {
    let frame = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!("Dropping non-object frame");
            return None;
        }
        Err(e) => {
            warn!("Dropping unparseable frame: {}", e);
            return None;
        }
    };

    let Some(kind) = frame.get("type").and_then(Value::as_str) else {
        warn!("Dropping frame without a type");
        return None;
    };
    let Some(category) = FrameKind::from_type(kind) else {
        warn!("Dropping frame of unknown type '{}'", kind);
        return None;
    };

    let mut payload = frame_payload(&frame);
    let Some(id) = payload_id(&payload) else {
        warn!("Dropping '{}' frame without an id", kind);
        return None;
    };

    Some(match category {
        FrameKind::Added => FeedEvent::Batch(Value::Array(vec![Value::Object(payload)])),
        FrameKind::Updated => {
            payload.remove("id");
            FeedEvent::PointUpdate { id, patch: payload }
        }
        FrameKind::Deleted => FeedEvent::PointRemoval { id },
    })
}

pub struct PushFeed {
    url: String,
    reconnect: ReconnectPolicy,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl PushFeed {
    /// `url` already carries the channel id and the token (see `routes::socket_url`).
    pub fn new(url: impl Into<String>, reconnect: ReconnectPolicy) -> Self {
        Self {
            url: url.into(),
            reconnect,
            shutdown: None,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl IncrementalFeed for PushFeed {
    fn start(&mut self, events: FeedSender) -> Result<()> {
        self.stop();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let url = self.url.clone();
        let policy = self.reconnect.clone();
        self.task = Some(tokio::spawn(run_socket(url, policy, events, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Signals the socket task, which closes the connection if it is still open.
    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        self.task = None;
    }

    fn name(&self) -> &'static str {
        "push"
    }
}

impl Drop for PushFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How a connected session ended
enum SessionEnd {
    /// Stop requested or nobody is listening any more; do not reconnect
    Finished,
    /// Server closed or the transport failed
    Dropped,
}

fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

async fn run_socket(
    url: String,
    policy: ReconnectPolicy,
    events: FeedSender,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let connected = tokio::select! {
            r = connect_async(url.as_str()) => r,
            _ = shutdown.changed() => return,
        };

        match connected {
            Ok((socket, _)) => {
                info!("Push channel connected to {}", redact(&url));
                attempt = 0;
                match run_session(socket, &events, &mut shutdown).await {
                    SessionEnd::Finished => return,
                    SessionEnd::Dropped => warn!("Push channel {} dropped", redact(&url)),
                }
            }
            Err(e) => warn!("Push channel connect to {} failed: {}", redact(&url), e),
        }

        if !policy.enabled() || attempt >= policy.max_attempts {
            info!("Push channel {} stopped; reload the view to resume", redact(&url));
            return;
        }
        attempt += 1;
        let delay = policy.delay_for(attempt);
        debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}

async fn run_session(
    socket: Socket,
    events: &FeedSender,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                close_gracefully(&mut write, &mut read).await;
                return SessionEnd::Finished;
            }
            next = read.next() => {
                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Server closed push channel: {:?}", frame);
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Push channel read error: {}", e);
                        return SessionEnd::Dropped;
                    }
                    None => return SessionEnd::Dropped,
                };

                if let Some(event) = parse_frame(&text) {
                    if events.send(event).is_err() {
                        close_gracefully(&mut write, &mut read).await;
                        return SessionEnd::Finished;
                    }
                }
            }
        }
    }
}

async fn close_gracefully(write: &mut SplitSink<Socket, Message>, read: &mut SplitStream<Socket>) {
    if let Err(e) = write.send(Message::Close(None)).await {
        debug!("Close frame not sent: {}", e);
        return;
    }
    // Drain until the server acknowledges, bounded so teardown never hangs.
    let drain = async {
        while let Some(Ok(msg)) = read.next().await {
            if msg.is_close() {
                break;
            }
        }
    };
    let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await;
}
