use crate::state::Speaker;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};
use url::Url;

/// Normal closure negotiated by either endpoint.
pub const CLOSE_NORMAL: u16 = 1000;
/// Application-level close code: another call is already active for this
/// application. Non-retryable.
pub const CLOSE_DUPLICATE_CALL: u16 = 4409;

const OUTBOUND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Session control events pushed by the server. Events this client does
/// not know about map to `Other` instead of failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ControlEvent {
    AgentSpeaking,
    Listening,
    CallEnded,
    Other,
}

impl From<String> for ControlEvent {
    fn from(event: String) -> Self {
        match event.as_str() {
            "agent_speaking" => ControlEvent::AgentSpeaking,
            "listening" => ControlEvent::Listening,
            "call_ended" => ControlEvent::CallEnded,
            _ => ControlEvent::Other,
        }
    }
}

/// Frames the server may send. Unrecognized `type` values never reach the
/// controller; see [`parse_server_message`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Control {
        event: ControlEvent,
    },
    Transcript {
        speaker: Speaker,
        text: String,
    },
    AudioChunk {
        speaker: Speaker,
        #[serde(default)]
        codec: String,
        #[serde(default)]
        seq: u64,
        #[serde(default)]
        data_b64: String,
        #[serde(default)]
        is_final: bool,
    },
}

/// Frames the client sends. The candidate's voice reaches the server only
/// as sanitized `transcript` frames; there is no text-entry fallback.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Transcript { text: String },
}

/// Parse one text frame. Malformed JSON and unknown `type` discriminators
/// are ignored, not fatal.
pub fn parse_server_message(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => Some(msg),
        Err(e) => {
            log::debug!("[transport] ignoring frame: {}", e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub was_clean: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Code 1000 with a completed close handshake: the call ended normally.
    Clean,
    /// Code 4409: a call is already active for this application.
    DuplicateCall,
    /// Anything else: transient network-level failure, retryable.
    Abnormal,
}

impl CloseInfo {
    pub fn kind(&self) -> CloseKind {
        if self.code == CLOSE_DUPLICATE_CALL {
            CloseKind::DuplicateCall
        } else if self.code == CLOSE_NORMAL && self.was_clean {
            CloseKind::Clean
        } else {
            CloseKind::Abnormal
        }
    }
}

/// Inbound event stream of one socket connection. Exactly one `Closed` or
/// `Error` terminates the stream.
#[derive(Debug)]
pub enum TransportEvent {
    Message(ServerMessage),
    Closed(CloseInfo),
    Error(String),
}

/// One open call connection: typed sends in, typed events out.
pub struct Transport {
    outbound: mpsc::Sender<ClientMessage>,
    close_tx: mpsc::Sender<()>,
    events: mpsc::Receiver<TransportEvent>,
}

impl Transport {
    pub fn new(
        outbound: mpsc::Sender<ClientMessage>,
        close_tx: mpsc::Sender<()>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            close_tx,
            events,
        }
    }

    /// Queue a message. A send racing a close is dropped, never reordered.
    pub fn send(&self, msg: ClientMessage) {
        let _ = self.outbound.try_send(msg);
    }

    /// Request a normal closure (code 1000). Idempotent.
    pub fn close(&self) {
        let _ = self.close_tx.try_send(());
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }
}

/// Opens call connections. `connect` resolves once the socket is open and
/// fails with a retryable error otherwise.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, application_id: &str) -> Result<Transport, String>;
}

/// Derive the call socket URL from the HTTP base (http -> ws, https -> wss).
pub fn call_url(base_url: &str, application_id: &str) -> Result<Url, String> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let mut url =
        Url::parse(trimmed).map_err(|e| format!("invalid base url '{}': {}", trimmed, e))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(format!("unsupported scheme '{}'", other)),
    };
    url.set_scheme(scheme)
        .map_err(|_| format!("cannot derive socket scheme from '{}'", trimmed))?;
    url.set_path("/api/ws/call");
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("application_id", application_id);
    Ok(url)
}

/// Real transport over tokio-tungstenite.
pub struct WsTransportFactory {
    base_url: String,
}

impl WsTransportFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self, application_id: &str) -> Result<Transport, String> {
        let url = call_url(&self.base_url, application_id)?;
        println!("[transport] connecting: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| format!("connect failed: {}", e))?;
        println!("[transport] websocket connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<ClientMessage>(OUTBOUND_CHANNEL_CAPACITY);
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(EVENT_CHANNEL_CAPACITY);

        // Task: forward typed messages to the socket until closed.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => {
                        let msg = match msg {
                            Some(m) => m,
                            None => break,
                        };
                        let text = match serde_json::to_string(&msg) {
                            Ok(t) => t,
                            Err(e) => {
                                eprintln!("[transport] failed to encode message: {}", e);
                                continue;
                            }
                        };
                        if ws_tx
                            .send(tungstenite::Message::Text(text.into()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
            let frame = tungstenite::protocol::CloseFrame {
                code: tungstenite::protocol::frame::coding::CloseCode::Normal,
                reason: "".into(),
            };
            let _ = ws_tx.send(tungstenite::Message::Close(Some(frame))).await;
        });

        // Task: surface socket frames as typed events.
        tokio::spawn(async move {
            loop {
                let msg = match ws_rx.next().await {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        eprintln!("[transport] websocket error: {}", e);
                        let _ = event_tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                    None => {
                        // Stream ended without a close frame.
                        let _ = event_tx
                            .send(TransportEvent::Closed(CloseInfo {
                                code: 1006,
                                was_clean: false,
                                reason: String::new(),
                            }))
                            .await;
                        return;
                    }
                };

                match msg {
                    tungstenite::Message::Text(text) => {
                        if let Some(parsed) = parse_server_message(&text) {
                            if event_tx.send(TransportEvent::Message(parsed)).await.is_err() {
                                return;
                            }
                        }
                    }
                    tungstenite::Message::Close(frame) => {
                        let info = match frame {
                            Some(frame) => {
                                println!(
                                    "[transport] websocket closed: {} {}",
                                    frame.code, frame.reason
                                );
                                CloseInfo {
                                    code: frame.code.into(),
                                    was_clean: true,
                                    reason: frame.reason.to_string(),
                                }
                            }
                            None => {
                                println!("[transport] websocket closed");
                                CloseInfo {
                                    code: 1005,
                                    was_clean: true,
                                    reason: String::new(),
                                }
                            }
                        };
                        let _ = event_tx.send(TransportEvent::Closed(info)).await;
                        return;
                    }
                    // Binary, ping and pong frames are not part of the
                    // message contract.
                    _ => continue,
                }
            }
        });

        Ok(Transport::new(outbound_tx, close_tx, event_rx))
    }
}
