use super::{RecognizerEvent, RecognizerFactory, RecognizerOptions, SpeechRecognizer};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const KEEPALIVE_INTERVAL_SECS: u64 = 5;
/// Pause before reporting `Ended` after a failed session, so a persistent
/// engine outage cannot turn the restart path into a hot loop.
const RESTART_BACKOFF_MS: u64 = 300;

/// Streaming speech-to-text over the Deepgram realtime socket.
pub struct DeepgramFactory {
    pub api_key: String,
    pub options: RecognizerOptions,
    pub sample_rate: u32,
}

impl RecognizerFactory for DeepgramFactory {
    fn build(
        &self,
        audio: mpsc::Receiver<Vec<u8>>,
    ) -> (Box<dyn SpeechRecognizer>, mpsc::Receiver<RecognizerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let recognizer = DeepgramRecognizer {
            api_key: self.api_key.clone(),
            options: self.options.clone(),
            sample_rate: self.sample_rate,
            audio: Arc::new(Mutex::new(audio)),
            event_tx,
            worker: None,
            stop_tx: None,
        };
        (Box::new(recognizer), event_rx)
    }
}

pub struct DeepgramRecognizer {
    api_key: String,
    options: RecognizerOptions,
    sample_rate: u32,
    // Shared with the worker so a restarted session can resume the feed.
    audio: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    event_tx: mpsc::Sender<RecognizerEvent>,
    worker: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    async fn start(&mut self) -> Result<(), String> {
        if let Some(worker) = &self.worker {
            if !worker.is_finished() {
                return Ok(());
            }
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = StreamSession {
            url: listen_url(&self.options, self.sample_rate),
            api_key: self.api_key.clone(),
            audio: self.audio.clone(),
            event_tx: self.event_tx.clone(),
            stop_rx,
        };
        self.stop_tx = Some(stop_tx);
        self.worker = Some(tokio::spawn(session.run()));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

fn listen_url(options: &RecognizerOptions, sample_rate: u32) -> String {
    format!(
        "wss://api.deepgram.com/v1/listen?\
         encoding=linear16&sample_rate={}&channels=1\
         &model=nova-3&language={}\
         &interim_results={}&punctuate=true\
         &endpointing=300&utterance_end_ms=1000&smart_format=true",
        sample_rate, options.language, options.interim_results
    )
}

fn build_ws_request(
    url: &str,
    api_key: &str,
) -> Result<tungstenite::http::Request<()>, String> {
    tungstenite::http::Request::builder()
        .uri(url)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Authorization", format!("Token {}", api_key))
        .header("Host", "api.deepgram.com")
        .body(())
        .map_err(|e| format!("failed to build request: {}", e))
}

struct StreamSession {
    url: String,
    api_key: String,
    audio: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
    event_tx: mpsc::Sender<RecognizerEvent>,
    stop_rx: watch::Receiver<bool>,
}

impl StreamSession {
    async fn run(mut self) {
        let request = match build_ws_request(&self.url, &self.api_key) {
            Ok(req) => req,
            Err(e) => {
                let _ = self.event_tx.send(RecognizerEvent::Error(e)).await;
                return;
            }
        };

        let ws_stream = match connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                let _ = self
                    .event_tx
                    .send(RecognizerEvent::Error(format!("engine connect failed: {}", e)))
                    .await;
                tokio::time::sleep(Duration::from_millis(RESTART_BACKOFF_MS)).await;
                self.emit_ended().await;
                return;
            }
        };
        println!("[recognizer] engine connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut audio = self.audio.lock().await;
        // Discard audio buffered while recognition was paused.
        while audio.try_recv().is_ok() {}

        let mut parser = ResultParser::default();
        let mut keepalive = tokio::time::interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;
        let mut deliberate_stop = false;

        loop {
            tokio::select! {
                chunk = audio.recv() => {
                    let pcm = match chunk {
                        Some(p) => p,
                        None => {
                            // Microphone released; nothing more to transcribe.
                            deliberate_stop = true;
                            break;
                        }
                    };
                    if pcm.is_empty() {
                        continue;
                    }
                    keepalive.reset();
                    if ws_tx
                        .send(tungstenite::Message::Binary(pcm.into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                changed = self.stop_rx.changed() => {
                    // A dropped sender means the owner is gone; stop too.
                    if changed.is_err() || *self.stop_rx.borrow() {
                        deliberate_stop = true;
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    let msg = json!({"type": "KeepAlive"});
                    if ws_tx
                        .send(tungstenite::Message::Text(msg.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            for event in parser.parse(&text) {
                                let _ = self.event_tx.send(event).await;
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            let _ = self
                                .event_tx
                                .send(RecognizerEvent::Error(format!("engine error: {}", e)))
                                .await;
                            break;
                        }
                    }
                }
            }
        }

        // Flush any locked-in segments before the socket goes away.
        if let Some(text) = parser.flush() {
            let _ = self
                .event_tx
                .send(RecognizerEvent::Result {
                    text,
                    is_final: true,
                })
                .await;
        }
        let close = json!({"type": "CloseStream"});
        let _ = ws_tx
            .send(tungstenite::Message::Text(close.to_string().into()))
            .await;
        let _ = ws_tx.close().await;

        if !deliberate_stop {
            self.emit_ended().await;
        }
    }

    async fn emit_ended(&self) {
        let _ = self.event_tx.send(RecognizerEvent::Ended).await;
    }
}

/// Accumulates finalized segments until the engine marks the end of the
/// utterance, mirroring the segment/speech_final protocol.
#[derive(Default)]
struct ResultParser {
    segments: Vec<String>,
}

impl ResultParser {
    fn parse(&mut self, text: &str) -> Vec<RecognizerEvent> {
        let event: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![RecognizerEvent::Error(format!("parse error: {}", e))],
        };

        let msg_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");

        match msg_type {
            "Results" => {
                let transcript = event
                    .get("channel")
                    .and_then(|c| c.get("alternatives"))
                    .and_then(|a| a.as_array())
                    .and_then(|a| a.first())
                    .and_then(|alt| alt.get("transcript"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("");

                let is_final = event
                    .get("is_final")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let speech_final = event
                    .get("speech_final")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                if !is_final {
                    if transcript.is_empty() {
                        return vec![];
                    }
                    // Interim hypothesis: accumulated segments plus the text
                    // still in flight.
                    let preview = if self.segments.is_empty() {
                        transcript.to_string()
                    } else {
                        format!("{} {}", self.segments.join(" "), transcript)
                    };
                    return vec![RecognizerEvent::Result {
                        text: preview,
                        is_final: false,
                    }];
                }

                if !transcript.is_empty() {
                    self.segments.push(transcript.to_string());
                }

                if speech_final {
                    match self.flush() {
                        Some(full) => vec![RecognizerEvent::Result {
                            text: full,
                            is_final: true,
                        }],
                        None => vec![],
                    }
                } else {
                    vec![]
                }
            }
            "UtteranceEnd" => match self.flush() {
                Some(full) => vec![RecognizerEvent::Result {
                    text: full,
                    is_final: true,
                }],
                None => vec![],
            },
            "Error" => {
                let description = event
                    .get("description")
                    .and_then(|d| d.as_str())
                    .unwrap_or("engine error");
                vec![RecognizerEvent::Error(description.to_string())]
            }
            _ => vec![],
        }
    }

    fn flush(&mut self) -> Option<String> {
        if self.segments.is_empty() {
            return None;
        }
        let full = self.segments.join(" ");
        self.segments.clear();
        if full.trim().is_empty() {
            None
        } else {
            Some(full)
        }
    }
}
