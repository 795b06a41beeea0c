use crate::audio::{CaptureGate, MIC_REQUIRED_MESSAGE};
use crate::recognizer::{RecognizerEvent, RecognizerFactory, SpeechRecognizer};
use crate::state::{
    CallEvent, CallSession, CallStatus, CallSubstatus, Speaker, TranscriptMessage,
};
use crate::transcript::sanitize;
use crate::transport::{
    ClientMessage, CloseKind, ControlEvent, ServerMessage, Transport, TransportEvent,
    TransportFactory,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Local;
use std::sync::mpsc::Sender as EventSender;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Consecutive failed connection attempts tolerated before giving up.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 3;
pub const RECONNECT_BASE_MS: u64 = 800;
pub const RECONNECT_MAX_MS: u64 = 8_000;

pub const DUPLICATE_CALL_MESSAGE: &str = "A call is already in progress for this application";
pub const SERVICE_UNAVAILABLE_MESSAGE: &str = "Service unavailable";
pub const APPLICATION_REQUIRED_MESSAGE: &str = "An application id is required";

/// Commands the frontend can issue against a running call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    End,
}

fn reconnect_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << exp;
    RECONNECT_BASE_MS.saturating_mul(factor).min(RECONNECT_MAX_MS)
}

enum Step {
    EndByUser,
    Transport(Option<TransportEvent>),
    Recognizer(Option<RecognizerEvent>),
}

/// Drives one call session from consent to teardown: owns the single
/// socket connection and the single capture handle, keeps exactly one turn
/// active, and recovers from transient transport failures within a bounded
/// retry budget.
pub struct CallSessionController {
    session: CallSession,
    gate: Arc<dyn CaptureGate>,
    recognizer_factory: Arc<dyn RecognizerFactory>,
    transport_factory: Arc<dyn TransportFactory>,
    event_tx: EventSender<CallEvent>,
    /// Set once the server announced `call_ended`; suppresses further sends
    /// while the clean close is in flight.
    closing: bool,
}

impl CallSessionController {
    pub fn new(
        application_id: impl Into<String>,
        gate: Arc<dyn CaptureGate>,
        recognizer_factory: Arc<dyn RecognizerFactory>,
        transport_factory: Arc<dyn TransportFactory>,
        event_tx: EventSender<CallEvent>,
    ) -> Self {
        Self {
            session: CallSession::new(application_id),
            gate,
            recognizer_factory,
            transport_factory,
            event_tx,
            closing: false,
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    /// Run the session to completion. Returns once the session is terminal
    /// (or never left `Idle`); all resources are released on every path.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<CallCommand>) {
        if self.session.application_id.trim().is_empty() {
            // Setup error: rejected before any device or network access.
            self.session.last_error = Some(APPLICATION_REQUIRED_MESSAGE.into());
            self.emit(CallEvent::Error(APPLICATION_REQUIRED_MESSAGE.into()));
            return;
        }

        let mut mic = match self.gate.acquire().await {
            Ok(m) => m,
            Err(e) => {
                eprintln!("[call] microphone unavailable: {}", e);
                // Stays in Idle; the transport is never opened.
                self.session.last_error = Some(e.user_message().into());
                self.emit(CallEvent::Error(e.user_message().into()));
                return;
            }
        };

        let audio_rx = match mic.take_audio() {
            Some(rx) => rx,
            None => {
                mic.release();
                self.session.last_error = Some(MIC_REQUIRED_MESSAGE.into());
                self.emit(CallEvent::Error(MIC_REQUIRED_MESSAGE.into()));
                return;
            }
        };
        let (mut recognizer, mut recognizer_events) = self.recognizer_factory.build(audio_rx);

        let mut attempts: u32 = 0;
        let mut current: Option<Transport> = None;
        let mut recognizer_gone = false;

        'connect: loop {
            self.set_status(CallStatus::Connecting, None);

            let conn = {
                let factory = self.transport_factory.clone();
                let application_id = self.session.application_id.clone();
                tokio::select! {
                    biased;
                    _ = commands.recv() => {
                        self.set_status(CallStatus::Ended, None);
                        break 'connect;
                    }
                    res = factory.connect(&application_id) => res,
                }
            };

            let mut t = match conn {
                Ok(t) => t,
                Err(e) => {
                    eprintln!("[call] connect failed: {}", e);
                    if !self
                        .retry_or_fail(&mut commands, &mut attempts, recognizer.as_mut())
                        .await
                    {
                        break 'connect;
                    }
                    continue 'connect;
                }
            };

            attempts = 0;
            self.closing = false;
            self.session.last_error = None;
            self.set_status(CallStatus::Connected, Some(CallSubstatus::Listening));
            if let Err(e) = recognizer.start().await {
                self.emit(CallEvent::Error(format!("recognizer failed to start: {}", e)));
            }

            loop {
                let step = tokio::select! {
                    biased;
                    _ = commands.recv() => Step::EndByUser,
                    ev = t.next_event() => Step::Transport(ev),
                    ev = recognizer_events.recv(), if !recognizer_gone => Step::Recognizer(ev),
                };

                match step {
                    Step::EndByUser => {
                        println!("[call] ending call");
                        self.set_status(CallStatus::Ended, None);
                        current = Some(t);
                        break 'connect;
                    }
                    Step::Transport(Some(TransportEvent::Message(msg))) => {
                        self.handle_server_message(msg, recognizer.as_mut()).await;
                    }
                    Step::Transport(Some(TransportEvent::Closed(info))) => match info.kind() {
                        CloseKind::Clean => {
                            println!("[call] call ended");
                            self.set_status(CallStatus::Ended, None);
                            current = Some(t);
                            break 'connect;
                        }
                        CloseKind::DuplicateCall => {
                            self.fail(DUPLICATE_CALL_MESSAGE);
                            current = Some(t);
                            break 'connect;
                        }
                        CloseKind::Abnormal => {
                            eprintln!(
                                "[call] connection lost: code {} {}",
                                info.code, info.reason
                            );
                            if !self
                                .retry_or_fail(&mut commands, &mut attempts, recognizer.as_mut())
                                .await
                            {
                                current = Some(t);
                                break 'connect;
                            }
                            continue 'connect;
                        }
                    },
                    Step::Transport(Some(TransportEvent::Error(e))) => {
                        eprintln!("[call] transport error: {}", e);
                        if !self
                            .retry_or_fail(&mut commands, &mut attempts, recognizer.as_mut())
                            .await
                        {
                            current = Some(t);
                            break 'connect;
                        }
                        continue 'connect;
                    }
                    Step::Transport(None) => {
                        // Event stream ended without a close frame.
                        if !self
                            .retry_or_fail(&mut commands, &mut attempts, recognizer.as_mut())
                            .await
                        {
                            current = Some(t);
                            break 'connect;
                        }
                        continue 'connect;
                    }
                    Step::Recognizer(Some(RecognizerEvent::Result { text, is_final })) => {
                        if is_final {
                            self.forward_final_result(&text, &t);
                        }
                    }
                    Step::Recognizer(Some(RecognizerEvent::Ended)) => {
                        // Silence timeout or engine hiccup; keep listening.
                        if !self.closing
                            && self.session.substatus == Some(CallSubstatus::Listening)
                        {
                            if let Err(e) = recognizer.start().await {
                                self.emit(CallEvent::Error(format!(
                                    "recognizer restart failed: {}",
                                    e
                                )));
                            }
                        }
                    }
                    Step::Recognizer(Some(RecognizerEvent::Error(e))) => {
                        eprintln!("[call] recognizer error: {}", e);
                        self.emit(CallEvent::Error(e));
                    }
                    Step::Recognizer(None) => {
                        // Engine event stream is gone; stop selecting on it.
                        recognizer_gone = true;
                    }
                }
            }
        }

        // Teardown, in order, on every exit path: recognizer first so no
        // result can race the closing socket, then the socket, then the
        // microphone tracks.
        recognizer.stop().await;
        if let Some(t) = current.take() {
            t.close();
        }
        mic.release();
    }

    /// While it is the candidate's turn, sanitize and forward a finalized
    /// utterance. Outside that turn the result is dropped, never queued.
    fn forward_final_result(&mut self, text: &str, t: &Transport) {
        if self.closing || self.session.substatus != Some(CallSubstatus::Listening) {
            return;
        }
        let clean = sanitize(text);
        if clean.is_empty() {
            return;
        }
        t.send(ClientMessage::Transcript { text: clean });
    }

    async fn handle_server_message(
        &mut self,
        msg: ServerMessage,
        recognizer: &mut dyn SpeechRecognizer,
    ) {
        match msg {
            ServerMessage::Control { event } => match event {
                ControlEvent::AgentSpeaking => {
                    // Pause capture so the agent's own voice is never
                    // transcribed back at it.
                    recognizer.stop().await;
                    self.set_status(CallStatus::Connected, Some(CallSubstatus::AgentSpeaking));
                }
                ControlEvent::Listening => {
                    self.set_status(CallStatus::Connected, Some(CallSubstatus::Listening));
                    if let Err(e) = recognizer.start().await {
                        self.emit(CallEvent::Error(format!(
                            "recognizer failed to start: {}",
                            e
                        )));
                    }
                }
                ControlEvent::CallEnded => {
                    println!("[call] agent ended the call");
                    self.closing = true;
                    recognizer.stop().await;
                }
                ControlEvent::Other => {}
            },
            ServerMessage::Transcript { speaker, text } => {
                let message = TranscriptMessage {
                    speaker,
                    text: sanitize(&text),
                    received_at: Local::now(),
                };
                self.emit(CallEvent::Transcript(message));
            }
            ServerMessage::AudioChunk {
                speaker,
                seq,
                data_b64,
                is_final,
                ..
            } => {
                if speaker == Speaker::Agent {
                    match BASE64.decode(data_b64.as_bytes()) {
                        Ok(audio) => self.emit(CallEvent::AgentAudio {
                            seq,
                            audio,
                            is_final,
                        }),
                        Err(e) => log::debug!("[call] dropping undecodable audio chunk: {}", e),
                    }
                }
            }
        }
    }

    /// Burn one attempt from the retry budget and wait out the backoff.
    /// Returns false when the session is terminal (budget exhausted or the
    /// user ended the call during the pause).
    async fn retry_or_fail(
        &mut self,
        commands: &mut mpsc::Receiver<CallCommand>,
        attempts: &mut u32,
        recognizer: &mut dyn SpeechRecognizer,
    ) -> bool {
        recognizer.stop().await;
        self.session.substatus = None;
        *attempts += 1;
        if *attempts >= RECONNECT_MAX_ATTEMPTS {
            self.fail(SERVICE_UNAVAILABLE_MESSAGE);
            return false;
        }
        let delay = reconnect_delay_ms(*attempts);
        println!("[call] reconnecting in {}ms (attempt {})", delay, *attempts + 1);
        tokio::select! {
            biased;
            _ = commands.recv() => {
                self.set_status(CallStatus::Ended, None);
                false
            }
            _ = tokio::time::sleep(Duration::from_millis(delay)) => true,
        }
    }

    fn set_status(&mut self, status: CallStatus, substatus: Option<CallSubstatus>) {
        self.session.status = status;
        // Substatus is meaningful only while connected.
        self.session.substatus = if status == CallStatus::Connected {
            substatus
        } else {
            None
        };
        self.emit(CallEvent::StatusChanged {
            status: self.session.status,
            substatus: self.session.substatus,
        });
    }

    fn fail(&mut self, message: &str) {
        eprintln!("[call] {}", message);
        self.session.last_error = Some(message.to_string());
        self.set_status(CallStatus::Ended, None);
        self.emit(CallEvent::Error(message.to_string()));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}
