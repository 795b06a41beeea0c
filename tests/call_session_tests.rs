// Controller state-machine tests. The capture gate, recognizer and
// transport are scripted fakes so every interleaving here is deterministic;
// the paused clock makes the reconnect backoff elapse instantly.

use async_trait::async_trait;
use callscreen::audio::{CaptureGate, MicCapture, MicError, MIC_REQUIRED_MESSAGE};
use callscreen::call::{
    CallCommand, CallSessionController, APPLICATION_REQUIRED_MESSAGE, DUPLICATE_CALL_MESSAGE,
    SERVICE_UNAVAILABLE_MESSAGE,
};
use callscreen::recognizer::{RecognizerEvent, RecognizerFactory, SpeechRecognizer};
use callscreen::state::{CallEvent, CallStatus, CallSubstatus, Speaker};
use callscreen::transport::{
    ClientMessage, CloseInfo, Transport, TransportEvent, TransportFactory,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct FakeGate {
    deny: bool,
    acquired: AtomicU32,
    released: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeGate {
    fn allowing() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            acquired: AtomicU32::new(0),
            released: Mutex::new(None),
        })
    }

    fn denying() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            acquired: AtomicU32::new(0),
            released: Mutex::new(None),
        })
    }

    fn acquired(&self) -> u32 {
        self.acquired.load(Ordering::SeqCst)
    }

    fn mic_released(&self) -> bool {
        self.released
            .lock()
            .unwrap()
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl CaptureGate for FakeGate {
    async fn acquire(&self) -> Result<MicCapture, MicError> {
        if self.deny {
            return Err(MicError::PermissionDenied);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (shutdown_tx, _shutdown_rx) = std::sync::mpsc::channel();
        let (_audio_tx, audio_rx) = mpsc::channel(8);
        let mic = MicCapture::new(shutdown_tx, audio_rx);
        *self.released.lock().unwrap() = Some(mic.released_flag());
        Ok(mic)
    }
}

#[derive(Default)]
struct RecognizerProbe {
    starts: AtomicU32,
    stops: AtomicU32,
    event_tx: Mutex<Option<mpsc::Sender<RecognizerEvent>>>,
}

impl RecognizerProbe {
    fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    async fn final_result(&self, text: &str) {
        self.emit(RecognizerEvent::Result {
            text: text.to_string(),
            is_final: true,
        })
        .await;
    }

    async fn emit(&self, event: RecognizerEvent) {
        let tx = self
            .event_tx
            .lock()
            .unwrap()
            .clone()
            .expect("recognizer not built yet");
        tx.send(event).await.expect("controller stopped listening");
    }
}

struct FakeRecognizerFactory {
    probe: Arc<RecognizerProbe>,
}

impl RecognizerFactory for FakeRecognizerFactory {
    fn build(
        &self,
        _audio: mpsc::Receiver<Vec<u8>>,
    ) -> (Box<dyn SpeechRecognizer>, mpsc::Receiver<RecognizerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        *self.probe.event_tx.lock().unwrap() = Some(tx);
        (
            Box::new(FakeRecognizer {
                probe: self.probe.clone(),
            }),
            rx,
        )
    }
}

struct FakeRecognizer {
    probe: Arc<RecognizerProbe>,
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn start(&mut self) -> Result<(), String> {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&mut self) {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeTransportFactory {
    script: Mutex<VecDeque<Result<Transport, String>>>,
    connects: AtomicU32,
}

impl FakeTransportFactory {
    fn new(script: Vec<Result<Transport, String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            connects: AtomicU32::new(0),
        })
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn connect(&self, _application_id: &str) -> Result<Transport, String> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(entry) => entry,
            None => Err("no scripted connection".into()),
        }
    }
}

/// Test-side handles of one scripted connection.
struct ConnHandle {
    outbound_rx: mpsc::Receiver<ClientMessage>,
    close_rx: mpsc::Receiver<()>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl ConnHandle {
    async fn server_sends(&self, json: &str) {
        let msg = callscreen::transport::parse_server_message(json).expect("test frame invalid");
        self.events_tx
            .send(TransportEvent::Message(msg))
            .await
            .expect("controller stopped listening");
    }

    async fn closes(&self, code: u16, was_clean: bool) {
        self.events_tx
            .send(TransportEvent::Closed(CloseInfo {
                code,
                was_clean,
                reason: String::new(),
            }))
            .await
            .expect("controller stopped listening");
    }

    fn sent(&mut self) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.outbound_rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn close_requested(&mut self) -> bool {
        self.close_rx.try_recv().is_ok()
    }
}

fn scripted_conn() -> (Transport, ConnHandle) {
    let (outbound_tx, outbound_rx) = mpsc::channel(16);
    let (close_tx, close_rx) = mpsc::channel(1);
    let (events_tx, events_rx) = mpsc::channel(16);
    (
        Transport::new(outbound_tx, close_tx, events_rx),
        ConnHandle {
            outbound_rx,
            close_rx,
            events_tx,
        },
    )
}

struct Harness {
    gate: Arc<FakeGate>,
    probe: Arc<RecognizerProbe>,
    factory: Arc<FakeTransportFactory>,
    events_rx: std::sync::mpsc::Receiver<CallEvent>,
    command_tx: mpsc::Sender<CallCommand>,
    run: tokio::task::JoinHandle<CallSessionController>,
}

impl Harness {
    fn start(
        application_id: &str,
        gate: Arc<FakeGate>,
        script: Vec<Result<Transport, String>>,
    ) -> Self {
        let probe = Arc::new(RecognizerProbe::default());
        let factory = FakeTransportFactory::new(script);
        let (event_tx, events_rx) = std::sync::mpsc::channel();
        let (command_tx, command_rx) = mpsc::channel(4);

        let mut controller = CallSessionController::new(
            application_id,
            gate.clone(),
            Arc::new(FakeRecognizerFactory {
                probe: probe.clone(),
            }),
            factory.clone(),
            event_tx,
        );
        let run = tokio::spawn(async move {
            controller.run(command_rx).await;
            controller
        });

        Self {
            gate,
            probe,
            factory,
            events_rx,
            command_tx,
            run,
        }
    }

    async fn end_call(&self) {
        self.command_tx
            .send(CallCommand::End)
            .await
            .expect("controller stopped listening");
    }

    async fn finish(self) -> (CallSessionController, Vec<CallEvent>) {
        let controller = self.run.await.expect("controller panicked");
        let events = self.events_rx.try_iter().collect();
        (controller, events)
    }

    fn statuses(events: &[CallEvent]) -> Vec<(CallStatus, Option<CallSubstatus>)> {
        events
            .iter()
            .filter_map(|e| match e {
                CallEvent::StatusChanged { status, substatus } => Some((*status, *substatus)),
                _ => None,
            })
            .collect()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test(start_paused = true)]
async fn empty_application_id_is_a_setup_error() {
    let gate = FakeGate::allowing();
    let harness = Harness::start("   ", gate.clone(), vec![]);
    let (controller, events) = harness.finish().await;

    let session = controller.session();
    assert_eq!(session.status, CallStatus::Idle);
    assert_eq!(
        session.last_error.as_deref(),
        Some(APPLICATION_REQUIRED_MESSAGE)
    );
    // Rejected before any device or network access.
    assert_eq!(gate.acquired(), 0);
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::Error(m) if m == APPLICATION_REQUIRED_MESSAGE)));
}

#[tokio::test(start_paused = true)]
async fn permission_denied_never_opens_a_connection() {
    let harness = Harness::start("app-1", FakeGate::denying(), vec![]);
    let factory = harness.factory.clone();
    let (controller, events) = harness.finish().await;

    let session = controller.session();
    assert_eq!(session.status, CallStatus::Idle);
    assert_eq!(session.last_error.as_deref(), Some(MIC_REQUIRED_MESSAGE));
    assert_eq!(factory.connects(), 0);
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::Error(m) if m == MIC_REQUIRED_MESSAGE)));
}

#[tokio::test(start_paused = true)]
async fn duplicate_call_close_is_terminal_with_no_retry() {
    let (transport, conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.closes(4409, false).await;
    let factory = harness.factory.clone();
    let gate = harness.gate.clone();
    let (controller, _events) = harness.finish().await;

    let session = controller.session();
    assert_eq!(session.status, CallStatus::Ended);
    assert_eq!(session.last_error.as_deref(), Some(DUPLICATE_CALL_MESSAGE));
    assert_eq!(factory.connects(), 1);
    assert!(gate.mic_released());
}

#[tokio::test(start_paused = true)]
async fn clean_close_ends_without_error() {
    let (transport, conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;
    conn.closes(1000, true).await;

    let factory = harness.factory.clone();
    let gate = harness.gate.clone();
    let (controller, _events) = harness.finish().await;

    let session = controller.session();
    assert_eq!(session.status, CallStatus::Ended);
    assert_eq!(session.last_error, None);
    assert_eq!(factory.connects(), 1);
    assert!(gate.mic_released());
}

#[tokio::test(start_paused = true)]
async fn finalized_speech_is_sanitized_and_sent_while_listening() {
    let (transport, mut conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;
    harness.probe.final_result("hello [cough] there").await;
    settle().await;

    assert_eq!(
        conn.sent(),
        vec![ClientMessage::Transcript {
            text: "hello there".into()
        }]
    );

    harness.end_call().await;
    let (controller, _events) = harness.finish().await;
    assert_eq!(controller.session().status, CallStatus::Ended);
    assert_eq!(controller.session().last_error, None);
}

#[tokio::test(start_paused = true)]
async fn results_during_agent_turn_are_dropped_not_queued() {
    let (transport, mut conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.server_sends(r#"{"type":"control","event":"agent_speaking"}"#).await;
    settle().await;
    harness.probe.final_result("not my turn").await;
    settle().await;
    assert!(conn.sent().is_empty());

    // The same utterance after the turn flips produces exactly one send.
    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;
    harness.probe.final_result("not my turn").await;
    settle().await;
    assert_eq!(
        conn.sent(),
        vec![ClientMessage::Transcript {
            text: "not my turn".into()
        }]
    );

    harness.end_call().await;
    let probe = harness.probe.clone();
    let (controller, _events) = harness.finish().await;

    assert_eq!(controller.session().status, CallStatus::Ended);
    // The recognizer was paused for the agent's turn and resumed after.
    assert!(probe.stops() >= 1);
    assert!(probe.starts() >= 2);
}

#[tokio::test(start_paused = true)]
async fn agent_turn_pauses_recognizer_and_listening_resumes_it() {
    let (transport, conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    let starts_after_connect = harness.probe.starts();
    assert_eq!(starts_after_connect, 1);

    conn.server_sends(r#"{"type":"control","event":"agent_speaking"}"#).await;
    settle().await;
    assert_eq!(harness.probe.stops(), 1);

    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;
    assert_eq!(harness.probe.starts(), 2);

    harness.end_call().await;
    let (controller, events) = harness.finish().await;
    assert_eq!(controller.session().status, CallStatus::Ended);

    let statuses = Harness::statuses(&events);
    assert!(statuses.contains(&(CallStatus::Connected, Some(CallSubstatus::AgentSpeaking))));
    assert!(statuses.contains(&(CallStatus::Connected, Some(CallSubstatus::Listening))));
}

#[tokio::test(start_paused = true)]
async fn recognizer_silence_timeout_restarts_while_listening() {
    let (transport, conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;
    let starts_before = harness.probe.starts();

    harness.probe.emit(RecognizerEvent::Ended).await;
    settle().await;
    assert_eq!(harness.probe.starts(), starts_before + 1);

    harness.end_call().await;
    harness.finish().await;
}

#[tokio::test(start_paused = true)]
async fn abnormal_closes_exhaust_the_retry_budget() {
    let (transport, conn) = scripted_conn();
    let script = vec![
        Ok(transport),
        Err("connection refused".to_string()),
        Err("connection refused".to_string()),
    ];
    let harness = Harness::start("app-1", FakeGate::allowing(), script);
    settle().await;

    conn.closes(1006, false).await;

    let factory = harness.factory.clone();
    let gate = harness.gate.clone();
    let (controller, events) = harness.finish().await;

    let session = controller.session();
    assert_eq!(session.status, CallStatus::Ended);
    assert_eq!(
        session.last_error.as_deref(),
        Some(SERVICE_UNAVAILABLE_MESSAGE)
    );
    // One successful open plus two failed reconnects: budget of three.
    assert_eq!(factory.connects(), 3);
    assert!(gate.mic_released());
    assert!(events
        .iter()
        .any(|e| matches!(e, CallEvent::Error(m) if m == SERVICE_UNAVAILABLE_MESSAGE)));
}

#[tokio::test(start_paused = true)]
async fn reconnect_resets_substatus_to_listening() {
    let (transport1, conn1) = scripted_conn();
    let (transport2, conn2) = scripted_conn();
    let harness = Harness::start(
        "app-1",
        FakeGate::allowing(),
        vec![Ok(transport1), Ok(transport2)],
    );
    settle().await;

    conn1
        .server_sends(r#"{"type":"control","event":"agent_speaking"}"#)
        .await;
    settle().await;
    conn1.closes(1006, false).await;
    // Backoff elapses under the paused clock.
    tokio::time::sleep(Duration::from_secs(2)).await;

    conn2.closes(1000, true).await;
    let factory = harness.factory.clone();
    let (controller, events) = harness.finish().await;

    assert_eq!(factory.connects(), 2);
    let session = controller.session();
    assert_eq!(session.status, CallStatus::Ended);
    // The dropped connection never became a terminal error.
    assert_eq!(session.last_error, None);

    let statuses = Harness::statuses(&events);
    let agent_turn = statuses
        .iter()
        .position(|s| *s == (CallStatus::Connected, Some(CallSubstatus::AgentSpeaking)))
        .expect("agent turn never shown");
    let resumed = statuses[agent_turn..]
        .iter()
        .position(|s| *s == (CallStatus::Connected, Some(CallSubstatus::Listening)))
        .expect("reconnect did not reset the turn to listening");
    assert!(resumed > 0);
}

#[tokio::test(start_paused = true)]
async fn user_end_call_tears_everything_down() {
    let (transport, mut conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;

    harness.end_call().await;
    let probe = harness.probe.clone();
    let gate = harness.gate.clone();
    let (controller, _events) = harness.finish().await;

    let session = controller.session();
    assert_eq!(session.status, CallStatus::Ended);
    assert_eq!(session.last_error, None);
    assert!(conn.close_requested());
    assert!(gate.mic_released());
    assert!(probe.stops() >= 1);
}

#[tokio::test(start_paused = true)]
async fn call_ended_control_suppresses_further_sends() {
    let (transport, mut conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;
    conn.server_sends(r#"{"type":"control","event":"call_ended"}"#).await;
    settle().await;

    harness.probe.final_result("one last thing").await;
    settle().await;
    assert!(conn.sent().is_empty());

    conn.closes(1000, true).await;
    let (controller, _events) = harness.finish().await;
    assert_eq!(controller.session().status, CallStatus::Ended);
    assert_eq!(controller.session().last_error, None);
}

#[tokio::test(start_paused = true)]
async fn server_transcripts_are_sanitized_before_display() {
    let (transport, conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    conn.server_sends(
        r#"{"type":"transcript","speaker":"agent","text":"Tell me [pause] about yourself"}"#,
    )
    .await;
    settle().await;
    conn.closes(1000, true).await;

    let (_controller, events) = harness.finish().await;
    let transcript = events
        .iter()
        .find_map(|e| match e {
            CallEvent::Transcript(m) => Some(m.clone()),
            _ => None,
        })
        .expect("transcript never surfaced");
    assert_eq!(transcript.speaker, Speaker::Agent);
    assert_eq!(transcript.text, "Tell me about yourself");
}

#[tokio::test(start_paused = true)]
async fn unknown_frames_do_not_disturb_the_call() {
    let (transport, mut conn) = scripted_conn();
    let harness = Harness::start("app-1", FakeGate::allowing(), vec![Ok(transport)]);
    settle().await;

    // Unknown frame types never even reach the controller.
    assert!(callscreen::transport::parse_server_message(r#"{"type":"metrics","n":1}"#).is_none());

    conn.server_sends(r#"{"type":"control","event":"listening"}"#).await;
    settle().await;
    harness.probe.final_result("still here").await;
    settle().await;
    assert_eq!(
        conn.sent(),
        vec![ClientMessage::Transcript {
            text: "still here".into()
        }]
    );

    conn.closes(1000, true).await;
    let (controller, _events) = harness.finish().await;
    assert_eq!(controller.session().status, CallStatus::Ended);
}
