use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Coarse lifecycle of a call session. Transitions only move forward:
/// `Idle -> Connecting -> Connected -> Ended`, and `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    Connecting,
    Connected,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }
}

/// Whose turn it is. Only meaningful while the session is `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSubstatus {
    AgentSpeaking,
    Listening,
}

impl CallSubstatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallSubstatus::AgentSpeaking => "agent_speaking",
            CallSubstatus::Listening => "listening",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Candidate,
    Agent,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::Candidate => "candidate",
            Speaker::Agent => "agent",
        }
    }
}

/// One sanitized utterance as shown to the user. `text` has already been
/// through the transcript sanitizer; raw text is never surfaced.
#[derive(Debug, Clone)]
pub struct TranscriptMessage {
    pub speaker: Speaker,
    pub text: String,
    pub received_at: DateTime<Local>,
}

/// Snapshot of one call session. Owned exclusively by the controller;
/// one instance exists per `call` invocation.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub status: CallStatus,
    /// Non-`None` only while `status == Connected`.
    pub substatus: Option<CallSubstatus>,
    pub application_id: String,
    /// User-facing description of the last terminal failure. Cleared on a
    /// successful (re)connect.
    pub last_error: Option<String>,
}

impl CallSession {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Idle,
            substatus: None,
            application_id: application_id.into(),
            last_error: None,
        }
    }
}

/// Events sent from the call session task to the frontend.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StatusChanged {
        status: CallStatus,
        substatus: Option<CallSubstatus>,
    },
    Transcript(TranscriptMessage),
    /// Agent voice audio delivered by the server.
    AgentAudio {
        seq: u64,
        audio: Vec<u8>,
        is_final: bool,
    },
    Error(String),
}
