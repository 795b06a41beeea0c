pub mod deepgram;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Recognition settings the engine is configured with at build time.
/// Language is fixed for the lifetime of the session.
#[derive(Debug, Clone)]
pub struct RecognizerOptions {
    /// Keep transcribing across utterances rather than stopping at the
    /// first final result.
    pub continuous: bool,
    /// Emit partial hypotheses while an utterance is in progress.
    pub interim_results: bool,
    pub language: String,
    /// Hypotheses per result; only the best one is ever consumed.
    pub max_alternatives: u32,
}

impl Default for RecognizerOptions {
    fn default() -> Self {
        Self {
            continuous: true,
            interim_results: true,
            language: "en-US".into(),
            max_alternatives: 1,
        }
    }
}

/// Events produced by a speech recognition engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// A transcription hypothesis. `is_final` marks locked-in text.
    Result { text: String, is_final: bool },
    /// The engine stopped on its own (silence timeout, stream end). Not
    /// fatal: the owner may start recognition again.
    Ended,
    Error(String),
}

/// Uniform start/stop surface over a continuous speech-to-text engine.
/// Both operations are safe to call regardless of current engine state.
#[async_trait]
pub trait SpeechRecognizer: Send {
    async fn start(&mut self) -> Result<(), String>;
    async fn stop(&mut self);
}

/// Builds a recognizer bound to a captured-audio channel, returning the
/// engine handle and its event stream. The seam where deterministic fakes
/// substitute for the real engine.
pub trait RecognizerFactory: Send + Sync {
    fn build(
        &self,
        audio: mpsc::Receiver<Vec<u8>>,
    ) -> (Box<dyn SpeechRecognizer>, mpsc::Receiver<RecognizerEvent>);
}
