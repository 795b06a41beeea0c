use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// PCM rate the recognizer expects (16-bit mono little-endian).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Fixed user-visible message for any microphone acquisition failure.
pub const MIC_REQUIRED_MESSAGE: &str = "Microphone permission is required.";

const AUDIO_CHANNEL_CAPACITY: usize = 128;

/// Why the microphone could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MicError {
    /// Access denied, or no input device is visible to the process.
    PermissionDenied,
    /// A device exists but the stream could not be configured or started.
    Unavailable(String),
}

impl MicError {
    /// The one message the call view is allowed to show for this condition.
    pub fn user_message(&self) -> &'static str {
        MIC_REQUIRED_MESSAGE
    }
}

impl std::fmt::Display for MicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MicError::PermissionDenied => write!(f, "microphone permission denied"),
            MicError::Unavailable(detail) => write!(f, "microphone unavailable: {}", detail),
        }
    }
}

/// Live microphone capture. Holding this keeps the input device open (and
/// the platform's recording indicator lit); `release` stops the underlying
/// tracks and is safe to call more than once.
pub struct MicCapture {
    shutdown: std::sync::mpsc::Sender<()>,
    released: Arc<AtomicBool>,
    audio_rx: Option<mpsc::Receiver<Vec<u8>>>,
}

impl MicCapture {
    pub fn new(shutdown: std::sync::mpsc::Sender<()>, audio_rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            shutdown,
            released: Arc::new(AtomicBool::new(false)),
            audio_rx: Some(audio_rx),
        }
    }

    /// Take the captured-PCM channel. Yields frames of 16-bit mono LE bytes.
    pub fn take_audio(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.audio_rx.take()
    }

    /// Stop the underlying audio tracks. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(());
        }
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Shared flag observers can hold across the capture's lifetime.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires microphone access. The one suspension point before any call
/// setup: no transport connection may be opened until this succeeds.
#[async_trait]
pub trait CaptureGate: Send + Sync {
    async fn acquire(&self) -> Result<MicCapture, MicError>;
}

/// Real capture gate over the system's default audio host.
pub struct CpalCaptureGate {
    device_name: Option<String>,
}

impl CpalCaptureGate {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

#[async_trait]
impl CaptureGate for CpalCaptureGate {
    async fn acquire(&self) -> Result<MicCapture, MicError> {
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(AUDIO_CHANNEL_CAPACITY);
        let device_name = self.device_name.clone();

        // cpal streams are not Send, so one dedicated thread owns the stream
        // for the whole session and drops it on release.
        std::thread::spawn(move || {
            capture_thread(device_name, audio_tx, shutdown_rx, result_tx);
        });

        match result_rx.await {
            Ok(Ok(())) => Ok(MicCapture::new(shutdown_tx, audio_rx)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MicError::Unavailable("capture thread exited".into())),
        }
    }
}

fn capture_thread(
    device_name: Option<String>,
    audio_tx: mpsc::Sender<Vec<u8>>,
    shutdown_rx: std::sync::mpsc::Receiver<()>,
    result_tx: tokio::sync::oneshot::Sender<Result<(), MicError>>,
) {
    let stream = match build_stream(device_name.as_deref(), audio_tx) {
        Ok(s) => s,
        Err(e) => {
            let _ = result_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = result_tx.send(Err(MicError::Unavailable(format!(
            "failed to start stream: {}",
            e
        ))));
        return;
    }
    let _ = result_tx.send(Ok(()));

    // Block until release; dropping the stream stops the device tracks.
    let _ = shutdown_rx.recv();
    drop(stream);
    println!("[audio] capture released");
}

fn build_stream(
    device_name: Option<&str>,
    audio_tx: mpsc::Sender<Vec<u8>>,
) -> Result<cpal::Stream, MicError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| MicError::Unavailable(format!("failed to list devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| MicError::Unavailable(format!("device '{}' not found", name)))?
    } else {
        host.default_input_device()
            .ok_or(MicError::PermissionDenied)?
    };

    let device_label = device.name().unwrap_or_else(|_| "unknown".into());
    println!("[audio] using device: {}", device_label);

    // Try 16kHz mono; fall back to whatever the device offers plus decimation.
    let (config, decimate) = match try_config(&device, CAPTURE_SAMPLE_RATE) {
        Some(cfg) => (cfg, 1),
        None => {
            let default = device
                .default_input_config()
                .map_err(|e| MicError::Unavailable(format!("no input config: {}", e)))?;
            let rate = default.sample_rate().0;
            let d = (rate / CAPTURE_SAMPLE_RATE).max(1);
            println!(
                "[audio] {}Hz unavailable, using {}Hz with {}:1 decimation",
                CAPTURE_SAMPLE_RATE, rate, d
            );
            (
                StreamConfig {
                    channels: default.channels(),
                    sample_rate: default.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                },
                d as usize,
            )
        }
    };

    let channels = config.channels as usize;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Downmix to mono if stereo
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                } else {
                    data.to_vec()
                };
                let samples: Vec<f32> = if decimate > 1 {
                    mono.iter().step_by(decimate).copied().collect()
                } else {
                    mono
                };
                let mut pcm = Vec::with_capacity(samples.len() * 2);
                for s in samples {
                    let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    pcm.extend_from_slice(&v.to_le_bytes());
                }
                // Drop frames rather than block the device callback.
                let _ = audio_tx.try_send(pcm);
            },
            |err| {
                eprintln!("[audio] stream error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => MicError::PermissionDenied,
            other => MicError::Unavailable(format!("failed to build stream: {}", other)),
        })?;

    Ok(stream)
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.channels() == 1
            && range.min_sample_rate().0 <= rate
            && range.max_sample_rate().0 >= rate
        {
            return Some(StreamConfig {
                channels: 1,
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    // Also accept stereo configs (downmixed in the callback).
    let supported = device.supported_input_configs().ok()?;
    for range in supported {
        if range.min_sample_rate().0 <= rate && range.max_sample_rate().0 >= rate {
            return Some(StreamConfig {
                channels: range.channels(),
                sample_rate: SampleRate(rate),
                buffer_size: cpal::BufferSize::Default,
            });
        }
    }
    None
}
