use callscreen::api;
use callscreen::audio::{CpalCaptureGate, CAPTURE_SAMPLE_RATE};
use callscreen::call::{CallCommand, CallSessionController};
use callscreen::recognizer::deepgram::DeepgramFactory;
use callscreen::recognizer::RecognizerOptions;
use callscreen::settings;
use callscreen::settings::Settings;
use callscreen::state::{CallEvent, Speaker};
use callscreen::transport::WsTransportFactory;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "callscreen",
    version,
    about = "Voice-only interview screening client"
)]
struct Cli {
    /// Override the service base URL from settings.
    #[arg(long, global = true)]
    api_base: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a job application and print the new application id.
    Apply {
        #[arg(long)]
        username: String,
        /// Job offer identifier to apply for.
        #[arg(long)]
        job_offer: String,
    },
    /// Run the voice interview call for an application.
    Call {
        #[arg(long)]
        application: String,
        /// Input device name (system default when omitted).
        #[arg(long)]
        device: Option<String>,
        /// Accept the consent prompt without asking.
        #[arg(long)]
        yes: bool,
    },
    /// Fetch the fit analysis, polling while it is pending.
    Analysis {
        #[arg(long)]
        application: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();
    let mut settings = settings::load();
    if let Some(base) = cli.api_base {
        settings.api_base_url = base;
    }

    let code = match cli.command {
        Command::Apply {
            username,
            job_offer,
        } => run_apply(&settings, &username, &job_offer).await,
        Command::Call {
            application,
            device,
            yes,
        } => run_call(&settings, application, device, yes).await,
        Command::Analysis { application } => run_analysis(&settings, &application).await,
    };
    std::process::exit(code);
}

async fn run_apply(settings: &Settings, username: &str, job_offer: &str) -> i32 {
    match api::create_application(&settings.api_base_url, username, job_offer).await {
        Ok(result) => {
            println!("Application created: {}", result.application_id);
            println!(
                "Start the interview with: callscreen call --application {}",
                result.application_id
            );
            0
        }
        Err(e) => {
            eprintln!("Failed to create application: {}", e.message);
            1
        }
    }
}

async fn run_analysis(settings: &Settings, application: &str) -> i32 {
    println!("Fetching analysis for {}...", application);
    match api::wait_for_analysis(&settings.api_base_url, application).await {
        Ok(result) if result.failed => {
            eprintln!("Analysis could not be completed for this application");
            1
        }
        Ok(result) => {
            println!("Fit score: {:.0}%", result.fit_score);
            if result.skills.is_empty() {
                println!("Skills: none detected");
            } else {
                println!("Skills: {}", result.skills.join(", "));
            }
            0
        }
        Err(e) => {
            eprintln!("Analysis failed: {}", e.message);
            1
        }
    }
}

fn ask_consent() -> bool {
    println!("This interview is voice-only. Your microphone will be captured and");
    println!("transcribed for the duration of the call; the agent speaks first.");
    print!("Accept and start the call? [y/N] ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn run_call(
    settings: &Settings,
    application: String,
    device: Option<String>,
    yes: bool,
) -> i32 {
    let consent = if yes {
        true
    } else {
        tokio::task::spawn_blocking(ask_consent)
            .await
            .unwrap_or(false)
    };
    if !consent {
        println!("Consent declined; the call was not started.");
        return 1;
    }
    if settings.stt_api_key.is_empty() {
        eprintln!("[call] warning: no STT API key configured; your answers will not be heard");
    }

    let (event_tx, event_rx) = std::sync::mpsc::channel::<CallEvent>();
    let printer = std::thread::spawn(move || {
        for event in event_rx {
            match event {
                CallEvent::StatusChanged { status, substatus } => match substatus {
                    Some(sub) => println!("[call] {} ({})", status.as_str(), sub.as_str()),
                    None => println!("[call] {}", status.as_str()),
                },
                CallEvent::Transcript(message) => {
                    let label = match message.speaker {
                        Speaker::Agent => "agent",
                        Speaker::Candidate => "you",
                    };
                    println!(
                        "[{}] {}: {}",
                        message.received_at.format("%H:%M:%S"),
                        label,
                        message.text
                    );
                }
                CallEvent::AgentAudio {
                    seq,
                    audio,
                    is_final,
                } => {
                    log::debug!(
                        "[call] agent audio chunk seq={} ({} bytes, final={})",
                        seq,
                        audio.len(),
                        is_final
                    );
                }
                CallEvent::Error(message) => eprintln!("[call] error: {}", message),
            }
        }
    });

    let device = device.or_else(|| settings.mic_device().map(str::to_string));
    let gate = Arc::new(CpalCaptureGate::new(device));
    let recognizer_factory = Arc::new(DeepgramFactory {
        api_key: settings.stt_api_key.clone(),
        options: RecognizerOptions {
            language: settings.language.clone(),
            ..RecognizerOptions::default()
        },
        sample_rate: CAPTURE_SAMPLE_RATE,
    });
    let transport_factory = Arc::new(WsTransportFactory::new(settings.api_base_url.clone()));

    let mut controller = CallSessionController::new(
        application,
        gate,
        recognizer_factory,
        transport_factory,
        event_tx,
    );

    let (command_tx, command_rx) = mpsc::channel::<CallCommand>(4);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        println!();
        let _ = command_tx.send(CallCommand::End).await;
        // Hold the sender so the controller never sees a closed channel.
        std::future::pending::<()>().await;
    });

    controller.run(command_rx).await;

    let code = match controller.session().last_error {
        Some(ref message) => {
            eprintln!("Call ended with error: {}", message);
            1
        }
        None => 0,
    };
    drop(controller);
    let _ = printer.join();
    code
}
