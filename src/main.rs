use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use skald::audio::{CpalMicrophone, CpalSpeaker, Microphone, Speaker};
use skald::clients::{
    DEFAULT_INPUT_FIELD, DEFAULT_REPLY_FIELD, Dialogue, OpenAiSynthesizer, Synthesizer,
    Transcriber, WebhookDialogue, WhisperTranscriber,
};
use skald::{Config, ConversationController, Phase, Sender, Session, SessionStore, VoiceOrchestrator};

/// Skald - voice and text conversation client for AI assistants
#[derive(Parser)]
#[command(name = "skald", version, about)]
struct Cli {
    /// Path to the config file (defaults to the platform config dir)
    #[arg(long, env = "SKALD_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Don't persist sessions to disk
    #[arg(long)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// List persisted conversation threads
    Sessions,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,skald=warn",
        1 => "info,skald=info",
        2 => "info,skald=debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config)?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::Sessions => cmd_sessions(&config),
        };
    }

    chat(config, cli.ephemeral).await
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Recording for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mic = CpalMicrophone::new();
    let handle = mic.open()?;

    tokio::time::sleep(Duration::from_secs(duration)).await;
    let samples = handle.finish();

    let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    let rms = calculate_rms(&samples);

    println!("Captured {} samples", samples.len());
    println!("RMS: {rms:.4} | Peak: {peak:.4}");
    println!("\n---");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    let speaker = CpalSpeaker::new();
    let playing = speaker.play_samples(samples)?;
    let _ = playing.done.await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}

/// Test TTS output
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("no API key; set api_keys.openai or OPENAI_API_KEY"))?;

    let synthesizer = OpenAiSynthesizer::new(
        api_key,
        config.voice.tts_model.clone(),
        config.voice.tts_voice.clone(),
        config.voice.tts_speed,
    )?;

    println!("Synthesizing speech...");
    let mp3_data = synthesizer.synthesize(text).await?;
    println!("Got {} bytes of audio data", mp3_data.len());

    println!("Playing audio...");
    let playing = CpalSpeaker::new().play(&mp3_data)?;
    let _ = playing.done.await;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// List persisted conversation threads
fn cmd_sessions(config: &Config) -> anyhow::Result<()> {
    let store = SessionStore::load(config.sessions_path());
    let active = store.active_id();

    for session in store.list_sessions() {
        let marker = if session.id == active { "*" } else { " " };
        println!(
            "{marker} {}  {}  ({} messages)",
            session.id,
            session.title,
            session.messages.len()
        );
    }

    Ok(())
}

/// The interactive chat loop
async fn chat(config: Config, ephemeral: bool) -> anyhow::Result<()> {
    let sessions = Arc::new(if ephemeral {
        SessionStore::in_memory()
    } else {
        SessionStore::load(config.sessions_path())
    });

    let url = config.dialogue.url.clone().ok_or_else(|| {
        anyhow::anyhow!("no dialogue backend; set dialogue.url in config.toml or SKALD_DIALOGUE_URL")
    })?;

    let dialogue: Arc<dyn Dialogue> = Arc::new(
        WebhookDialogue::new(url, config.dialogue.bearer_token.clone())?.with_fields(
            config
                .dialogue
                .input_field
                .clone()
                .unwrap_or_else(|| DEFAULT_INPUT_FIELD.to_string()),
            config
                .dialogue
                .reply_field
                .clone()
                .unwrap_or_else(|| DEFAULT_REPLY_FIELD.to_string()),
        ),
    );

    let speaker: Arc<dyn Speaker> = Arc::new(CpalSpeaker::new());

    // Voice mode needs a speech credential; without one the client is text-only
    let (synthesizer, voice) = match &config.api_key {
        Some(key) => {
            let transcriber: Arc<dyn Transcriber> = Arc::new(WhisperTranscriber::new(
                key.clone(),
                config.voice.stt_model.clone(),
                config.voice.language.clone(),
            )?);
            let synthesizer: Arc<dyn Synthesizer> = Arc::new(OpenAiSynthesizer::new(
                key.clone(),
                config.voice.tts_model.clone(),
                config.voice.tts_voice.clone(),
                config.voice.tts_speed,
            )?);
            let mic: Arc<dyn Microphone> = Arc::new(CpalMicrophone::new());

            let orchestrator = VoiceOrchestrator::builder(
                mic,
                Arc::clone(&speaker),
                transcriber,
                Arc::clone(&dialogue),
                Arc::clone(&synthesizer),
                Arc::clone(&sessions),
            )
            .policy(config.voice.policy())
            .build();

            (Some(synthesizer), Some(orchestrator))
        }
        None => {
            tracing::info!("no API credential configured, voice mode unavailable");
            (None, None)
        }
    };

    let controller =
        ConversationController::new(Arc::clone(&sessions), dialogue, speaker, synthesizer, voice);

    if let Some(voice) = controller.voice() {
        spawn_phase_printer(voice);
        spawn_notice_printer(voice);
    }

    print_transcript(&controller.sessions().active_session());
    println!("Type a message, or /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        match line.as_str() {
            "" => {}
            "/quit" | "/exit" => break,
            "/help" => print_help(),
            "/voice" => match controller.toggle_voice_mode() {
                Ok(true) => println!("voice mode on (say something; /stop to leave)"),
                Ok(false) => println!("voice mode off"),
                Err(e) => eprintln!("error: {e}"),
            },
            "/stop" => {
                if let Some(voice) = controller.voice() {
                    voice.disable();
                }
                println!("voice mode off");
            }
            "/done" => {
                if let Some(voice) = controller.voice() {
                    voice.finish_capture();
                }
            }
            "/new" => {
                let session = controller.sessions().create_session();
                println!("started {} ({})", session.title, session.id);
                print_transcript(&session);
            }
            "/list" => {
                let active = controller.sessions().active_id();
                for (i, session) in controller.sessions().list_sessions().iter().enumerate() {
                    let marker = if session.id == active { "*" } else { " " };
                    println!(
                        "{marker} [{i}] {}  ({} messages)",
                        session.title,
                        session.messages.len()
                    );
                }
            }
            other if other.starts_with("/open ") => match parse_index(other, "/open") {
                Some(index) => {
                    let listed = controller.sessions().list_sessions();
                    if let Some(session) = listed.get(index) {
                        controller.sessions().set_active(&session.id);
                        print_transcript(&controller.sessions().active_session());
                    } else {
                        eprintln!("no session [{index}]");
                    }
                }
                None => eprintln!("usage: /open <index>"),
            },
            other if other.starts_with("/delete ") => match parse_index(other, "/delete") {
                Some(index) => {
                    let listed = controller.sessions().list_sessions();
                    if let Some(session) = listed.get(index) {
                        controller.sessions().delete_session(&session.id);
                        println!("deleted [{index}]");
                        print_transcript(&controller.sessions().active_session());
                    } else {
                        eprintln!("no session [{index}]");
                    }
                }
                None => eprintln!("usage: /delete <index>"),
            },
            other if other.starts_with("/say ") => match parse_index(other, "/say") {
                Some(index) => {
                    let session_id = controller.sessions().active_id();
                    if let Err(e) = controller.read_aloud(&session_id, index).await {
                        eprintln!("error: {e}");
                    }
                }
                None => eprintln!("usage: /say <message index>"),
            },
            other if other.starts_with('/') => {
                eprintln!("unknown command {other}; try /help");
            }
            text => {
                controller.send_typed(text).await;
                if let Some(reply) = controller
                    .sessions()
                    .active_session()
                    .messages
                    .last()
                    .filter(|m| m.sender == Sender::Assistant)
                {
                    println!("assistant: {}", reply.text);
                }
            }
        }
    }

    if let Some(voice) = controller.voice() {
        voice.disable();
    }

    Ok(())
}

/// Render phase changes as status lines
fn spawn_phase_printer(voice: &Arc<VoiceOrchestrator>) {
    let mut phases = voice.watch_phase();
    tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            let phase = *phases.borrow_and_update();
            if phase != Phase::Idle {
                println!("[{phase}]");
            }
        }
    });
}

/// Surface recoverable voice-loop notices
fn spawn_notice_printer(voice: &Arc<VoiceOrchestrator>) {
    let Some(mut notices) = voice.take_notices() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            eprintln!("! {notice}");
        }
    });
}

fn parse_index(line: &str, command: &str) -> Option<usize> {
    line.strip_prefix(command)?.trim().parse().ok()
}

fn print_transcript(session: &Session) {
    println!("=== {} ===", session.title);
    for (i, message) in session.messages.iter().enumerate() {
        let who = match message.sender {
            Sender::User => "you",
            Sender::Assistant => "assistant",
        };
        println!("[{i}] {who}: {}", message.text);
    }
}

fn print_help() {
    println!("/voice        toggle voice mode");
    println!("/done         end the current capture window early");
    println!("/stop         leave voice mode");
    println!("/new          start a new session");
    println!("/list         list sessions");
    println!("/open <i>     switch to session i");
    println!("/delete <i>   delete session i");
    println!("/say <i>      read assistant message i aloud");
    println!("/quit         exit");
}
