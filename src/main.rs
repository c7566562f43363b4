use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use proctor_session::api::{status_routes, SnapshotSource};
use proctor_session::config::{Config, MediaSource};
use proctor_session::identity::{self, Identity, ParticipantId, Role};
use proctor_session::media::{GstreamerDevices, MediaDevices, SyntheticDevices};
use proctor_session::peer::PeerSessionManager;
use proctor_session::session::{
    CandidateRole, CandidateSession, ProctorRole, ProctorSession, RoleBehavior, SessionEvent,
    SessionOrchestrator,
};
use proctor_session::signaling::{ExamResult, SignalingChannel};
use proctor_session::{Result, SessionError};

#[derive(Parser)]
#[command(name = "proctor-session")]
#[command(about = "Proctored exam session client", long_about = None)]
struct Cli {
    /// Signaling WebSocket URL (overrides SIGNALING_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Own participant id (overrides PARTICIPANT_ID)
    #[arg(long, global = true)]
    participant_id: Option<ParticipantId>,

    /// Bearer token (overrides AUTH_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// Use tracks with no capture behind them
    #[arg(long, global = true)]
    synthetic_media: bool,

    /// Camera to capture from, by label (overrides MEDIA_VIDEO_DEVICE)
    #[arg(long, global = true)]
    video_device: Option<String>,

    /// Microphone to capture from, by label (overrides MEDIA_AUDIO_DEVICE)
    #[arg(long, global = true)]
    audio_device: Option<String>,

    /// Serve the status API on this port
    #[arg(long, global = true)]
    status_port: Option<u16>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Supervise candidates: offer to each one that joins
    Proctor,

    /// Take an exam: answer the proctor's offer
    Candidate,
}

impl Commands {
    fn role(&self) -> Role {
        match self {
            Commands::Proctor => Role::Proctor,
            Commands::Candidate => Role::Candidate,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let json_logs = cli.log_json
        || std::env::var("LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
    init_tracing(json_logs);

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "✗".red(), e);
        std::process::exit(1);
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let role = cli.command.role();
    let mut config = Config::for_role(role)?;

    if let Some(url) = cli.url {
        config.signaling.url = url;
    }
    if let Some(id) = cli.participant_id {
        config.identity.participant_id = Some(id);
    }
    if let Some(token) = cli.token {
        config.identity.auth_token = Some(token);
    }
    if cli.synthetic_media {
        config.media.source = MediaSource::Synthetic;
    }
    if cli.video_device.is_some() {
        config.media.video_device = cli.video_device;
    }
    if cli.audio_device.is_some() {
        config.media.audio_device = cli.audio_device;
    }
    if let Some(port) = cli.status_port {
        config.status.enabled = true;
        config.status.port = port;
    }

    let identity = resolve_identity(&config).await?;
    let channel = Arc::new(SignalingChannel::new(
        config.endpoint(&identity),
        config.reconnect.clone(),
    ));

    let devices: Arc<dyn MediaDevices> = match config.media.source {
        MediaSource::Gstreamer => Arc::new(GstreamerDevices),
        MediaSource::Synthetic => Arc::new(SyntheticDevices::new()),
    };
    let peers = Arc::new(PeerSessionManager::from_ice_config(&config.ice, devices)?);

    match role {
        Role::Proctor => {
            let (session, events) = ProctorSession::new(
                channel,
                peers,
                ProctorRole::new(config.session.max_peer_restarts),
            );
            run_session(session, events, &config).await
        }
        Role::Candidate => {
            let (session, events) = CandidateSession::new(channel, peers, CandidateRole::new());
            run_session(session, events, &config).await
        }
    }
}

async fn resolve_identity(config: &Config) -> Result<Identity> {
    if let Some(identity) = config.static_identity() {
        return Ok(identity);
    }

    let (Some(email), Some(password)) = (&config.identity.email, &config.identity.password) else {
        return Err(SessionError::configuration(
            "set AUTH_TOKEN and PARTICIPANT_ID, or LOGIN_EMAIL and LOGIN_PASSWORD",
        ));
    };

    let identity = identity::login(
        &config.identity.backend_url,
        &config.identity.login_path,
        email,
        password,
    )
    .await?;

    if identity.role != config.identity.role {
        return Err(SessionError::Authentication(format!(
            "account is a {} but the session was started as {}",
            identity.role, config.identity.role
        )));
    }

    tracing::info!(participant = identity.participant_id, role = %identity.role, "Logged in");
    Ok(identity)
}

async fn run_session<R: Console>(
    session: Arc<SessionOrchestrator<R>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    config: &Config,
) -> Result<()> {
    let printer = tokio::spawn(print_events(events));

    if let Err(e) = session
        .initialize_media_with(config.media.constraints())
        .await
    {
        tracing::error!(error = %e, "Continuing without local media");
        println!("{} {}", "⚠".yellow(), e);
    }

    if config.status.enabled {
        let source: Arc<dyn SnapshotSource> = session.clone();
        let address = config.status.bind_address();
        tracing::info!(port = address.1, "Serving status API");
        tokio::spawn(warp::serve(status_routes(source)).run(address));
    }

    session.start().await;

    println!("\n{} as {}", "Session started".bold().green(), R::ROLE.as_str().cyan());
    println!("Type {} for commands, {} to leave\n", "help".cyan(), "quit".cyan());

    console_loop(&session).await;

    session.shutdown().await;
    printer.abort();
    println!("Goodbye!");
    Ok(())
}

async fn console_loop<R: Console>(session: &Arc<SessionOrchestrator<R>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", "►".cyan());
        let _ = std::io::stdout().flush();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let words: Vec<&str> = line.split_whitespace().collect();
                    match words.first().copied() {
                        None => continue,
                        Some("quit") | Some("exit") => break,
                        Some("help") => {
                            println!("{}", R::help());
                            println!("  {}       list cameras and microphones", "devices".cyan());
                        }
                        Some("devices") => list_devices(session).await,
                        Some(_) => R::command(session, &words).await,
                    }
                }
                Ok(None) => {
                    // Detached from a terminal: run until interrupted
                    let _ = tokio::signal::ctrl_c().await;
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read console input");
                    break;
                }
            }
        }
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let line = match event {
            SessionEvent::SignalingStateChanged(state) => {
                format!("{} signaling {}", "◆".blue(), state.to_string().bold())
            }
            SessionEvent::ParticipantJoined(id) => format!("{} Student {} joined", "▶".green(), id),
            SessionEvent::ParticipantLeft(id) => format!("{} Student {} left", "◀".yellow(), id),
            SessionEvent::RemoteStream {
                participant,
                stream,
            } => format!(
                "{} media from {} ({} tracks)",
                "●".green(),
                participant,
                stream.tracks().len()
            ),
            SessionEvent::PeerStateChanged {
                participant,
                transport,
            } => format!("{} peer {} is {}", "◆".blue(), participant, transport),
            SessionEvent::NegotiationFailed {
                participant,
                reason,
            } => format!("{} peer {} failed: {}", "✗".red(), participant, reason),
            SessionEvent::ExamStarted => format!("{} exam started", "✓".green()),
            SessionEvent::ExamEnded => format!("{} exam ended by proctor", "■".yellow()),
            SessionEvent::ExamCompleted {
                participant,
                result,
            } => format!(
                "{} Student {} finished with score {}",
                "✓".green(),
                participant,
                result.score.to_string().bold()
            ),
        };
        println!("\n{}", line);
    }
}

async fn list_devices<R: RoleBehavior>(session: &Arc<SessionOrchestrator<R>>) {
    match session.peers().enumerate_devices().await {
        Ok(devices) if devices.is_empty() => println!("  (no capture devices)"),
        Ok(devices) => {
            for device in devices {
                println!("  {:<10} {}", device.kind.to_string().dimmed(), device.label);
            }
        }
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

/// Console commands available to a role.
#[async_trait]
trait Console: RoleBehavior {
    fn help() -> String;

    async fn command(session: &Arc<SessionOrchestrator<Self>>, words: &[&str]);
}

fn report(result: Result<()>, done: &str) {
    match result {
        Ok(()) => println!("{} {}", "✓".green(), done),
        Err(e) => println!("{} {}", "✗".red(), e),
    }
}

fn parse_participant(arg: Option<&&str>) -> Option<ParticipantId> {
    let parsed = arg.and_then(|raw| raw.parse().ok());
    if parsed.is_none() {
        println!("{} expected a participant id", "✗".yellow());
    }
    parsed
}

#[async_trait]
impl Console for ProctorRole {
    fn help() -> String {
        format!(
            "  {}   send start-exam\n  {}     send exam-end\n  {}  close and drop a candidate\n  {}          show the roster\n  {}          leave",
            "start <id>".cyan(),
            "end <id>".cyan(),
            "remove <id>".cyan(),
            "list".cyan(),
            "quit".cyan()
        )
    }

    async fn command(session: &Arc<ProctorSession>, words: &[&str]) {
        match words[0] {
            "start" => {
                if let Some(id) = parse_participant(words.get(1)) {
                    report(session.start_exam(id).await, "start-exam sent");
                }
            }
            "end" => {
                if let Some(id) = parse_participant(words.get(1)) {
                    report(session.end_exam(id).await, "exam-end sent");
                }
            }
            "remove" => {
                if let Some(id) = parse_participant(words.get(1)) {
                    if session.remove_participant(id).await {
                        println!("{} removed {}", "✓".green(), id);
                    } else {
                        println!("{} no participant {}", "✗".yellow(), id);
                    }
                }
            }
            "list" => {
                let participants = session.participants();
                if participants.is_empty() {
                    println!("  (no candidates)");
                }
                for participant in participants {
                    let state = session
                        .peers()
                        .session_state(participant.id)
                        .await
                        .map(|s| format!("{:?}", s))
                        .unwrap_or_else(|| "no session".to_string());
                    let score = participant
                        .result
                        .map(|r| format!(", score {}", r.score))
                        .unwrap_or_default();
                    println!(
                        "  {} [{}] {}{}",
                        participant.name.bold(),
                        state,
                        if participant.stream.is_some() { "streaming" } else { "no media" },
                        score
                    );
                }
            }
            other => println!("{} unknown command '{}'", "✗".yellow(), other),
        }
    }
}

#[async_trait]
impl Console for CandidateRole {
    fn help() -> String {
        format!(
            "  {}  report the exam result (answers: numbers or '-')\n  {}                         show exam state\n  {}                          leave",
            "submit <score> [answers...]".cyan(),
            "state".cyan(),
            "quit".cyan()
        )
    }

    async fn command(session: &Arc<CandidateSession>, words: &[&str]) {
        match words[0] {
            "submit" => match parse_result(&words[1..]) {
                Some(result) => report(session.submit_result(result).await, "result submitted"),
                None => println!("{} usage: submit <score> [answers...]", "✗".yellow()),
            },
            "state" => {
                let proctor = session
                    .role()
                    .proctor_id()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "none".to_string());
                println!(
                    "  exam {} | proctor {} | signaling {}",
                    session.exam_state().to_string().bold(),
                    proctor,
                    session.channel().state()
                );
            }
            other => println!("{} unknown command '{}'", "✗".yellow(), other),
        }
    }
}

fn parse_result(args: &[&str]) -> Option<ExamResult> {
    let (score, answers) = args.split_first()?;
    let answers = answers
        .iter()
        .map(|raw| match *raw {
            "-" => Some(None),
            value => value.parse().ok().map(Some),
        })
        .collect::<Option<Vec<_>>>()?;

    Some(ExamResult {
        score: score.parse().ok()?,
        answers,
    })
}
