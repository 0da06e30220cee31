//! shmem-connect CLI
//!
//! Echo server, ping client, the 256-frame verification harness, an
//! in-process benchmark and a segment inspector.

mod config;
mod harness;
mod progress;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use shmem_core::{ConnectionOptions, ErrorKind, Segment, resolve_backend};
use shmem_transport::Listener;

use config::Config;
use progress::{FrameProgress, format_bytes, format_latency, format_throughput};

/// shmem - host-local shared-memory channels
#[derive(Parser)]
#[command(name = "shmem")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server, one session at a time per channel
    Serve {
        /// Channels to serve (repeatable)
        #[arg(short, long)]
        channel: Vec<String>,

        /// Stop each channel after this many sessions
        #[arg(long)]
        max_sessions: Option<u64>,
    },

    /// Send messages to an echo server and report round-trip times
    Ping {
        /// Channel name
        #[arg(short, long, default_value = "chan1")]
        channel: String,

        /// Number of messages
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Message size in bytes
        #[arg(short, long, default_value_t = 64)]
        size: usize,
    },

    /// Accept one client and run the backend half of the verification harness
    VerifyBackend {
        /// Channel name (defaults to backend 0's channel)
        #[arg(short, long)]
        channel: Option<String>,
    },

    /// Connect and run the client half of the verification harness
    VerifyClient {
        /// Channel name (defaults to backend 0's channel)
        #[arg(short, long)]
        channel: Option<String>,
    },

    /// Measure throughput through a channel inside this process
    Bench {
        /// Channel name (defaults to a per-process name)
        #[arg(short, long)]
        channel: Option<String>,

        /// Number of messages
        #[arg(short, long, default_value_t = 10_000)]
        frames: u64,

        /// Message size in bytes
        #[arg(short, long, default_value_t = 4096)]
        size: usize,
    },

    /// Show segment header state
    Status {
        /// Channel to inspect (all segments if omitted)
        #[arg(short, long)]
        channel: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            return ExitCode::from(2);
        }
    };

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::from(exit_code(&e))
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    config.validate()?;
    Ok(config)
}

async fn run(command: Commands, config: &Config) -> anyhow::Result<()> {
    let options = config.options()?;

    match command {
        Commands::Serve {
            channel,
            max_sessions,
        } => {
            let channels = if channel.is_empty() {
                config.server.channels.clone()
            } else {
                channel
            };
            let max_sessions = max_sessions.unwrap_or(config.server.max_sessions);
            serve(channels, max_sessions, options).await
        }
        Commands::Ping {
            channel,
            count,
            size,
        } => run_ping(&channel, count, size, options).await,
        Commands::VerifyBackend { channel } => {
            let channel = channel_or_backend(channel)?;
            let listener = Listener::bind(channel.clone(), options)?;
            println!("Waiting for a client on {}...", style(&channel).cyan());
            let conn = listener.accept().await?;
            let result = harness::verify_backend(&conn).await;
            conn.close().await?;
            report_harness("backend", result)
        }
        Commands::VerifyClient { channel } => {
            let channel = channel_or_backend(channel)?;
            let conn = shmem_transport::connect(&channel, options).await?;
            let result = harness::verify_client(&conn).await;
            conn.close().await?;
            report_harness("client", result)
        }
        Commands::Bench {
            channel,
            frames,
            size,
        } => {
            let channel =
                channel.unwrap_or_else(|| format!("bench-{}", shmem_core::clock::current_pid()));
            run_bench(&channel, frames, size, options).await
        }
        Commands::Status { channel } => show_status(channel.as_deref(), &options),
    }
}

fn channel_or_backend(channel: Option<String>) -> anyhow::Result<String> {
    match channel {
        Some(channel) => Ok(channel),
        None => Ok(resolve_backend(0)?.channel),
    }
}

/// Serve every channel concurrently until Ctrl+C or the session limit
async fn serve(
    channels: Vec<String>,
    max_sessions: u64,
    options: ConnectionOptions,
) -> anyhow::Result<()> {
    println!("shmem echo server {}", env!("CARGO_PKG_VERSION"));
    println!("Segment directory: {}", options.segment_dir().display());
    println!(
        "Ring capacity: {} (max message {})",
        format_bytes(options.capacity as u64),
        format_bytes(options.max_frame_size as u64)
    );

    let mut tasks = tokio::task::JoinSet::new();
    for channel in channels {
        let listener = Listener::bind(channel, options.clone())?;
        println!("Serving {}", style(listener.name()).cyan());
        tasks.spawn(serve_channel(listener, max_sessions));
    }

    let all_done = async {
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = all_done => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            println!("\nShutting down...");
            Ok(())
        }
    }
}

async fn serve_channel(listener: Listener, max_sessions: u64) -> anyhow::Result<()> {
    loop {
        if max_sessions > 0 && listener.sessions_accepted() >= max_sessions {
            return Ok(());
        }
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) if e.kind() == ErrorKind::ProtocolMismatch => {
                tracing::warn!("Rejected client on {}: {}", listener.name(), e);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match harness::echo_session(&conn).await {
            Ok(echoed) => tracing::info!(
                "Session {} on {} finished after {} messages",
                listener.sessions_accepted(),
                listener.name(),
                echoed
            ),
            Err(e) => tracing::warn!("Session on {} ended: {:#}", listener.name(), e),
        }
    }
}

async fn run_ping(
    channel: &str,
    count: usize,
    size: usize,
    options: ConnectionOptions,
) -> anyhow::Result<()> {
    let conn = shmem_transport::connect(channel, options).await?;
    println!(
        "PING {} ({} bytes, compression {})",
        style(channel).cyan(),
        size,
        if conn.codec().is_enabled() { "on" } else { "off" }
    );

    let rtts = harness::ping(&conn, count, size).await;
    conn.close().await?;
    let rtts = rtts?;

    for (seq, rtt) in rtts.iter().enumerate() {
        println!("{size} bytes: seq={seq} time={}", format_latency(*rtt));
    }
    if let (Some(min), Some(max)) = (rtts.iter().min(), rtts.iter().max()) {
        let total: std::time::Duration = rtts.iter().sum();
        let avg = total / rtts.len() as u32;
        println!(
            "{} messages, min/avg/max = {}/{}/{}",
            rtts.len(),
            format_latency(*min),
            format_latency(avg),
            format_latency(*max)
        );
    }
    Ok(())
}

fn report_harness(side: &str, result: anyhow::Result<()>) -> anyhow::Result<()> {
    match result {
        Ok(()) => {
            println!(
                "{} {side}: {} frames of {} bytes verified",
                style("PASS").green().bold(),
                harness::HARNESS_FRAMES,
                harness::HARNESS_FRAME_SIZE
            );
            Ok(())
        }
        Err(e) => {
            println!("{} {side}: {e:#}", style("FAIL").red().bold());
            Err(e)
        }
    }
}

async fn run_bench(
    channel: &str,
    frames: u64,
    size: usize,
    options: ConnectionOptions,
) -> anyhow::Result<()> {
    let label = format!("{frames} x {} over {channel}", format_bytes(size as u64));
    let progress = FrameProgress::new(frames, &label);
    let report = match harness::bench(channel, options, frames, size, &progress).await {
        Ok(report) => report,
        Err(e) => {
            progress.abandon();
            return Err(e);
        }
    };
    progress.finish_with_message("Benchmark complete".to_string());

    println!("Messages:   {}", report.frames);
    println!("Payload:    {}", format_bytes(report.bytes));
    println!("Elapsed:    {:.3} s", report.elapsed.as_secs_f64());
    println!("Throughput: {}", format_throughput(report.bytes, report.elapsed));
    println!(
        "Rate:       {:.0} msg/s",
        report.frames as f64 / report.elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("Compressed: {}", report.compressed);
    Ok(())
}

fn show_status(channel: Option<&str>, options: &ConnectionOptions) -> anyhow::Result<()> {
    let dir = options.segment_dir();
    println!("shmem-connect {}", env!("CARGO_PKG_VERSION"));
    println!("Segment directory: {}", dir.display());
    println!();

    let names = match channel {
        Some(channel) => vec![channel.to_string()],
        None => list_segments(&dir)?,
    };
    if names.is_empty() {
        println!("No segments");
        return Ok(());
    }

    for name in names {
        let info = match Segment::inspect(&name, &dir) {
            Ok(info) => info,
            Err(e) => {
                println!("{}: {}", style(&name).cyan(), e);
                continue;
            }
        };
        println!("{}", style(&info.name).cyan().bold());
        println!("  File:       {}", info.path.display());
        println!(
            "  Layout:     v{} capacity {} max message {}",
            info.version,
            format_bytes(info.layout.capacity as u64),
            format_bytes(info.layout.max_frame_size as u64)
        );
        println!(
            "  Creator:    pid {} ({})",
            info.creator_pid,
            if info.creator_alive { "alive" } else { "gone" }
        );
        if info.opener_pid != 0 {
            println!("  Opener:     pid {}", info.opener_pid);
        }
        println!(
            "  State:      ready={} attached={} destroy_claimed={}",
            info.ready, info.attached, info.destroy_claimed
        );
        for (i, direction) in ["creator -> opener", "opener -> creator"].iter().enumerate() {
            println!(
                "  {direction}: {} queued in {} frames",
                format_bytes(info.queued_bytes[i]),
                info.queued_frames[i]
            );
        }
        for (i, role) in ["creator", "opener"].iter().enumerate() {
            let age = info.heartbeat_age_ms[i]
                .map_or_else(|| "never".to_string(), |ms| format!("{ms} ms ago"));
            println!(
                "  {role} heartbeat: {age}{}",
                if info.closed[i] { " (closed)" } else { "" }
            );
        }
    }
    Ok(())
}

fn list_segments(dir: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_file() && !name.contains(".bell.") {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Process exit status for an error: the library error kind when there is
/// one, 1 otherwise
fn exit_code(err: &anyhow::Error) -> u8 {
    let Some(e) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<shmem_core::Error>())
    else {
        return 1;
    };
    match e.kind() {
        ErrorKind::InvalidConfig => 2,
        ErrorKind::AlreadyExists => 3,
        ErrorKind::NotFound => 4,
        ErrorKind::ProtocolMismatch => 5,
        ErrorKind::CorruptFrame => 6,
        ErrorKind::PeerUnresponsive => 7,
        ErrorKind::Cancelled => 8,
        ErrorKind::InUse => 9,
        ErrorKind::Closed => 10,
        ErrorKind::FrameTooLarge => 11,
        ErrorKind::Timeout => 12,
        ErrorKind::InvalidState => 13,
        ErrorKind::Io => 14,
    }
}
