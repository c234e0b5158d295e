//! CLI entry point for tunewatch
//!
//! `watch` runs the mirror until interrupted; every other subcommand is a
//! one-shot command against the player that prints the resulting snapshot.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tunewatch::{Config, Mirror, MirrorError, SurfaceError};

/// Config file looked up when `--config` is not given
const DEFAULT_CONFIG_PATH: &str = "tunewatch.toml";

/// tunewatch - mirror a media player and report the audio quality of the playing track
#[derive(Parser, Debug)]
#[command(name = "tunewatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (tunewatch.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set (e.g. debug, tunewatch=trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Skip startup checks (playerctl, journalctl). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Mirror the player and log snapshots and quality until interrupted
    Watch,
    /// Print the current snapshot as JSON
    Status,
    /// Skip to the next track
    Next,
    /// Go back to the previous track
    Previous,
    /// Toggle play/pause
    Toggle,
    /// Toggle shuffle
    Shuffle,
    /// Cycle repeat off -> all -> one
    Repeat,
    /// Seek to a position in seconds
    Seek { seconds: f64 },
    /// Set the volume
    Volume {
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
    },
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// An explicit path must exist; the default path falls back to built-in defaults.
fn load_config(path: Option<&Path>) -> Result<Config, MirrorError> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Ok(Config::load(DEFAULT_CONFIG_PATH)?),
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn build_mirror(args: &Args) -> Result<Mirror, MirrorError> {
    let config = load_config(args.config.as_deref())?;
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        config.validate()?;
        Ok(Mirror::new_without_checks(config))
    } else {
        Mirror::with_config(config)
    }
}

async fn watch(mirror: Arc<Mirror>) -> Result<(), MirrorError> {
    let shutdown = CancellationToken::new();

    let mut snapshots = mirror.subscribe_snapshots();
    let mut facts = mirror.subscribe_facts();
    let logger = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(snapshot) = snapshots.recv() => info!(
                    title = %snapshot.title,
                    artist = %snapshot.artist,
                    playing = snapshot.is_playing,
                    position = %tunewatch::format_time(snapshot.position),
                    duration = %tunewatch::format_time(snapshot.duration),
                    "snapshot"
                ),
                Some(fact) = facts.recv() => info!(
                    label = %fact.label(),
                    source = %fact.source,
                    "quality"
                ),
                else => break,
            }
        }
    });

    let ctrl_c = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            shutdown.cancel();
        })
    };

    if mirror.config.status.enabled {
        let bind = &mirror.config.status.bind;
        info!(bind = %bind, "serving status on http://{}/status", bind);
    }
    let result = mirror.run_with_server(shutdown).await;

    ctrl_c.abort();
    logger.abort();
    result
}

async fn one_shot(mirror: &Mirror, command: &Command) -> Result<(), SurfaceError> {
    // Prime the poller so relative commands (shuffle) see the current state
    mirror.refresh_now().await;

    match command {
        Command::Watch | Command::Status => Ok(()),
        Command::Next => mirror.next().await,
        Command::Previous => mirror.previous().await,
        Command::Toggle => mirror.toggle_play_pause().await,
        Command::Shuffle => mirror.toggle_shuffle().await,
        Command::Repeat => mirror.cycle_repeat().await,
        Command::Seek { seconds } => mirror.seek(*seconds).await,
        Command::Volume { level } => mirror.set_volume(*level).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mirror = match build_mirror(&args) {
        Ok(mirror) => Arc::new(mirror),
        Err(e) => {
            error!(error = %e, "failed to initialize");
            return ExitCode::FAILURE;
        }
    };

    let command = args.command.clone().unwrap_or(Command::Watch);
    if command == Command::Watch {
        return match watch(mirror).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "tunewatch stopped with an error");
                ExitCode::FAILURE
            }
        };
    }

    if let Err(e) = one_shot(&mirror, &command).await {
        error!(error = %e, "player command failed");
        return ExitCode::FAILURE;
    }

    match mirror.latest_snapshot() {
        Some(snapshot) => match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to serialize snapshot");
                ExitCode::FAILURE
            }
        },
        None => {
            error!("no player available");
            ExitCode::FAILURE
        }
    }
}
