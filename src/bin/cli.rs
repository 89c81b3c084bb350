use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use geoshare::config::DEFAULT_CONFIG_FILE;
use geoshare::{
    logging, relay, Coordinates, EchoPolicy, GeoshareConfig, LocationSample, ParticipantId,
    Session, SourceConfig,
};

#[derive(Parser)]
#[command(name = "geoshare")]
#[command(about = "Share live locations between connected participants through a relay", version)]
#[command(after_help = "Geoshare Features:
- Relay hub that fans every location update out to all other participants
- Last-observed-wins reconciliation of everyone's position
- Optional sequence numbers so reordered updates never regress a position
- Live (sensor) or synthetic (timer) location sources
- Optional expiry of participants that go silent")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration with a fresh participant id
    Init {
        #[arg(short, long)]
        force: bool,
    },

    /// Start the relay hub
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(short, long)]
        bind: Option<String>,

        /// Also deliver each update back to its sender
        #[arg(long)]
        echo: bool,
    },

    /// Join as a participant and watch everyone's positions
    Join {
        /// Relay WebSocket URL, e.g. ws://localhost:3000/ws
        #[arg(short, long, value_name = "URL")]
        relay: Option<String>,

        #[arg(long)]
        id: Option<String>,

        /// Emit synthetic positions every N milliseconds
        #[arg(long, value_name = "MS", conflicts_with_all = ["lat", "lng"])]
        synthetic_ms: Option<u64>,

        #[arg(long, requires = "lng", allow_negative_numbers = true)]
        lat: Option<f64>,

        #[arg(long, requires = "lat", allow_negative_numbers = true)]
        lng: Option<f64>,

        /// Seconds between table refreshes
        #[arg(long, default_value = "2")]
        refresh: u64,
    },

    /// Publish a single position and leave
    Locate {
        #[arg(short, long, value_name = "URL")]
        relay: Option<String>,

        #[arg(long)]
        id: Option<String>,

        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        #[arg(long, allow_negative_numbers = true)]
        lng: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        if cli.config.exists() && !force {
            anyhow::bail!("{} already exists (use --force)", cli.config.display());
        }
        let config = GeoshareConfig::init(&cli.config).await?;
        println!("{} Wrote {}", "✓".green(), cli.config.display().to_string().bright_white());
        println!(
            "{} Participant ID: {}",
            "→".bright_blue(),
            config.participant.id.to_string().bright_yellow()
        );
        println!("\n{}", "Next steps:".yellow());
        println!("  1. {} - Start the relay", "geoshare serve".bright_white());
        println!("  2. {} - Join and share", "geoshare join --synthetic-ms 1000".bright_white());
        return Ok(());
    }

    let mut config = GeoshareConfig::load(&cli.config)?;
    let _log_guard = logging::init(&config.logging)?;

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),

        Commands::Serve { port, bind, echo } => {
            if let Some(port) = port {
                config.relay.port = port;
            }
            if let Some(bind) = bind {
                config.relay.bind = bind;
            }
            if echo {
                config.relay.echo_policy = EchoPolicy::IncludeSender;
            }
            println!(
                "{}",
                format!("🌐 Starting relay on port {}...", config.relay.port)
                    .cyan()
                    .bold()
            );
            relay::start(&config.relay).await?;
        }

        Commands::Join {
            relay,
            id,
            synthetic_ms,
            lat,
            lng,
            refresh,
        } => {
            if let Some(url) = relay {
                config.participant.relay_url = url;
            }
            if let Some(id) = id {
                config.participant.id = ParticipantId::new(id);
            }
            if let Some(interval_ms) = synthetic_ms {
                config.participant.source = SourceConfig::Synthetic { interval_ms };
            } else if let (Some(lat), Some(lng)) = (lat, lng) {
                config.participant.source = SourceConfig::Live {
                    fixed: Some(Coordinates::new(lat, lng)),
                };
            }
            join(&config, Duration::from_secs(refresh.max(1))).await?;
        }

        Commands::Locate { relay, id, lat, lng } => {
            if let Some(url) = relay {
                config.participant.relay_url = url;
            }
            if let Some(id) = id {
                config.participant.id = ParticipantId::new(id);
            }
            let session = Session::join(&config.participant).await?;
            let sample = LocationSample::new(session.id().clone(), lat, lng);
            session.publish(sample)?;
            // let the writer flush before closing
            tokio::time::sleep(Duration::from_millis(100)).await;
            session.shutdown();
            println!("{} Published ({}, {})", "✓".green(), lat, lng);
        }
    }

    Ok(())
}

async fn join(config: &GeoshareConfig, refresh: Duration) -> Result<()> {
    let participant = &config.participant;
    println!("{} Participant: {}", "→".bright_blue(), participant.id.to_string().bright_yellow());
    println!("{} Relay: {}\n", "→".bright_blue(), participant.relay_url.bright_white());

    let session = Session::join(participant).await?;

    if let SourceConfig::Live { .. } = participant.source {
        if let Err(e) = session.request_location().await {
            println!("{} {} (peers will still be shown)", "⚠".yellow(), e);
        }
    }

    let mut ticker = tokio::time::interval(refresh);
    loop {
        tokio::select! {
            _ = ticker.tick() => print_table(&session),
            _ = tokio::signal::ctrl_c() => break,
            _ = session.channel().closed() => {
                println!("{} Relay connection lost; showing last known positions", "⚠".yellow());
                print_table(&session);
                break;
            }
        }
    }

    session.shutdown();
    Ok(())
}

fn print_table(session: &Session) {
    let samples = session.snapshot();
    println!("{}", format!("Participants ({})", samples.len()).cyan().bold());
    println!("{}", "═".repeat(60).bright_black());
    for sample in samples {
        let marker = if &sample.id == session.id() { "●".green() } else { "○".bright_blue() };
        println!(
            "{} {:<24} {:>11.5} {:>11.5}",
            marker,
            sample.id.to_string().bright_white(),
            sample.lat,
            sample.lng
        );
    }
    println!();
}
