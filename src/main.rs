//! Widget agent
//!
//! Runs one vehicle command from a widget or intent context and records the
//! outcome in the shared widget state.

mod command;
mod config;
mod transport;

use anyhow::Result;
use clap::{Parser, Subcommand};
use command::{CommandOutcome, VehicleCommander};
use config::AgentConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transport::{event_queue, BluerCentral};
use unustasis_shared::{JsonFileStore, WidgetAction, WidgetState};

#[derive(Parser)]
#[command(name = "widget-agent")]
#[command(about = "Send lock, unlock, seat and ping commands to the paired scooter")]
struct Cli {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared widget state file, overrides the config
    #[arg(short, long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a widget action: a token such as `lock` or a `unustasis://` URI
    Send { action: String },
    /// Print the shared widget state
    Status,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn parse_action(input: &str) -> Result<WidgetAction> {
    let action = if input.contains("://") {
        WidgetAction::parse_uri(input)?
    } else {
        WidgetAction::from_token(input)?
    };
    Ok(action)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match AgentConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{:#}", e);
                return ExitCode::FAILURE;
            }
        },
        None => AgentConfig::default(),
    };
    if let Some(store) = cli.store {
        config.store_path = Some(store);
    }
    init_logging(&config.log_level);

    match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: AgentConfig) -> Result<ExitCode> {
    let store_path = config.resolve_store_path()?;
    info!("[AGENT] Widget state at {}", store_path.display());
    let widget = WidgetState::new(Arc::new(JsonFileStore::new(store_path)));

    let action = match command {
        Commands::Status => {
            print_status(&widget);
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Send { action } => parse_action(&action)?,
    };

    let kind = match action {
        WidgetAction::Command(kind) => kind,
        WidgetAction::Scan => {
            info!("[AGENT] Scan is a refresh handled by the host application");
            return Ok(ExitCode::SUCCESS);
        }
    };

    let (events_tx, events_rx) = event_queue();
    let central = Arc::new(BluerCentral::new(events_tx).await);
    let commander = VehicleCommander::new(central, events_rx, widget, config.command_config());

    let outcome = commander.execute_command(kind).await;
    match &outcome {
        CommandOutcome::Completed { kind, locked } => match locked {
            Some(locked) => println!("{}: ok (locked={})", kind, locked),
            None => println!("{}: ok", kind),
        },
        CommandOutcome::Failed { reason } => println!("{}: failed ({})", kind, reason),
        CommandOutcome::Rejected { reason } => println!("{}: rejected ({})", kind, reason),
    }

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_status(widget: &WidgetState) {
    match widget.vehicle_identity() {
        Some(identity) => println!("vehicle:  {}", identity),
        None => println!("vehicle:  none saved"),
    }
    let show = |v: Option<String>| v.unwrap_or_else(|| "-".into());
    println!("state:    {}", show(widget.state_name()));
    println!("locked:   {}", show(widget.locked().map(|v| v.to_string())));
    println!("scanning: {}", show(widget.scanning().map(|v| v.to_string())));
    if let Some(started) = widget.scanning_started_at() {
        println!("since:    {} ms", started);
    }
    let (soc1, soc2) = widget.battery_levels();
    println!(
        "battery:  {}% / {}%",
        show(soc1.map(|v| v.to_string())),
        show(soc2.map(|v| v.to_string()))
    );
    if let Some((lat, lon)) = widget.last_location() {
        println!("location: {:.5}, {:.5}", lat, lon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unustasis_shared::CommandKind;

    #[test]
    fn test_parse_action_accepts_tokens_and_uris() {
        assert_eq!(
            parse_action("lock").unwrap(),
            WidgetAction::Command(CommandKind::Lock)
        );
        assert_eq!(
            parse_action("unustasis://OpenSeat").unwrap(),
            WidgetAction::Command(CommandKind::OpenSeat)
        );
        assert_eq!(parse_action("scan").unwrap(), WidgetAction::Scan);
        assert!(parse_action("https://lock").is_err());
        assert!(parse_action("honk").is_err());
    }

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from(["widget-agent", "--store", "/tmp/s.json", "send", "unlock"])
            .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s.json")));
        assert!(matches!(cli.command, Commands::Send { action } if action == "unlock"));
    }
}
