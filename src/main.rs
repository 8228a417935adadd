use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use sdl_core::config::{Config, Selection};
use sdl_core::hardware::mock::MockRig;
use sdl_core::labware::DeckLayout;
use sdl_core::scheduler::{RunOutcome, Scheduler};
use sdl_core::store::{SqliteStore, Store};
use sdl_core::{logging, SdlError};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "sdl-daemon")]
#[command(about = "Self-driving lab control loop", long_about = None)]
struct Cli {
    /// Configuration file (defaults to sdl.toml in the working directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler (default)
    Run {
        /// Drive simulated hardware
        #[arg(long)]
        mock: bool,
        /// Run a single experiment, then exit
        #[arg(long)]
        one_off: bool,
        /// Break priority ties at random instead of by lowest id
        #[arg(long)]
        random: bool,
        /// Stop after this many completed experiments
        #[arg(long)]
        campaign_length: Option<u32>,
    },
    /// Print the system state and the queue
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sdl-daemon: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logging::init(&config.application) {
        eprintln!("sdl-daemon: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command.unwrap_or(Commands::Run {
        mock: false,
        one_off: false,
        random: false,
        campaign_length: None,
    }) {
        Commands::Run {
            mock,
            one_off,
            random,
            campaign_length,
        } => run(config, mock, one_off, random, campaign_length).await,
        Commands::Status => status(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "Exiting with failure");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    mut config: Config,
    mock: bool,
    one_off: bool,
    random: bool,
    campaign_length: Option<u32>,
) -> anyhow::Result<()> {
    config.application.mock_hardware |= mock;
    config.scheduler.one_off |= one_off;
    if random {
        config.scheduler.selection = Selection::Random;
    }
    if campaign_length.is_some() {
        config.scheduler.campaign_length = campaign_length;
    }

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.database.path)
            .with_context(|| format!("opening {}", config.database.path.display()))?,
    );

    let toolkit = if config.application.mock_hardware {
        if store.active_plate()?.is_none() {
            tracing::info!("Empty database; installing the simulated deck");
            DeckLayout::demo().install(store.as_ref())?;
        }
        MockRig::new().toolkit()
    } else {
        anyhow::bail!("no hardware drivers are linked into this build; use --mock");
    };

    tracing::info!(
        name = %config.application.name,
        mock = config.application.mock_hardware,
        selection = ?config.scheduler.selection,
        "Starting"
    );
    let mut scheduler = Scheduler::new(config, store, toolkit)?;
    match scheduler.run().await {
        Ok(RunOutcome::Shutdown | RunOutcome::OneOffComplete | RunOutcome::CampaignComplete) => {
            Ok(())
        }
        Err(SdlError::ShutDown) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn status(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.database.path)
        .with_context(|| format!("opening {}", config.database.path.display()))?;
    let state = store
        .system_state()?
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());
    println!("system: {state}");
    for entry in store.queued_experiments()? {
        println!(
            "  #{:<6} priority {:<4} well {}",
            entry.experiment_id, entry.priority, entry.well_id
        );
    }
    Ok(())
}
