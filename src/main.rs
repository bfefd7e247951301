use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use planet_admin::action::{ActionKind, ActionOptions};
use planet_admin::commands;
use planet_admin::config::AdminConfig;
use planet_admin::gateway::{HttpGateway, MemoryGateway, RemoteGateway};
use planet_admin::session::Session;

#[derive(Parser)]
#[command(name = "planet-admin")]
#[command(about = "Inspect and control the components of a streaming manager")]
struct Cli {
    /// Manager base URL (overrides config and PLANET_ADMIN_URL)
    #[arg(long, global = true)]
    manager: Option<String>,

    /// API key for the manager
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Seconds to wait for each component to reach its mood
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Use a built-in demo manager instead of connecting
    #[arg(long, global = true)]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the flows, atmosphere, and components in the planet
    Showplanet,
    /// Show the workers logged into the manager
    Showworkers,
    /// Show everything known about a component
    Showcomponent { path: String },
    /// Get the mood of a component
    Getmood { path: String },
    /// Get a property of a component
    Getprop { path: String, property: String },
    /// List the properties a component has
    Listprops { path: String },
    /// Call a method on a component
    Invoke { path: String, method: String },
    /// Load a configuration file into the manager
    Loadconfiguration {
        file: PathBuf,
        /// Also save the configuration on the manager under this name
        save_as: Option<String>,
    },
    /// Remove all stopped components
    Clean,
    /// Start a component, a flow (/flow), the atmosphere, or everything (/)
    Start { path: String },
    /// Stop a component, a flow, the atmosphere, or everything
    Stop { path: String },
    /// Delete stopped components
    Delete { path: String },
    /// Print mood and worker changes until Ctrl-C
    Watch,
    /// List recently used managers
    Recent,
}

/// Initialize tracing with output to stderr so stdout only carries command output
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "planet_admin=info".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = AdminConfig::load()?;
    if let Some(url) = cli.manager {
        config.manager_url = url;
    }
    if let Some(key) = cli.api_key {
        config.api_key = Some(key);
    }
    if let Some(secs) = cli.timeout {
        config.wait_timeout_secs = Some(secs);
    }

    if matches!(cli.command, Commands::Recent) {
        println!("{}", commands::recent(&config));
        return Ok(());
    }

    let gateway: Arc<dyn RemoteGateway> = if cli.demo {
        Arc::new(MemoryGateway::demo())
    } else {
        tracing::info!("Connecting to manager at {}", config.manager_url);
        Arc::new(HttpGateway::from_config(&config))
    };
    let session = Session::connect(gateway).await?;

    if !cli.demo {
        let url = config.manager_url.clone();
        config.remember_connection(&url, Utc::now());
        if let Err(e) = config.save() {
            tracing::warn!("could not save recent connections: {:#}", e);
        }
    }

    let options = ActionOptions {
        timeout: config.wait_timeout(),
    };

    let output = match cli.command {
        Commands::Showplanet => commands::show_planet(&session)?,
        Commands::Showworkers => commands::show_workers(&session),
        Commands::Showcomponent { path } => commands::show_component(&session, &path)?,
        Commands::Getmood { path } => commands::get_mood(&session, &path)?,
        Commands::Getprop { path, property } => {
            commands::get_property(&session, &path, &property)?
        }
        Commands::Listprops { path } => commands::list_properties(&session, &path)?,
        Commands::Invoke { path, method } => commands::invoke(&session, &path, &method).await?,
        Commands::Loadconfiguration { file, save_as } => {
            commands::load_configuration(&session, &file, save_as.as_deref()).await?
        }
        Commands::Clean => commands::clean(&session).await?,
        Commands::Start { path } => {
            commands::perform(&session, ActionKind::Start, &path, &options).await?
        }
        Commands::Stop { path } => {
            commands::perform(&session, ActionKind::Stop, &path, &options).await?
        }
        Commands::Delete { path } => {
            commands::perform(&session, ActionKind::Delete, &path, &options).await?
        }
        Commands::Watch => {
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!("cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            };
            commands::watch(&session, shutdown, &mut std::io::stdout()).await?;
            String::new()
        }
        Commands::Recent => commands::recent(&config),
    };

    if !output.is_empty() {
        println!("{}", output.trim_end());
    }
    session.close();
    Ok(())
}
