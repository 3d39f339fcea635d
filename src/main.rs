use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gantry_core::config::AppConfig;
use gantry_core::error::GantryError;
use gantry_core::types::{ExtraNode, InputFile};
use gantry_runner::{RunRequest, Runner};

#[derive(Parser)]
#[command(name = "gantry", version, about = "Workflow orchestrator for a graph-execution server")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gantry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow end to end
    Run {
        /// Path to a workflow graph file, or the graph JSON inline
        workflow: String,

        /// Directory collected outputs are moved to
        #[arg(short, long, default_value = "./output")]
        output: PathBuf,

        /// Only collect outputs from these node ids
        #[arg(long)]
        output_node: Vec<String>,

        /// Input file to stage before dispatch (path or URL), repeatable
        #[arg(long)]
        input: Vec<String>,

        /// Extra plugin to install by git URL, repeatable
        #[arg(long)]
        node_url: Vec<String>,

        /// Client id for the push channel and cancellation
        /// (auto-generated if not provided)
        #[arg(long)]
        client_id: Option<String>,

        /// Stop the server after the run finishes
        #[arg(long)]
        stop_server: bool,
    },
    /// Flag a generation as cancelled and interrupt it if running
    Cancel {
        /// The client id the generation was dispatched with; omit to
        /// interrupt whatever is currently executing
        #[arg(default_value = "")]
        client_id: String,
    },
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gantry=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(GantryError::ConfigNotFound(_)) => {
            warn!(path = %cli.config.display(), "config file not found, using defaults");
            AppConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    match cli.command {
        Commands::Run {
            workflow,
            output,
            output_node,
            input,
            node_url,
            client_id,
            stop_server,
        } => {
            let mut request = RunRequest::new(workflow, output);
            request.output_node_ids = output_node;
            request.file_paths = input
                .into_iter()
                .map(|source| InputFile {
                    source,
                    dest_folder: None,
                    filename: None,
                })
                .collect();
            request.extra_nodes = node_url
                .into_iter()
                .map(|url| ExtraNode {
                    url,
                    commit_hash: None,
                })
                .collect();
            if let Some(id) = client_id {
                request.client_id = id;
            }
            request.stop_server_after = stop_server;

            info!(client_id = %request.client_id, "starting run");
            let result = Runner::new(config).run(&request).await?;

            if result.cancelled {
                info!("run was cancelled");
            }
            for missing in &result.models_not_found {
                warn!(model = %missing.name, similar = ?missing.similar, "model not found");
            }
            for line in &result.text_output {
                println!("{}", line);
            }
            for path in &result.file_paths {
                println!("{}", path);
            }
        }
        Commands::Cancel { client_id } => {
            Runner::new(config).cancel_generation(&client_id).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
