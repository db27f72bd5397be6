use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use hubwire::hub::HubConnectionHandler;
use hubwire::server::{demo, start_server, ServerConfig};
use hubwire::HubOptions;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path; created with defaults when missing
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Print debug information
    #[clap(long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo hub over WebSocket at /hub
    Serve {
        /// Address to bind to
        #[clap(short, long, default_value = "127.0.0.1")]
        address: String,

        /// Port to listen on
        #[clap(short, long, default_value_t = 8080)]
        port: u16,

        /// Echo server error details to clients
        #[clap(long)]
        detailed_errors: bool,
    },

    /// Print the effective hub options
    Config,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let options = match HubOptions::load(cli.config.as_deref()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve {
            address,
            port,
            detailed_errors,
        } => {
            let mut options = options;
            options.enable_detailed_errors |= detailed_errors;
            let config = ServerConfig::new()
                .with_address(address)
                .with_port(port)
                .with_hub_options(options);
            serve(config)
        }
        Commands::Config => {
            println!("{}", options.summary());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn serve(config: ServerConfig) -> Result<()> {
    let handler = HubConnectionHandler::builder(demo::demo_definition()?)
        .options(config.hub_options.clone())
        .services(demo::demo_services())
        .hub_factory(|| demo::DemoHub)
        .build()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(start_server(handler, config))
}
