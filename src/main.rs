use std::io::IsTerminal;

use clap::{Parser, Subcommand};

use opencane_runtime::config::Configuration;
use opencane_runtime::StartupError;

#[derive(Parser)]
#[command(name = "opencane", about = "Backend runtime for assistive smart-cane devices")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the device-session runtime (default)
    Serve,

    /// Validate configuration and exit
    CheckConfig,

    /// Print the resolved configuration summary
    Doctor,
}

// Exit codes: 0 normal, 1 invalid configuration, 2 strict-startup
// dependency failure.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Configuration::create() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::CheckConfig => {
            println!("configuration ok");
        }
        Commands::Doctor => {
            println!("data dir:  {}", config.data_dir.display());
            println!("adapter:   {}", config.adapter);
            println!("profile:   {}", config.profile.name);
            println!("control:   {}:{}", config.listen_host, config.listen_port);
            println!(
                "ingest:    capacity={} workers={}",
                config.ingest_capacity, config.ingest_workers
            );
            println!("strict:    {}", config.strict_startup);
        }
        Commands::Serve => {
            if let Err(e) = opencane_runtime::run_runtime(config).await {
                eprintln!("Error: {e}");
                let code = match e {
                    StartupError::StrictDependency(_) => 2,
                    StartupError::Fatal(_) => 1,
                };
                std::process::exit(code);
            }
        }
    }
}
