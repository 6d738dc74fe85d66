//! authgate - authentication gateway

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use authgate::{
    cli::{Cli, Command},
    config::Config,
    server::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Validate) => run_validate(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn load_config(cli: &Cli) -> authgate::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    config.validate()?;
    Ok(config)
}

/// Check the configuration without starting anything
fn run_validate(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Ok(config) => {
            println!("✅ configuration is valid");
            for (key, provider, _) in config.session.oauth2_providers() {
                let flow = if provider.password_flow { "password" } else { "code" };
                println!("   {} ({key}, {flow})", provider.display_name(key));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        providers = config.session.providers.len(),
        store = %config.session.store.active,
        "Starting authgate"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
