mod app;
mod config;
mod fleet;
mod k8s;
mod logging;
mod reconcile;
mod scaling;
mod shutdown;
mod store;
mod util;

use anyhow::Result;
use clap::Parser;
use kube::CustomResourceExt;

use crate::app::ApplicationBuilder;
use crate::config::Cli;
use crate::config::Commands;
use crate::k8s::fleet::Fleet;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::PrintCrd => print_crd(),
    }
}

async fn run_daemon(daemon_args: crate::config::DaemonArgs) -> Result<()> {
    logging::init();

    tracing::info!("Starting fleet controller daemon");

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

fn print_crd() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&Fleet::crd())?);
    Ok(())
}
