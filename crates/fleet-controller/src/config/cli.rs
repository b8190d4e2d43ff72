use clap::Parser;
use clap::Subcommand;

use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about = None, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the fleet controller daemon
    Daemon(Box<DaemonArgs>),
    /// Print the Fleet custom resource definition as JSON
    #[command(name = "print-crd")]
    PrintCrd,
}
