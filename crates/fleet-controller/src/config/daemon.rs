use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "FLEET_NAMESPACE",
        help = "Kubernetes namespace to watch (empty for all namespaces)"
    )]
    pub namespace: Option<String>,

    #[arg(
        long,
        env = "INSTANCE_STORE_URL",
        default_value = "redis://127.0.0.1:6379",
        help = "Connection URL of the instance store"
    )]
    pub store_url: String,

    #[arg(
        long,
        default_value = "5000",
        help = "Delay before a fleet is reconciled again after a normal pass, in milliseconds"
    )]
    pub requeue_interval_ms: u64,

    #[arg(
        long,
        default_value = "10000",
        help = "Delay before a fleet is reconciled again after a failed pass, in milliseconds"
    )]
    pub error_requeue_interval_ms: u64,

    #[arg(
        long,
        default_value = "5000",
        help = "Interval of the shutdown negotiation timeout sweep, in milliseconds"
    )]
    pub shutdown_check_interval_ms: u64,

    #[arg(
        long,
        default_value = "30000",
        help = "Interval of the max-instance-age sweep, in milliseconds"
    )]
    pub age_check_interval_ms: u64,
}

impl DaemonArgs {
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms)
    }

    pub fn error_requeue_interval(&self) -> Duration {
        Duration::from_millis(self.error_requeue_interval_ms)
    }

    pub fn shutdown_check_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_check_interval_ms)
    }

    pub fn age_check_interval(&self) -> Duration {
        Duration::from_millis(self.age_check_interval_ms)
    }
}
