use std::path::PathBuf;

use clap::Parser;
use etcd_scheduler::{config::SchedulerConfig, service::Service};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match SchedulerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                error!(path = %path.display(), error = %err, "failed to load config");
                std::process::exit(1);
            }
        },
        None => SchedulerConfig::default(),
    };
    info!(
        master = config.master,
        cluster_name = config.cluster_name,
        desired = config.desired_instance_count,
        "starting etcd scheduler"
    );

    let mut service = match Service::new(config).await {
        Ok(service) => service,
        Err(err) => {
            error!(error = %err, "failed to initialize the service");
            std::process::exit(1);
        }
    };
    if let Err(err) = service.start().await {
        error!(error = %err, "service died");
        std::process::exit(1);
    }
}
