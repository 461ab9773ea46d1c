use std::sync::Arc;

use clap::Parser;
use mini_gfs::config::{load_config, Config};
use mini_gfs::master::service::MasterService;
use mini_gfs::master::{background, Master};
use mini_gfs::proto::master::master_server::MasterServer;
use tonic::transport::Server;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "mini-gfs master: namespace, placement, and lease authority")]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,
}

fn init_tracing(log_level: &str, log_output: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if log_output == "stdout" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    } else {
        let file_appender = tracing_appender::rolling::never(".", log_output);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init();
        Some(guard)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config).unwrap_or_else(|e| {
        eprintln!("could not load {}: {e}, falling back to defaults", args.config);
        Config::default()
    });

    let _guard = init_tracing(&config.common.log_level, &config.common.log_output);

    let master = Master::open(config.master.clone(), config.common.clone()).await?;
    background::spawn_all(master.clone());

    let addr = format!("0.0.0.0:{}", config.master.port).parse()?;
    info!(%addr, "master listening");

    Server::builder()
        .add_service(MasterServer::new(MasterService::new(master)))
        .serve(addr)
        .await?;

    warn!("master server exited");
    Ok(())
}
