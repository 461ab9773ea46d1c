use clap::Parser;
use mini_gfs::chunkserver::service::ChunkService;
use mini_gfs::chunkserver::ChunkServerRuntime;
use mini_gfs::config::{load_config, Config};
use mini_gfs::proto::chunk::chunk_server::ChunkServer;
use tonic::transport::Server;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(about = "mini-gfs chunkserver: replicated on-disk chunk storage")]
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

    let runtime = ChunkServerRuntime::new(config.chunkserver.clone(), config.common.clone())?;
    runtime.clone().spawn_registration_and_heartbeat();

    let addr = format!("0.0.0.0:{}", config.chunkserver.port).parse()?;
    info!(chunkserver_id = %runtime.id, %addr, "chunkserver listening");

    Server::builder()
        .add_service(ChunkServer::new(ChunkService::new(
            runtime.storage.clone(),
            config.chunkserver,
            config.common,
        )))
        .serve(addr)
        .await?;

    warn!("chunkserver exited");
    Ok(())
}
