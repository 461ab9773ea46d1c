use clap::{Parser, Subcommand};
use mini_gfs::client::Client;
use mini_gfs::config::{load_config, Config};

#[derive(Parser, Debug)]
#[command(about = "mini-gfs client: create, read, write, and append files")]
struct Args {
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Create { path: String },
    Write { path: String, offset: u64, data: String },
    Read { path: String, offset: u64, length: u64 },
    Append { path: String, data: String },
    Snapshot { source_path: String, dest_path: String },
    Rename { old_path: String, new_path: String },
    Delete { path: String },
    List { prefix: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config).unwrap_or_else(|e| {
        eprintln!("could not load {}: {e}, falling back to defaults", args.config);
        Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.client.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let client = Client::new(config.client, config.common);

    match args.command {
        Command::Create { path } => {
            client.create_file(&path).await?;
            println!("created {path}");
        }
        Command::Write { path, offset, data } => {
            client.write(&path, offset, data.as_bytes()).await?;
            println!("wrote {} bytes to {path} at offset {offset}", data.len());
        }
        Command::Read { path, offset, length } => {
            let data = client.read(&path, offset, length).await?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        Command::Append { path, data } => {
            let (chunk_index, record_offset) = client.append_record(&path, data.as_bytes()).await?;
            println!("appended to {path} at chunk {chunk_index}, offset {record_offset}");
        }
        Command::Snapshot { source_path, dest_path } => {
            client.snapshot(&source_path, &dest_path).await?;
            println!("snapshotted {source_path} -> {dest_path}");
        }
        Command::Rename { old_path, new_path } => {
            client.rename_file(&old_path, &new_path).await?;
            println!("renamed {old_path} -> {new_path}");
        }
        Command::Delete { path } => {
            client.delete_file(&path).await?;
            println!("deleted {path}");
        }
        Command::List { prefix } => {
            for path in client.list_directory(&prefix).await? {
                println!("{path}");
            }
        }
    }

    Ok(())
}
