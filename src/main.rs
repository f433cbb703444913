//! Command-line client for the polystore connectors.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use polystore::{ConnectionProfile, ConnectorFactory};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "polystore")]
#[command(about = "Talk to FTP, SFTP, FastDFS, and MinIO backends through one interface", long_about = None)]
struct Cli {
    /// Path to a JSON connection profile
    #[arg(short, long, env = "POLYSTORE_PROFILE")]
    profile: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a remote path
    List {
        #[arg(default_value = "/")]
        path: String,

        /// Descend into subdirectories
        #[arg(long)]
        deep: bool,

        /// Hoist all descendants into one flat sequence
        #[arg(long)]
        flat: bool,

        /// Depth bound for deep listings; negative means unlimited
        #[arg(long, default_value = "-1")]
        max_depth: i32,
    },
    /// Upload a local file
    Upload {
        local: PathBuf,
        path: String,
        filename: String,
    },
    /// Download a remote file
    Download {
        path: String,
        filename: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a remote file
    Delete { path: String, filename: String },
    /// Create a remote directory
    Mkdir { path: String },
    /// Show metadata for a single remote file
    Peek { path: String, filename: String },
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let raw = tokio::fs::read_to_string(&cli.profile).await?;
    let profile: ConnectionProfile = serde_json::from_str(&raw)?;
    let store = ConnectorFactory::new().build(profile)?;

    let ok = match cli.command {
        Command::List {
            path,
            deep,
            flat,
            max_depth,
        } => match store.list(&path, deep, flat, max_depth).await {
            Some(entries) => {
                println!("{}", serde_json::to_string_pretty(&entries)?);
                true
            }
            None => false,
        },
        Command::Upload {
            local,
            path,
            filename,
        } => {
            let content = tokio::fs::read(&local).await?;
            store.upload(&content, &path, &filename).await
        }
        Command::Download {
            path,
            filename,
            output,
        } => match store.download(&path, &filename).await {
            Some(content) => {
                match output {
                    Some(out) => tokio::fs::write(&out, &content).await?,
                    None => {
                        use std::io::Write;
                        std::io::stdout().write_all(&content)?;
                    }
                }
                true
            }
            None => false,
        },
        Command::Delete { path, filename } => store.delete_file(&path, &filename).await,
        Command::Mkdir { path } => store.create_directory(&path).await,
        Command::Peek { path, filename } => match store.peek_file(&path, &filename).await {
            Some(entry) => {
                println!("{}", serde_json::to_string_pretty(&entry)?);
                true
            }
            None => false,
        },
    };

    store.disconnect().await;
    if ok {
        Ok(())
    } else {
        Err("operation failed".into())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("polystore=info".parse()?),
        )
        .init();

    run(cli).await
}
