//! loomdb server binary

use clap::Parser;
use tracing::info;

use loomdb::{Config, Server};

#[derive(Parser)]
#[command(name = "loomdb-server")]
#[command(author, version, about = "loomdb — in-memory JSON document database")]
struct Cli {
    /// Configuration file (JSON); defaults apply when omitted
    #[arg(short, long, env = "LOOMDB_CONFIG")]
    config: Option<String>,

    /// Override the listen address
    #[arg(short, long, env = "LOOMDB_ADDRESS")]
    address: Option<String>,

    /// Override the data directory
    #[arg(short, long, env = "LOOMDB_DATA_DIR")]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("loomdb=info".parse()?),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(address) = cli.address {
        config.server.listen_addr = address;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir.into();
    }

    info!(
        data_dir = %config.storage.data_dir.display(),
        addr = %config.server.listen_addr,
        "starting loomdb"
    );

    let server = Server::new(config).await?;

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
    };
    server.run(shutdown).await?;

    info!("bye");
    Ok(())
}
