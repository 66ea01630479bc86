use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Error;
use tokio_util::sync::CancellationToken;
use websdrd::channel::preset::PresetTable;

#[derive(Debug, Parser)]
struct Args {
    /// Path to the daemon configuration file
    #[clap(short, long, env = "WEBSDRD_CONFIG")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let text = std::fs::read_to_string(&args.config)?;
    let config = websdrd::config::load(&text)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutting down");
                cancel.cancel();
            }
        }
    });

    websdrd::run(config, PresetTable::builtin(), cancel).await?;

    Ok(())
}
