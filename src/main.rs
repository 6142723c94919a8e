use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use ranksplit::{CommandPayload, Config};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let payload = Arc::new(CommandPayload::new(&config.payload, &config.output_dir));
    let result = match ranksplit::run(&config, payload).await {
        Ok(stats) => {
            stats.print_general_statistics();
            stats.export(&config.output_dir).map(|_| ())
        }
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}
