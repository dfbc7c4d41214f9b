//! linefetch: serve or fetch files over a line-oriented TCP protocol.
//!
//! Subcommands:
//! - `serve`: run the file server bounded to a root directory
//! - `fetch`: request one file and print or save it

use linefetch::config::{Action, ClientConfig, Config, ServerConfig};
use linefetch::{Requester, Server};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match config.action {
        Action::Serve(server) => serve(server).await,
        Action::Fetch {
            client,
            path,
            output,
        } => fetch(client, &path, output).await,
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        root = %config.root.display(),
        max_connections = config.max_connections,
        "Starting linefetch server"
    );

    let server = Server::bind(config).map_err(|e| {
        error!(error = %e, "Failed to start server");
        e
    })?;
    server.run().await?;
    Ok(())
}

async fn fetch(
    config: ClientConfig,
    path: &str,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let requester = Requester::new(config);

    match output {
        Some(output) => {
            let bytes = requester.fetch_to_path(path, &output).await?;
            info!(path, output = %output.display(), bytes, "File saved");
        }
        None => {
            let body = requester.fetch(path).await?;
            print!("{}", String::from_utf8_lossy(&body));
        }
    }
    Ok(())
}
