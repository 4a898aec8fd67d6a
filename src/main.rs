use std::path::PathBuf;

use clap::Parser;

use backchannel_server::ServerConfig;
use backchannel_store::Database;

/// Role-segmented internal messaging and notification service.
#[derive(Parser, Debug)]
#[command(name = "backchannel", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 9102)]
    port: u16,

    /// Database file. Defaults to ~/.backchannel/backchannel.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("starting backchannel server");

    let db_path = args
        .db
        .unwrap_or_else(|| dirs_home().join(".backchannel").join("backchannel.db"));
    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let config = ServerConfig {
        port: args.port,
        request_timeout_secs: args.request_timeout,
    };
    let handle = backchannel_server::start(config, db)
        .await
        .expect("failed to start server");

    tracing::info!(port = handle.port, "backchannel ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
