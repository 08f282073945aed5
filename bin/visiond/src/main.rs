//! `visiond` — the recognition pipeline server binary.
//!
//! Usage:
//!   visiond [--data-dir <dir>] [--sqlite <path>] [--listen <addr>]

mod routes;

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use vision_core::Module;

/// Recognition pipeline server.
#[derive(Parser, Debug)]
#[command(name = "visiond", about = "Image recognition task orchestration server")]
struct Cli {
    /// Directory for persistent data.
    #[arg(long = "data-dir", default_value = "./data")]
    data_dir: std::path::PathBuf,

    /// Path to the SQLite database (defaults to {data-dir}/data.sqlite).
    #[arg(long = "sqlite")]
    sqlite: Option<std::path::PathBuf>,

    /// Listen address.
    #[arg(long = "listen", default_value = "0.0.0.0:8080")]
    listen: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = vision_core::ServiceConfig {
        data_dir: Some(cli.data_dir.clone()),
        sqlite_path: cli.sqlite.clone(),
        listen: cli.listen.clone(),
    };

    // Initialize storage.
    std::fs::create_dir_all(&cli.data_dir)?;
    let sql: Arc<dyn vision_sql::SQLStore> = Arc::new(
        vision_sql::SqliteStore::open(&config.resolve_sqlite_path())
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {e}"))?,
    );

    // Initialize modules.
    let recognition_module = recognition::RecognitionModule::new(sql)?;
    info!("Recognition module initialized");

    let module_routes = vec![(
        recognition_module.name().to_string(),
        recognition_module.routes(),
    )];

    // Build router and serve.
    let app = routes::build_router(module_routes);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!("visiond listening on {}", config.listen);
    axum::serve(listener, app).await?;

    Ok(())
}
