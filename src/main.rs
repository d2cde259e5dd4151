use anyhow::Result;
use std::{io::ErrorKind, path::Path, sync::Arc};
use tokio::{fs, net::TcpListener};
use tracing_subscriber::EnvFilter;
use upload_service::{
    build_router, config, db,
    services::{chunk_store::LocalStorage, upload_service::UploadService},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-service with config: {:?}", cfg);

    // --- Ensure storage directories exist ---
    for dir in [&cfg.upload.upload_dir, &cfg.upload.temp_dir] {
        ensure_dir(dir).await?;
    }

    // --- Initialize SQLite connection ---
    let pool = db::connect(&cfg.database_url).await?;

    // --- Schema is idempotent; apply it on every start ---
    db::run_migrations(&pool).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let storage = Arc::new(LocalStorage::new(&cfg.upload.upload_dir));
    let service = UploadService::new(Arc::new(pool), storage, cfg.upload.clone());

    if let Some(ttl) = cfg.upload.session_ttl {
        service.spawn_session_sweeper(ttl);
        tracing::info!("Expiring unfinished uploads after {:?}", ttl);
    }

    // --- Build router ---
    let app = build_router(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ensure_dir(dir: &Path) -> Result<()> {
    if !fs::try_exists(dir).await? {
        fs::create_dir_all(dir).await?;
        tracing::info!("Created storage directory at {}", dir.display());
    }
    Ok(())
}
