use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, net::SocketAddr, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use config::{AppConfig, ProviderKind};
use services::{
    blob_store::{BlobStore, DiskBlobStore, S3BlobStore, connect_bucket},
    extensions::builtin_registry,
    gateway::{GatewaySettings, TransferGateway},
    hooks::{DispatcherSettings, HookDispatcher, NullHookDispatcher, RegistryDispatcher},
    object_store::{ObjectStore, SqliteObjectStore},
    provider::{LocalTokenProvider, ProviderAdapter, RemotePresignedProvider},
    reaper::TokenReaper,
    token_store::{SqliteTokenStore, TokenStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting transfer-gateway with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if cfg.provider == ProviderKind::Local && !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Assemble the gateway ---
    let objects: Arc<dyn ObjectStore> = Arc::new(SqliteObjectStore::new(db.clone()));
    let tokens: Arc<dyn TokenStore> = Arc::new(SqliteTokenStore::new(db.clone()));

    let (blobs, provider): (Arc<dyn BlobStore>, Arc<dyn ProviderAdapter>) = match &cfg.remote {
        Some(remote) => {
            tracing::info!(endpoint = %remote.endpoint, bucket = %remote.bucket, "Using remote provider");
            let bucket = connect_bucket(remote).context("connecting to remote storage")?;
            (
                Arc::new(S3BlobStore::new(bucket.clone())),
                Arc::new(RemotePresignedProvider::new(
                    tokens.clone(),
                    bucket,
                    cfg.public_base_url.clone(),
                )),
            )
        }
        None => (
            Arc::new(DiskBlobStore::new(&cfg.storage_dir)),
            Arc::new(LocalTokenProvider::new(
                tokens.clone(),
                cfg.public_base_url.clone(),
            )),
        ),
    };

    let registry = builtin_registry(objects.clone(), cfg.quota_bytes, cfg.audit_log);
    let hooks: Arc<dyn HookDispatcher> = if registry.is_empty() {
        tracing::info!("No hooks enabled");
        Arc::new(NullHookDispatcher)
    } else {
        Arc::new(RegistryDispatcher::new(
            registry,
            DispatcherSettings {
                hook_timeout: cfg.hook_timeout,
                workers: cfg.hook_workers,
                queue_capacity: cfg.hook_queue_capacity,
            },
        ))
    };

    let gateway = TransferGateway::new(
        objects,
        tokens.clone(),
        blobs,
        provider,
        hooks,
        GatewaySettings {
            token_ttl: cfg.token_ttl,
            max_upload_size: cfg.max_upload_size,
            internal_bucket: cfg.internal_bucket.clone(),
            quota_bytes: cfg.quota_bytes,
        },
    );
    gateway
        .ensure_internal_bucket()
        .await
        .map_err(|e| anyhow::anyhow!("preparing internal bucket: {}", e))?;

    // --- Background token reaper ---
    let reaper = TokenReaper::new(tokens, cfg.reaper_interval);
    tokio::spawn(async move { reaper.run().await });

    // --- Build router ---
    let verifier = Arc::new(auth::JwtVerifier::new(cfg.auth.clone()));
    let app: Router = routes::routes::with_request_tracing(
        routes::routes::routes(verifier).with_state(gateway),
    );

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
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
