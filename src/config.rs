use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::{env, str::FromStr, time::Duration};

use crate::auth::AuthConfig;

/// Where transfer bytes go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Bytes are brokered through this service and kept on local disk.
    Local,
    /// Bytes go straight to an S3-compatible service via presigned URLs.
    Remote,
}

/// Connection settings for the S3-compatible backend.
#[derive(Clone)]
pub struct RemoteStorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for RemoteStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStorageConfig")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub provider: ProviderKind,
    /// Prefix for generated transfer links; empty means root-relative.
    pub public_base_url: String,
    pub token_ttl: Duration,
    pub max_upload_size: i64,
    pub internal_bucket: String,
    pub auth: AuthConfig,
    pub hook_timeout: Duration,
    pub hook_workers: usize,
    pub hook_queue_capacity: usize,
    pub quota_bytes: Option<i64>,
    /// Log one audit line per completed transfer and login.
    pub audit_log: bool,
    pub reaper_interval: Duration,
    pub remote: Option<RemoteStorageConfig>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Token-mediated object transfer gateway")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides OBJECT_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Transfer provider (overrides OBJECT_GATEWAY_PROVIDER)
    #[arg(long, value_enum)]
    pub provider: Option<ProviderKind>,

    /// Base URL used in issued transfer links (overrides OBJECT_GATEWAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Transfer token lifetime in seconds (overrides OBJECT_GATEWAY_TOKEN_TTL_SECS)
    #[arg(long)]
    pub token_ttl_secs: Option<u64>,

    /// Largest accepted upload in bytes (overrides OBJECT_GATEWAY_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<i64>,

    /// Per-user quota in bytes; unset disables the quota hook (overrides OBJECT_GATEWAY_QUOTA_BYTES)
    #[arg(long)]
    pub quota_bytes: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_opt<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // .env is optional
        let _ = dotenvy::dotenv();

        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env_string("OBJECT_GATEWAY_HOST", "0.0.0.0");
        let env_port = env_or("OBJECT_GATEWAY_PORT", 3000u16)?;
        let env_storage = env_string("OBJECT_GATEWAY_STORAGE_DIR", "./data/objects");
        let env_db = env_string(
            "OBJECT_GATEWAY_DATABASE_URL",
            "sqlite://./data/meta/transfer_gateway.db",
        );
        let env_provider = match env::var("OBJECT_GATEWAY_PROVIDER") {
            Ok(value) => <ProviderKind as ValueEnum>::from_str(&value, true)
                .map_err(|err| anyhow::anyhow!("parsing OBJECT_GATEWAY_PROVIDER: {}", err))?,
            Err(_) => ProviderKind::Local,
        };
        let env_base_url = env_string("OBJECT_GATEWAY_PUBLIC_BASE_URL", "");
        let env_ttl = env_or("OBJECT_GATEWAY_TOKEN_TTL_SECS", 900u64)?;
        let env_max_upload = env_or("OBJECT_GATEWAY_MAX_UPLOAD_SIZE", 100 * 1024 * 1024i64)?;
        let env_quota = env_opt::<i64>("OBJECT_GATEWAY_QUOTA_BYTES")?;

        let jwt_secret = env::var("OBJECT_GATEWAY_JWT_SECRET")
            .context("OBJECT_GATEWAY_JWT_SECRET must be set")?;
        if jwt_secret.trim().is_empty() {
            bail!("OBJECT_GATEWAY_JWT_SECRET must not be empty");
        }
        let auth = AuthConfig {
            jwt_secret,
            issuer: env_opt::<String>("OBJECT_GATEWAY_JWT_ISSUER")?,
            leeway: Duration::from_secs(env_or("OBJECT_GATEWAY_JWT_LEEWAY_SECS", 30u64)?),
        };

        let provider = args.provider.unwrap_or(env_provider);
        let remote = match provider {
            ProviderKind::Local => None,
            ProviderKind::Remote => Some(RemoteStorageConfig {
                endpoint: env::var("OBJECT_GATEWAY_S3_ENDPOINT")
                    .context("OBJECT_GATEWAY_S3_ENDPOINT is required for the remote provider")?,
                region: env_string("OBJECT_GATEWAY_S3_REGION", "us-east-1"),
                bucket: env::var("OBJECT_GATEWAY_S3_BUCKET")
                    .context("OBJECT_GATEWAY_S3_BUCKET is required for the remote provider")?,
                access_key: env::var("OBJECT_GATEWAY_S3_ACCESS_KEY")
                    .context("OBJECT_GATEWAY_S3_ACCESS_KEY is required for the remote provider")?,
                secret_key: env::var("OBJECT_GATEWAY_S3_SECRET_KEY")
                    .context("OBJECT_GATEWAY_S3_SECRET_KEY is required for the remote provider")?,
            }),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            provider,
            public_base_url: args.public_base_url.unwrap_or(env_base_url),
            token_ttl: Duration::from_secs(args.token_ttl_secs.unwrap_or(env_ttl)),
            max_upload_size: args.max_upload_size.unwrap_or(env_max_upload),
            internal_bucket: env_string("OBJECT_GATEWAY_INTERNAL_BUCKET", "int_storage"),
            auth,
            hook_timeout: Duration::from_millis(env_or("OBJECT_GATEWAY_HOOK_TIMEOUT_MS", 2000u64)?),
            hook_workers: env_or("OBJECT_GATEWAY_HOOK_WORKERS", 4usize)?,
            hook_queue_capacity: env_or("OBJECT_GATEWAY_HOOK_QUEUE_CAPACITY", 1024usize)?,
            quota_bytes: args.quota_bytes.or(env_quota),
            audit_log: env_or("OBJECT_GATEWAY_AUDIT_LOG", true)?,
            reaper_interval: Duration::from_secs(env_or(
                "OBJECT_GATEWAY_REAPER_INTERVAL_SECS",
                300u64,
            )?),
            remote,
        };

        if cfg.max_upload_size <= 0 {
            bail!("max upload size must be positive");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
