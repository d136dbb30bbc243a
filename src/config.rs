use crate::services::session_registry::DEFAULT_MAX_TOTAL_CHUNKS;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Directory holding merged files.
    pub storage_dir: String,
    /// Directory holding staged chunks, one subdirectory per upload.
    pub staging_dir: String,
    pub database_url: String,
    /// Inactivity bound after which open or failed sessions are reclaimed.
    pub session_ttl_secs: u64,
    /// How long a completed session is kept to answer late duplicates.
    pub completed_retention_secs: u64,
    pub sweep_interval_secs: u64,
    /// Request body limit for a single chunk upload.
    pub max_chunk_bytes: usize,
    /// Largest `totalChunks` a client may declare for one upload.
    pub max_total_chunks: u32,
    /// Remove the merged file from disk when its record is deleted.
    pub purge_files_on_delete: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked file upload and catalog service")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where merged files are stored (overrides CHUNKED_UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory where chunks are staged (overrides CHUNKED_UPLOAD_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds of inactivity before an unfinished upload is swept (overrides CHUNKED_UPLOAD_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds a completed upload is remembered (overrides CHUNKED_UPLOAD_COMPLETED_RETENTION_SECS)
    #[arg(long)]
    pub completed_retention_secs: Option<u64>,

    /// Seconds between sweeps (overrides CHUNKED_UPLOAD_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Maximum request size of one chunk upload (overrides CHUNKED_UPLOAD_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Largest number of chunks one upload may declare (overrides CHUNKED_UPLOAD_MAX_TOTAL_CHUNKS)
    #[arg(long)]
    pub max_total_chunks: Option<u32>,

    /// Delete merged files from disk together with their records
    #[arg(long)]
    pub purge_files_on_delete: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge parsed CLI args over environment values and defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        let env_host = env::var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("CHUNKED_UPLOAD_PORT", 3000)?;
        let env_storage =
            env::var("CHUNKED_UPLOAD_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_staging =
            env::var("CHUNKED_UPLOAD_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_db = env::var("CHUNKED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into());
        let env_ttl = env_parse("CHUNKED_UPLOAD_SESSION_TTL_SECS", 24 * 60 * 60)?;
        let env_retention = env_parse("CHUNKED_UPLOAD_COMPLETED_RETENTION_SECS", 300)?;
        let env_sweep = env_parse("CHUNKED_UPLOAD_SWEEP_INTERVAL_SECS", 600)?;
        let env_max_chunk = env_parse("CHUNKED_UPLOAD_MAX_CHUNK_BYTES", 64 * 1024 * 1024)?;
        let env_max_total = env_parse("CHUNKED_UPLOAD_MAX_TOTAL_CHUNKS", DEFAULT_MAX_TOTAL_CHUNKS)?;
        let env_purge = env_parse("CHUNKED_UPLOAD_PURGE_FILES_ON_DELETE", false)?;

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            database_url: args.database_url.unwrap_or(env_db),
            session_ttl_secs: args.session_ttl_secs.unwrap_or(env_ttl),
            completed_retention_secs: args.completed_retention_secs.unwrap_or(env_retention),
            sweep_interval_secs: args.sweep_interval_secs.unwrap_or(env_sweep).max(1),
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
            max_total_chunks: args.max_total_chunks.unwrap_or(env_max_total).max(1),
            purge_files_on_delete: args.purge_files_on_delete || env_purge,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
