use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub base_url: String,
    pub extensions: Vec<String>,
    pub max_weight_mb: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Document storage API with verified uploads")]
pub struct Args {
    /// Host to bind to (overrides DOCUMENT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DOCUMENT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides DOCUMENT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides DOCUMENT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Access URL prefix returned to clients (overrides DOCUMENT_STORE_BASE_URL)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Comma-separated extension allow-set (overrides DOCUMENT_STORE_EXTENSIONS)
    #[arg(long)]
    pub extensions: Option<String>,

    /// Largest registrable weight in MB (overrides DOCUMENT_STORE_MAX_WEIGHT_MB)
    #[arg(long)]
    pub max_weight_mb: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("DOCUMENT_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("DOCUMENT_STORE_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing DOCUMENT_STORE_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading DOCUMENT_STORE_PORT"),
        };
        let env_storage =
            env::var("DOCUMENT_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_db = env::var("DOCUMENT_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/document_store.db".into());
        let env_base_url = env::var("DOCUMENT_STORE_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000/storage/get/".into());
        let env_extensions = env::var("DOCUMENT_STORE_EXTENSIONS")
            .unwrap_or_else(|_| "pdf,doc,docx,xls,xlsx,jpg,jpeg,png,zip,txt".into());
        let env_max_weight = match env::var("DOCUMENT_STORE_MAX_WEIGHT_MB") {
            Ok(value) => value.parse::<i64>().with_context(|| {
                format!("parsing DOCUMENT_STORE_MAX_WEIGHT_MB value `{}`", value)
            })?,
            Err(env::VarError::NotPresent) => 50,
            Err(err) => return Err(err).context("reading DOCUMENT_STORE_MAX_WEIGHT_MB"),
        };

        // --- Merge ---
        let extensions = args
            .extensions
            .unwrap_or(env_extensions)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            base_url: args.base_url.unwrap_or(env_base_url),
            extensions,
            max_weight_mb: args.max_weight_mb.unwrap_or(env_max_weight),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
