use anyhow::{Context, Result};
use clap::Parser;
use std::{collections::BTreeSet, env, path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;
const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;
const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Share of a chunk request body reserved for the multipart framing and the
/// non-chunk fields.
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// MIME types accepted when no explicit allow-list is configured.
pub const DEFAULT_ALLOWED_MIME_TYPES: [&str; 11] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "video/mp4",
    "video/avi",
    "video/mov",
    "application/pdf",
    "text/plain",
    "application/zip",
    "application/x-rar-compressed",
];

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub upload: UploadConfig,
}

/// Settings consumed by the upload session manager and chunk store.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Upper bound on a declared file size, in bytes.
    pub max_file_size: u64,
    /// Chunk size used when the client does not pick one.
    pub chunk_size: u64,
    pub allowed_mime_types: BTreeSet<String>,
    /// Where merged and simple-upload files end up.
    pub upload_dir: PathBuf,
    /// Where chunk blobs wait for their merge.
    pub temp_dir: PathBuf,
    /// Largest HTTP request body accepted by the upload routes.
    pub max_request_bytes: usize,
    /// Age after which an unfinished session is swept. `None` disables the sweep.
    pub session_ttl: Option<Duration>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            allowed_mime_types: DEFAULT_ALLOWED_MIME_TYPES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            upload_dir: PathBuf::from("./uploads"),
            temp_dir: PathBuf::from("./uploads/tmp"),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            session_ttl: Some(Duration::from_secs(DEFAULT_SESSION_TTL_SECS)),
        }
    }
}

impl UploadConfig {
    pub fn is_mime_allowed(&self, mime_type: &str) -> bool {
        self.allowed_mime_types.contains(mime_type)
    }

    pub fn is_size_allowed(&self, size: u64) -> bool {
        size > 0 && size <= self.max_file_size
    }

    /// Largest chunk that still fits in one upload request.
    pub fn max_chunk_size(&self) -> u64 {
        self.max_request_bytes.saturating_sub(MULTIPART_OVERHEAD) as u64
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked file upload service")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_SERVICE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_SERVICE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides UPLOAD_SERVICE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory for completed files (overrides UPLOAD_SERVICE_UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Directory for pending chunks (overrides UPLOAD_SERVICE_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Maximum file size in bytes (overrides UPLOAD_SERVICE_MAX_FILE_SIZE)
    #[arg(long)]
    pub max_file_size: Option<u64>,

    /// Default chunk size in bytes (overrides UPLOAD_SERVICE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let defaults = UploadConfig::default();

        // --- Environment fallback ---
        let env_host = env::var("UPLOAD_SERVICE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("UPLOAD_SERVICE_PORT")?.unwrap_or(3000);
        let env_db = env::var("UPLOAD_SERVICE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into());
        let env_upload_dir = env::var("UPLOAD_SERVICE_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.upload_dir);
        let env_temp_dir = env::var("UPLOAD_SERVICE_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.temp_dir);
        let env_max_size =
            env_parse("UPLOAD_SERVICE_MAX_FILE_SIZE")?.unwrap_or(defaults.max_file_size);
        let env_chunk_size =
            env_parse("UPLOAD_SERVICE_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size);
        let max_request_bytes =
            env_parse("UPLOAD_SERVICE_MAX_REQUEST_BYTES")?.unwrap_or(defaults.max_request_bytes);
        let session_ttl = match env_parse::<u64>("UPLOAD_SERVICE_SESSION_TTL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.session_ttl,
        };
        let allowed_mime_types = match env::var("UPLOAD_SERVICE_ALLOWED_MIME_TYPES") {
            Ok(list) => parse_mime_list(&list),
            Err(_) => defaults.allowed_mime_types,
        };

        // --- Merge ---
        let chunk_size = args.chunk_size.unwrap_or(env_chunk_size);
        if chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            upload: UploadConfig {
                max_file_size: args.max_file_size.unwrap_or(env_max_size),
                chunk_size,
                allowed_mime_types,
                upload_dir: args.upload_dir.unwrap_or(env_upload_dir),
                temp_dir: args.temp_dir.unwrap_or(env_temp_dir),
                max_request_bytes,
                session_ttl,
            },
        };

        if cfg.upload.chunk_size > cfg.upload.max_chunk_size() {
            anyhow::bail!(
                "chunk size {} does not fit in a request of {} bytes ({} reserved for multipart framing)",
                cfg.upload.chunk_size,
                cfg.upload.max_request_bytes,
                MULTIPART_OVERHEAD
            );
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an optional environment variable.
fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

/// Split a comma-separated MIME list, dropping blanks.
fn parse_mime_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty())
        .collect()
}
