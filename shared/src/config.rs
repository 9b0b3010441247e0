use std::env;
use std::process;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendKind {
    Postgres,
    S3,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    /// Prefix used to build the retrievable URL of a stored object.
    pub public_base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_concurrent_users: usize,
    pub max_messages_in_flight: usize,
    pub history_page_size: u32,
    pub fallback_scan_size: u32,
    /// Scheduled poll period; `None` leaves syncing to push notifications.
    pub poll_interval_seconds: Option<u64>,
    pub watch_renewal_interval_seconds: u64,
    pub attachment_folder: String,
}

#[derive(Debug, Clone)]
pub struct GmailConnectorConfig {
    pub port: u16,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub oauth: GoogleOAuthConfig,
    pub sync: SyncConfig,
    pub gmail_api_base: String,
    pub pubsub_topic: Option<String>,
    pub frontend_url: String,
    pub provider_timeout_seconds: u64,
    pub api_rate_limit: u32,
    pub max_retries: u32,
}

fn get_required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| {
        eprintln!("ERROR: Required environment variable '{}' is not set", key);
        eprintln!("Please set this variable in your .env file or environment");
        process::exit(1);
    })
}

fn get_optional_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_port(port_str: &str, var_name: &str) -> u16 {
    port_str.parse::<u16>().unwrap_or_else(|_| {
        eprintln!(
            "ERROR: Invalid port number in '{}': '{}'",
            var_name, port_str
        );
        eprintln!("Port must be a number between 1 and 65535");
        process::exit(1);
    })
}

fn parse_positive<T>(var_name: &str, default: &str) -> T
where
    T: FromStr + PartialOrd + Default,
{
    let raw = get_optional_env(var_name, default);
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            eprintln!("ERROR: Invalid value in '{}': '{}'", var_name, raw);
            eprintln!("Must be a positive number");
            process::exit(1);
        }
    }
}

fn parse_non_negative<T>(var_name: &str, default: &str) -> T
where
    T: FromStr,
{
    let raw = get_optional_env(var_name, default);
    raw.trim().parse::<T>().unwrap_or_else(|_| {
        eprintln!("ERROR: Invalid value in '{}': '{}'", var_name, raw);
        eprintln!("Must be a non-negative number");
        process::exit(1);
    })
}

fn validate_url(url: &str, var_name: &str) -> String {
    if url.is_empty() {
        eprintln!("ERROR: Environment variable '{}' cannot be empty", var_name);
        process::exit(1);
    }

    if !url.starts_with("http://")
        && !url.starts_with("https://")
        && !url.starts_with("postgres://")
        && !url.starts_with("postgresql://")
    {
        eprintln!("ERROR: Invalid URL format in '{}': '{}'", var_name, url);
        eprintln!("URL must start with http://, https://, postgres://, or postgresql://");
        process::exit(1);
    }

    url.trim_end_matches('/').to_string()
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        let database_url = get_required_env("DATABASE_URL");
        let database_url = validate_url(&database_url, "DATABASE_URL");

        let max_connections = parse_positive::<u32>("DB_MAX_CONNECTIONS", "10");
        let acquire_timeout_seconds = parse_positive::<u64>("DB_ACQUIRE_TIMEOUT_SECONDS", "3");

        Self {
            database_url,
            max_connections,
            acquire_timeout_seconds,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let backend = match get_optional_env("STORAGE_BACKEND", "postgres")
            .to_lowercase()
            .as_str()
        {
            "s3" => StorageBackendKind::S3,
            "postgres" => StorageBackendKind::Postgres,
            other => {
                eprintln!("ERROR: Unknown STORAGE_BACKEND '{}'", other);
                eprintln!("Supported backends: postgres, s3");
                process::exit(1);
            }
        };

        let s3_bucket = get_non_empty_env("S3_BUCKET");
        if backend == StorageBackendKind::S3 && s3_bucket.is_none() {
            eprintln!("ERROR: S3_BUCKET is required when STORAGE_BACKEND=s3");
            process::exit(1);
        }

        let s3_endpoint =
            get_non_empty_env("S3_ENDPOINT").map(|url| validate_url(&url, "S3_ENDPOINT"));

        let public_base_url = match get_non_empty_env("STORAGE_PUBLIC_BASE_URL") {
            Some(url) => validate_url(&url, "STORAGE_PUBLIC_BASE_URL"),
            None => "/files".to_string(),
        };

        Self {
            backend,
            s3_bucket,
            s3_region: get_non_empty_env("S3_REGION"),
            s3_endpoint,
            public_base_url,
            timeout_seconds: parse_positive::<u64>("STORAGE_TIMEOUT_SECONDS", "60"),
        }
    }
}

impl GoogleOAuthConfig {
    pub fn from_env() -> Self {
        let client_id = get_required_env("GOOGLE_CLIENT_ID");
        if client_id.trim().is_empty() {
            eprintln!("ERROR: GOOGLE_CLIENT_ID cannot be empty");
            process::exit(1);
        }

        let client_secret = get_required_env("GOOGLE_CLIENT_SECRET");
        if client_secret.trim().is_empty() {
            eprintln!("ERROR: GOOGLE_CLIENT_SECRET cannot be empty");
            process::exit(1);
        }

        let token_url = get_optional_env("GOOGLE_TOKEN_URL", "https://oauth2.googleapis.com/token");
        let token_url = validate_url(&token_url, "GOOGLE_TOKEN_URL");

        Self {
            client_id,
            client_secret,
            token_url,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let attachment_folder = get_optional_env("ATTACHMENT_FOLDER", "crm_attachments");
        if attachment_folder.trim().is_empty() || attachment_folder.contains("..") {
            eprintln!("ERROR: ATTACHMENT_FOLDER must be a plain folder name");
            process::exit(1);
        }

        Self {
            max_concurrent_users: parse_positive::<usize>("SYNC_MAX_CONCURRENT_USERS", "4"),
            max_messages_in_flight: parse_positive::<usize>("SYNC_MAX_MESSAGES_IN_FLIGHT", "16"),
            history_page_size: parse_positive::<u32>("SYNC_HISTORY_PAGE_SIZE", "100"),
            fallback_scan_size: parse_positive::<u32>("SYNC_FALLBACK_SCAN_SIZE", "10"),
            poll_interval_seconds: get_non_empty_env("SYNC_POLL_INTERVAL_SECONDS")
                .map(|_| parse_positive::<u64>("SYNC_POLL_INTERVAL_SECONDS", "0")),
            watch_renewal_interval_seconds: parse_positive::<u64>(
                "WATCH_RENEWAL_INTERVAL_SECONDS",
                "86400",
            ),
            attachment_folder,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_users: 4,
            max_messages_in_flight: 16,
            history_page_size: 100,
            fallback_scan_size: 10,
            poll_interval_seconds: None,
            watch_renewal_interval_seconds: 86400,
            attachment_folder: "crm_attachments".to_string(),
        }
    }
}

impl GmailConnectorConfig {
    pub fn from_env() -> Self {
        let port_str = get_required_env("PORT");
        let port = parse_port(&port_str, "PORT");

        let gmail_api_base = get_optional_env(
            "GMAIL_API_BASE",
            "https://gmail.googleapis.com/gmail/v1",
        );
        let gmail_api_base = validate_url(&gmail_api_base, "GMAIL_API_BASE");

        let pubsub_topic = get_non_empty_env("GMAIL_PUBSUB_TOPIC");
        if let Some(ref topic) = pubsub_topic {
            if !topic.starts_with("projects/") || !topic.contains("/topics/") {
                eprintln!("ERROR: GMAIL_PUBSUB_TOPIC must look like projects/<project>/topics/<topic>");
                process::exit(1);
            }
        }

        let frontend_url = get_required_env("FRONTEND_URL");
        let frontend_url = validate_url(&frontend_url, "FRONTEND_URL");

        Self {
            port,
            database: DatabaseConfig::from_env(),
            storage: StorageConfig::from_env(),
            oauth: GoogleOAuthConfig::from_env(),
            sync: SyncConfig::from_env(),
            gmail_api_base,
            pubsub_topic,
            frontend_url,
            provider_timeout_seconds: parse_positive::<u64>("PROVIDER_TIMEOUT_SECONDS", "30"),
            api_rate_limit: parse_positive::<u32>("GOOGLE_API_RATE_LIMIT", "25"),
            max_retries: parse_non_negative::<u32>("GOOGLE_MAX_RETRIES", "3"),
        }
    }
}
