use anyhow::{anyhow, Result};
use clap::Parser;
use std::env;
use std::time::Duration;

use crate::connection::{ConnectionSettings, Scope};
use crate::render::Severity;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backend {
    Http,
    Memory,
}

impl std::str::FromStr for Backend {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http" | "https" => Ok(Backend::Http),
            "memory" | "mem" => Ok(Backend::Memory),
            _ => Err(anyhow!("Invalid backend '{s}'. Valid options: http, memory")),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Http => write!(f, "http"),
            Backend::Memory => write!(f, "memory"),
        }
    }
}

/// blockform - record/block forms runtime
///
/// Runs a form definition against a backend from the console.
/// Configuration priority: CLI args > Environment variables > Defaults
#[derive(Parser, Debug)]
#[command(name = "blockform")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Record/block forms runtime", long_about = None)]
pub struct CliArgs {
    /// Backend: http (remote JSON endpoint) or memory (in-process tables)
    #[arg(short, long, env = "BACKEND", value_parser = clap::value_parser!(Backend))]
    pub backend: Option<Backend>,

    /// Base URL of the backend endpoint; verbs are posted to <url>/<verb>
    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Form definition file (TOML)
    #[arg(short, long, env = "FORM_FILE")]
    pub form_file: Option<String>,

    /// Connection scope: stateless, dedicated or transactional
    #[arg(long, env = "SCOPE", value_parser = clap::value_parser!(Scope))]
    pub scope: Option<Scope>,

    /// Backend user name
    #[arg(long, env = "BACKEND_USER")]
    pub username: Option<String>,

    /// Backend password
    #[arg(long, env = "BACKEND_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Keepalive ping interval in milliseconds (0 disables, else 1000-600000)
    #[arg(long, env = "KEEPALIVE_MS")]
    pub keepalive_ms: Option<u64>,

    /// Idle time before an open transaction is rolled back (10000-86400000)
    #[arg(long, env = "TRANSACTION_TIMEOUT_MS")]
    pub transaction_timeout_ms: Option<u64>,

    /// Idle time before an unused transactional session is released (10000-86400000)
    #[arg(long, env = "CONNECTION_TIMEOUT_MS")]
    pub connection_timeout_ms: Option<u64>,

    /// Lock count at which the transaction is forced to end (1-100000)
    #[arg(long, env = "MAX_LOCKS")]
    pub max_locks: Option<usize>,

    /// Failed pings tolerated before the session counts as lost (0-100)
    #[arg(long, env = "KEEPALIVE_FAILURES")]
    pub keepalive_failures: Option<u32>,

    /// Backend request timeout in milliseconds (1000-120000)
    #[arg(long, env = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Retry attempts for failed backend requests (0-10)
    #[arg(long, env = "REQUEST_RETRIES")]
    pub request_retries: Option<u32>,

    /// Event queue watchdog period in milliseconds (10-10000)
    #[arg(long, env = "QUEUE_WATCHDOG_MS")]
    pub queue_watchdog_ms: Option<u64>,

    /// Severity used for backend failures: info, warning or severe
    #[arg(long, env = "BACKEND_ERROR_SEVERITY", value_parser = clap::value_parser!(Severity))]
    pub backend_error_severity: Option<Severity>,

    /// Log level filter (error, warn, info, debug, trace)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub backend_url: String,
    pub form_file: Option<String>,
    pub scope: Scope,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_ms: u64,
    pub transaction_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub max_locks: usize,
    pub keepalive_failures: u32,
    pub request_timeout_ms: u64,
    pub request_retries: u32,
    pub queue_watchdog_ms: u64,
    pub backend_error_severity: Severity,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            backend_url: "http://127.0.0.1:8080/".to_string(),
            form_file: None,
            scope: Scope::Transactional,
            username: None,
            password: None,
            keepalive_ms: 20_000,
            transaction_timeout_ms: 240_000,
            connection_timeout_ms: 600_000,
            max_locks: 64,
            keepalive_failures: 3,
            request_timeout_ms: 10_000,
            request_retries: 2,
            queue_watchdog_ms: 100,
            backend_error_severity: Severity::Severe,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            scope: self.scope,
            keepalive: Duration::from_millis(self.keepalive_ms),
            transaction_timeout: Duration::from_millis(self.transaction_timeout_ms),
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            max_locks: self.max_locks,
            keepalive_failures: self.keepalive_failures,
        }
    }

    pub fn queue_watchdog(&self) -> Duration {
        Duration::from_millis(self.queue_watchdog_ms)
    }
}

/// Validate that a value is within a given range (inclusive)
fn validate_in_range<T>(val: T, min: T, max: T, name: &str) -> Result<T>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if val < min || val > max {
        Err(anyhow!("{name} must be in range [{min}, {max}], got {val}"))
    } else {
        Ok(val)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Load configuration from CLI args and environment variables
/// Priority: CLI args > Environment variables > Defaults
pub fn load() -> Result<Config> {
    from_args(CliArgs::parse())
}

pub fn from_args(args: CliArgs) -> Result<Config> {
    let defaults = Config::default();

    let backend = args
        .backend
        .or_else(|| env_parse("BACKEND"))
        .unwrap_or(defaults.backend);

    let backend_url = args
        .backend_url
        .or_else(|| env::var("BACKEND_URL").ok())
        .unwrap_or(defaults.backend_url);
    if backend == Backend::Http {
        validate_url(&backend_url, "BACKEND_URL")?;
    }

    let scope = args.scope.or_else(|| env_parse("SCOPE")).unwrap_or(defaults.scope);

    let keepalive_ms = args
        .keepalive_ms
        .or_else(|| env_parse("KEEPALIVE_MS"))
        .unwrap_or(defaults.keepalive_ms);
    if keepalive_ms != 0 {
        validate_in_range(keepalive_ms, 1000, 600_000, "KEEPALIVE_MS")?;
    }

    let transaction_timeout_ms = args
        .transaction_timeout_ms
        .or_else(|| env_parse("TRANSACTION_TIMEOUT_MS"))
        .unwrap_or(defaults.transaction_timeout_ms);
    let transaction_timeout_ms = validate_in_range(
        transaction_timeout_ms,
        10_000,
        86_400_000,
        "TRANSACTION_TIMEOUT_MS",
    )?;

    let connection_timeout_ms = args
        .connection_timeout_ms
        .or_else(|| env_parse("CONNECTION_TIMEOUT_MS"))
        .unwrap_or(defaults.connection_timeout_ms);
    let connection_timeout_ms = validate_in_range(
        connection_timeout_ms,
        10_000,
        86_400_000,
        "CONNECTION_TIMEOUT_MS",
    )?;

    if keepalive_ms != 0 && keepalive_ms >= transaction_timeout_ms {
        return Err(anyhow!(
            "KEEPALIVE_MS ({keepalive_ms}) must be shorter than TRANSACTION_TIMEOUT_MS ({transaction_timeout_ms})"
        ));
    }

    let max_locks = args
        .max_locks
        .or_else(|| env_parse("MAX_LOCKS"))
        .unwrap_or(defaults.max_locks);
    let max_locks = validate_in_range(max_locks, 1, 100_000, "MAX_LOCKS")?;

    let keepalive_failures = args
        .keepalive_failures
        .or_else(|| env_parse("KEEPALIVE_FAILURES"))
        .unwrap_or(defaults.keepalive_failures);
    let keepalive_failures = validate_in_range(keepalive_failures, 0, 100, "KEEPALIVE_FAILURES")?;

    let request_timeout_ms = args
        .request_timeout_ms
        .or_else(|| env_parse("REQUEST_TIMEOUT_MS"))
        .unwrap_or(defaults.request_timeout_ms);
    let request_timeout_ms =
        validate_in_range(request_timeout_ms, 1000, 120_000, "REQUEST_TIMEOUT_MS")?;

    let request_retries = args
        .request_retries
        .or_else(|| env_parse("REQUEST_RETRIES"))
        .unwrap_or(defaults.request_retries);
    let request_retries = validate_in_range(request_retries, 0, 10, "REQUEST_RETRIES")?;

    let queue_watchdog_ms = args
        .queue_watchdog_ms
        .or_else(|| env_parse("QUEUE_WATCHDOG_MS"))
        .unwrap_or(defaults.queue_watchdog_ms);
    let queue_watchdog_ms = validate_in_range(queue_watchdog_ms, 10, 10_000, "QUEUE_WATCHDOG_MS")?;

    let backend_error_severity = args
        .backend_error_severity
        .or_else(|| env_parse("BACKEND_ERROR_SEVERITY"))
        .unwrap_or(defaults.backend_error_severity);

    let log_level = args
        .log_level
        .or_else(|| env::var("LOG_LEVEL").ok())
        .unwrap_or(defaults.log_level)
        .to_lowercase();
    if !matches!(
        log_level.as_str(),
        "off" | "error" | "warn" | "info" | "debug" | "trace"
    ) {
        return Err(anyhow!(
            "LOG_LEVEL must be one of off, error, warn, info, debug, trace; got {log_level}"
        ));
    }

    Ok(Config {
        backend,
        backend_url,
        form_file: args.form_file.or_else(|| env::var("FORM_FILE").ok()),
        scope,
        username: args.username.or_else(|| env::var("BACKEND_USER").ok()),
        password: args.password.or_else(|| env::var("BACKEND_PASSWORD").ok()),
        keepalive_ms,
        transaction_timeout_ms,
        connection_timeout_ms,
        max_locks,
        keepalive_failures,
        request_timeout_ms,
        request_retries,
        queue_watchdog_ms,
        backend_error_severity,
        log_level,
    })
}

/// Validate URL format (basic check)
fn validate_url(url: &str, name: &str) -> Result<()> {
    if url.is_empty() {
        return Err(anyhow!("{name} cannot be empty"));
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow!("{name} must start with http:// or https://"))
    }
}

/// Print current configuration (useful for debugging)
impl Config {
    pub fn print_summary(&self) {
        eprintln!("blockform configuration:");
        eprintln!("  Backend: {}", self.backend);
        if self.backend == Backend::Http {
            eprintln!("  Backend URL: {}", self.backend_url);
            eprintln!("  Request Timeout: {}ms", self.request_timeout_ms);
            eprintln!("  Request Retries: {}", self.request_retries);
        }
        if let Some(file) = &self.form_file {
            eprintln!("  Form File: {file}");
        }
        eprintln!("  Scope: {}", self.scope);
        if self.keepalive_ms == 0 {
            eprintln!("  Keepalive: disabled");
        } else {
            eprintln!("  Keepalive: {}ms", self.keepalive_ms);
        }
        eprintln!("  Transaction Timeout: {}ms", self.transaction_timeout_ms);
        eprintln!("  Connection Timeout: {}ms", self.connection_timeout_ms);
        eprintln!("  Max Locks: {}", self.max_locks);
        eprintln!("  Keepalive Failures: {}", self.keepalive_failures);
        eprintln!("  Backend Error Severity: {:?}", self.backend_error_severity);
        if self.username.is_some() {
            eprintln!("  Credentials: Configured");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["blockform"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn range_check() {
        assert_eq!(validate_in_range(5, 1, 10, "X").unwrap(), 5);
        let err = validate_in_range(0, 1, 10, "MAX_LOCKS").unwrap_err();
        assert!(err.to_string().contains("MAX_LOCKS"));
    }

    #[test]
    fn url_check() {
        assert!(validate_url("https://db.example.com/api", "BACKEND_URL").is_ok());
        assert!(validate_url("", "BACKEND_URL").is_err());
        assert!(validate_url("ftp://x", "BACKEND_URL").is_err());
    }

    #[test]
    fn cli_overrides_and_validation() {
        let cfg = from_args(args(&[
            "--backend",
            "memory",
            "--scope",
            "dedicated",
            "--max-locks",
            "8",
            "--keepalive-ms",
            "0",
        ]))
        .unwrap();
        assert_eq!(cfg.backend, Backend::Memory);
        assert_eq!(cfg.scope, Scope::Dedicated);
        assert_eq!(cfg.max_locks, 8);
        let settings = cfg.connection_settings();
        assert!(settings.keepalive.is_zero());

        assert!(from_args(args(&["--backend", "memory", "--max-locks", "0"])).is_err());
        assert!(from_args(args(&[
            "--backend",
            "memory",
            "--keepalive-ms",
            "60000",
            "--transaction-timeout-ms",
            "30000"
        ]))
        .is_err());
    }

    #[test]
    fn backend_parsing() {
        assert_eq!("HTTP".parse::<Backend>().unwrap(), Backend::Http);
        assert!("sqlite".parse::<Backend>().is_err());
    }
}
