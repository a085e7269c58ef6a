use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 10 << 30;
const DEFAULT_MAX_MEMORY: u64 = 32 << 20;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Output directory for finalized files.
    pub upload_dir: PathBuf,
    /// Staging directory for in-flight chunks. Wiped at startup.
    pub staging_dir: PathBuf,
    pub database_url: String,
    /// Request body ceiling and the largest declared file size, in bytes.
    pub max_upload_size: u64,
    /// Ceiling on text form fields per request, in bytes.
    pub max_memory: u64,
    pub request_timeout: Duration,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
    /// tusd upload directory; enables `POST /hooks/tus` when set.
    pub tus_dir: Option<PathBuf>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked video upload intake")]
pub struct Args {
    /// Host to bind to (overrides VIDEO_INTAKE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides VIDEO_INTAKE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory receiving finalized files (overrides VIDEO_INTAKE_UPLOAD_PATH)
    #[arg(long)]
    pub upload_dir: Option<PathBuf>,

    /// Staging directory for chunks (overrides VIDEO_INTAKE_TEMP_UPLOAD_PATH)
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,

    /// Database URL (overrides VIDEO_INTAKE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum upload size in MiB (overrides VIDEO_INTAKE_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size_mb: Option<u64>,

    /// tusd upload directory (overrides VIDEO_INTAKE_TUS_DIR)
    #[arg(long)]
    pub tus_dir: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over values looked up by `env`, then defaults.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = args
            .host
            .or_else(|| env("VIDEO_INTAKE_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_env(&env, "VIDEO_INTAKE_PORT")?.unwrap_or(8080),
        };
        let upload_dir = args
            .upload_dir
            .or_else(|| env("VIDEO_INTAKE_UPLOAD_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./uploads"));
        let staging_dir = args
            .staging_dir
            .or_else(|| env("VIDEO_INTAKE_TEMP_UPLOAD_PATH").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./temp_uploads"));
        let database_url = args
            .database_url
            .or_else(|| env("VIDEO_INTAKE_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/video_intake.db".into());

        let max_upload_size = match args.max_upload_size_mb {
            Some(mb) => mb.saturating_mul(MIB),
            None => parse_env::<u64>(&env, "VIDEO_INTAKE_MAX_UPLOAD_SIZE")?
                .map(|mb| mb.saturating_mul(MIB))
                .unwrap_or(DEFAULT_MAX_UPLOAD_SIZE),
        };
        let max_memory = parse_env::<u64>(&env, "VIDEO_INTAKE_MAX_MEMORY")?
            .map(|mb| mb.saturating_mul(MIB))
            .unwrap_or(DEFAULT_MAX_MEMORY);

        let secs = |name: &str, default: u64| -> Result<Duration> {
            Ok(Duration::from_secs(parse_env(&env, name)?.unwrap_or(default)))
        };

        let tus_dir = args
            .tus_dir
            .or_else(|| env("VIDEO_INTAKE_TUS_DIR").map(PathBuf::from));

        if staging_dir == upload_dir {
            anyhow::bail!("staging and upload directories must differ: staging is wiped at startup");
        }

        Ok(Self {
            host,
            port,
            upload_dir,
            staging_dir,
            database_url,
            max_upload_size,
            max_memory,
            request_timeout: secs("VIDEO_INTAKE_REQUEST_TIMEOUT_SECS", 600)?,
            session_ttl: secs("VIDEO_INTAKE_SESSION_TTL_SECS", 24 * 60 * 60)?,
            sweep_interval: secs("VIDEO_INTAKE_SWEEP_INTERVAL_SECS", 300)?,
            shutdown_grace: secs("VIDEO_INTAKE_SHUTDOWN_GRACE_SECS", 10)?,
            tus_dir,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_env_or_args() {
        let cfg = AppConfig::resolve(Args::default(), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.upload_dir, PathBuf::from("./uploads"));
        assert_eq!(cfg.staging_dir, PathBuf::from("./temp_uploads"));
        assert_eq!(cfg.max_upload_size, 10 << 30);
        assert_eq!(cfg.max_memory, 32 << 20);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(10));
        assert!(cfg.tus_dir.is_none());
    }

    #[test]
    fn env_sizes_are_mebibytes_and_args_win() {
        let args = Args {
            port: Some(9000),
            ..Args::default()
        };
        let env = lookup(&[
            ("VIDEO_INTAKE_PORT", "7000"),
            ("VIDEO_INTAKE_MAX_UPLOAD_SIZE", "512"),
            ("VIDEO_INTAKE_MAX_MEMORY", "8"),
            ("VIDEO_INTAKE_TUS_DIR", "/srv/tus"),
        ]);
        let cfg = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_upload_size, 512 * MIB);
        assert_eq!(cfg.max_memory, 8 * MIB);
        assert_eq!(cfg.tus_dir, Some(PathBuf::from("/srv/tus")));
    }

    #[test]
    fn malformed_numbers_fail_loudly() {
        let err = AppConfig::resolve(
            Args::default(),
            lookup(&[("VIDEO_INTAKE_MAX_UPLOAD_SIZE", "lots")]),
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("VIDEO_INTAKE_MAX_UPLOAD_SIZE"));
    }

    #[test]
    fn staging_must_not_be_the_output_dir() {
        let env = lookup(&[
            ("VIDEO_INTAKE_UPLOAD_PATH", "/data"),
            ("VIDEO_INTAKE_TEMP_UPLOAD_PATH", "/data"),
        ]);
        assert!(AppConfig::resolve(Args::default(), env).is_err());
    }
}
