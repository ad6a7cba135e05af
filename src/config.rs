use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use std::{collections::HashSet, env, str::FromStr, time::Duration};

/// Keeps `now + ttl` far inside the millisecond timestamp range (about 100 years).
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

const DEFAULT_ID_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: String,
    pub cache_dir: String,
    pub database_url: String,
    pub id_alphabet: String,
    pub id_length: usize,
    pub ttl_secs: u64,
    pub max_upload_size: u64,
    pub max_convertible_size: u64,
    pub sweep_interval_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral file store")]
pub struct Args {
    /// Host to bind to (overrides DROPSTORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DROPSTORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding uploaded blobs (overrides DROPSTORE_UPLOAD_DIR)
    #[arg(long)]
    pub upload_dir: Option<String>,

    /// Directory holding converted renditions (overrides DROPSTORE_CACHE_DIR)
    #[arg(long)]
    pub cache_dir: Option<String>,

    /// Database URL (overrides DROPSTORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Characters identifiers are drawn from (overrides DROPSTORE_ID_ALPHABET)
    #[arg(long)]
    pub id_alphabet: Option<String>,

    /// Identifier length (overrides DROPSTORE_ID_LENGTH)
    #[arg(long)]
    pub id_length: Option<usize>,

    /// Seconds an upload lives before it is swept (overrides DROPSTORE_TTL_SECS)
    #[arg(long)]
    pub ttl_secs: Option<u64>,

    /// Largest accepted upload in bytes (overrides DROPSTORE_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Largest convertible source in bytes (overrides DROPSTORE_MAX_CONVERTIBLE_SIZE)
    #[arg(long)]
    pub max_convertible_size: Option<u64>,

    /// Seconds between expiry sweeps (overrides DROPSTORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |name| env::var(name))?;
        Ok((cfg, migrate))
    }

    /// CLI values win over environment values, which win over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };
        let number = |name: &str, default: u64| -> Result<u64> {
            parse_var(name, lookup(name), default)
        };

        let cfg = Self {
            host: args.host.map_or_else(|| text("DROPSTORE_HOST", "0.0.0.0"), Ok)?,
            port: match args.port {
                Some(port) => port,
                None => parse_var("DROPSTORE_PORT", lookup("DROPSTORE_PORT"), 3000)?,
            },
            upload_dir: args
                .upload_dir
                .map_or_else(|| text("DROPSTORE_UPLOAD_DIR", "./data/uploads"), Ok)?,
            cache_dir: args
                .cache_dir
                .map_or_else(|| text("DROPSTORE_CACHE_DIR", "./data/cache"), Ok)?,
            database_url: args.database_url.map_or_else(
                || text("DROPSTORE_DATABASE_URL", "sqlite://./data/meta/dropstore.db"),
                Ok,
            )?,
            id_alphabet: args
                .id_alphabet
                .map_or_else(|| text("DROPSTORE_ID_ALPHABET", DEFAULT_ID_ALPHABET), Ok)?,
            id_length: match args.id_length {
                Some(length) => length,
                None => parse_var("DROPSTORE_ID_LENGTH", lookup("DROPSTORE_ID_LENGTH"), 6)?,
            },
            ttl_secs: args
                .ttl_secs
                .map_or_else(|| number("DROPSTORE_TTL_SECS", 3600), Ok)?,
            max_upload_size: args
                .max_upload_size
                .map_or_else(|| number("DROPSTORE_MAX_UPLOAD_SIZE", 1_073_741_824), Ok)?,
            max_convertible_size: args
                .max_convertible_size
                .map_or_else(|| number("DROPSTORE_MAX_CONVERTIBLE_SIZE", 31_457_280), Ok)?,
            sweep_interval_secs: args
                .sweep_interval_secs
                .map_or_else(|| number("DROPSTORE_SWEEP_INTERVAL_SECS", 60), Ok)?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the storage engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.id_alphabet.is_empty(), "id alphabet must not be empty");
        let mut seen = HashSet::new();
        for c in self.id_alphabet.chars() {
            if !(c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                bail!("id alphabet may only contain ASCII letters, digits, '-' and '_' (found {:?})", c);
            }
            ensure!(seen.insert(c), "id alphabet contains {:?} more than once", c);
        }
        ensure!(self.id_length >= 1, "id length must be at least 1");
        ensure!(self.ttl_secs >= 1, "ttl must be at least 1 second");
        ensure!(
            self.ttl_secs <= MAX_TTL_SECS,
            "ttl must be at most {} seconds",
            MAX_TTL_SECS
        );
        ensure!(self.max_upload_size >= 1, "max upload size must be at least 1 byte");
        ensure!(
            self.max_convertible_size >= 1,
            "max convertible size must be at least 1 byte"
        );
        ensure!(
            self.sweep_interval_secs >= 1,
            "sweep interval must be at least 1 second"
        );
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_var<T>(name: &str, raw: Result<String, env::VarError>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
