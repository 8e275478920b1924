//! Command Line Interface (CLI) arguments.

use clap::Parser;
use std::path::PathBuf;
use url::Url;

/// Per-dataset time-to-live override, given as `NAME=SECONDS`.
#[derive(Clone, Debug, PartialEq)]
pub struct DatasetTtl {
    pub dataset: String,
    pub seconds: u64,
}

impl std::str::FromStr for DatasetTtl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (dataset, seconds) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=SECONDS, got {s:?}"))?;
        if !crate::models::is_valid_dataset_name(dataset) {
            return Err(format!("invalid dataset name {dataset:?}"));
        }
        let seconds = seconds
            .parse()
            .map_err(|err| format!("invalid TTL {seconds:?}: {err}"))?;
        Ok(Self {
            dataset: dataset.to_string(),
            seconds,
        })
    }
}

/// acoustic-views command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "ACOUSTIC_VIEWS_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "ACOUSTIC_VIEWS_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "ACOUSTIC_VIEWS_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/acoustic-views/certs/cert.pem",
        env = "ACOUSTIC_VIEWS_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/acoustic-views/certs/key.pem",
        env = "ACOUSTIC_VIEWS_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "ACOUSTIC_VIEWS_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Base URL of the remote content origin. Datasets are read from --data-dir when unset.
    #[arg(long, env = "ACOUSTIC_VIEWS_ORIGIN_URL")]
    pub origin_url: Option<Url>,
    /// Directory holding `<dataset>.json` documents in local-only mode
    #[arg(long, default_value = "./data/views", env = "ACOUSTIC_VIEWS_DATA_DIR")]
    pub data_dir: PathBuf,
    /// Directory holding pre-materialised page artifacts
    #[arg(long, default_value = "./data/paginated", env = "ACOUSTIC_VIEWS_PAGES_DIR")]
    pub pages_dir: PathBuf,
    /// Time-to-live in seconds of large reference datasets (distributions, correlations)
    #[arg(long, default_value_t = 3600, env = "ACOUSTIC_VIEWS_REFERENCE_TTL")]
    pub reference_ttl: u64,
    /// Time-to-live in seconds of all other datasets
    #[arg(long, default_value_t = 300, env = "ACOUSTIC_VIEWS_STANDARD_TTL")]
    pub standard_ttl: u64,
    /// Per-dataset time-to-live override, NAME=SECONDS. May be repeated.
    #[arg(long = "dataset-ttl", value_name = "NAME=SECONDS")]
    pub dataset_ttls: Vec<DatasetTtl>,
    /// max-age in seconds advertised for full dataset views
    #[arg(long, default_value_t = 300, env = "ACOUSTIC_VIEWS_VIEWS_MAX_AGE")]
    pub views_max_age: u64,
    /// Maximum number of concurrent connections to the origin
    #[arg(long, env = "ACOUSTIC_VIEWS_CONNECTION_LIMIT_ORIGIN")]
    pub connection_limit_origin: Option<usize>,
    /// Memory available for cached dataset documents, e.g. 2GiB. Unlimited when unset.
    #[arg(long, env = "ACOUSTIC_VIEWS_MEMORY_LIMIT", value_parser = parse_memory_limit)]
    pub memory_limit: Option<usize>,
    /// Maximum number of concurrent filtering tasks. Defaults to the number of CPUs minus one.
    #[arg(long, env = "ACOUSTIC_VIEWS_THREAD_LIMIT")]
    pub thread_limit: Option<usize>,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "ACOUSTIC_VIEWS_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for execution of CPU-bound tasks.
    #[arg(long, default_value_t = false, env = "ACOUSTIC_VIEWS_USE_RAYON")]
    pub use_rayon: bool,
}

/// Parse a memory size such as `512MB` or `2GiB` into bytes.
fn parse_memory_limit(s: &str) -> Result<usize, String> {
    let bytes = byte_unit::Byte::parse_str(s, /* ignore case */ true)
        .map_err(|err| format!("invalid memory limit {s:?}: {err}"))?
        .as_u64();
    usize::try_from(bytes).map_err(|_| format!("memory limit {s:?} does not fit in usize"))
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
