use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::Parser;

/// Command line and environment configuration for the prediction gateway.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "HTTP front end for the moisture prediction model")]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Maximum accepted request body, in megabytes
    #[arg(long, env = "BODY_LIMIT_MB", default_value_t = 512)]
    pub body_limit_mb: usize,

    /// Directory the uploads are written to. Must already exist.
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: PathBuf,

    #[arg(long, env = "PREDICTOR_PROGRAM", default_value = "python3")]
    pub predictor_program: String,

    /// Arguments placed before the image and header paths
    #[arg(
        long,
        env = "PREDICTOR_ARGS",
        value_delimiter = ' ',
        num_args = 0..,
        allow_hyphen_values = true,
        default_value = "predict.py"
    )]
    pub predictor_args: Vec<String>,

    #[arg(long, env = "PREDICTOR_DIR")]
    pub predictor_dir: Option<PathBuf>,

    /// Kill the predictor after this many seconds. Unbounded when unset.
    #[arg(long, env = "PREDICTOR_TIMEOUT_SECS")]
    pub predictor_timeout_secs: Option<u64>,

    /// Delete both stored files once the predictor has exited
    #[arg(long, env = "REMOVE_UPLOADS", default_value_t = false)]
    pub remove_uploads: bool,

    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    #[arg(long, env = "TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

impl Config {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn body_limit_bytes(&self) -> usize {
        self.body_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn predictor_timeout(&self) -> Option<Duration> {
        self.predictor_timeout_secs.map(Duration::from_secs)
    }

    /// The certificate and key pair, when both are configured.
    pub fn tls_pair(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.tls_cert.as_ref().zip(self.tls_key.as_ref())
    }
}

/// Logs problems with the runtime environment without refusing to start.
///
/// A missing upload directory is reported here and again on every request
/// that tries to write to it.
pub fn check_environment(config: &Config, upload_dir: &std::path::Path) {
    tracing::info!("Checking environment...");

    if !upload_dir.is_dir() {
        tracing::error!(
            upload_dir = %upload_dir.display(),
            "upload directory does not exist; uploads will fail until it is created"
        );
    }

    if config.predictor_timeout_secs.is_none() {
        tracing::warn!(
            "no predictor timeout configured; a hung predictor holds its request open indefinitely"
        );
    }

    if let Some(dir) = &config.predictor_dir {
        if !dir.is_dir() {
            tracing::error!(
                predictor_dir = %dir.display(),
                "predictor working directory does not exist"
            );
        }
    }
}
