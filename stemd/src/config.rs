//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `STEMD_CONFIG`
//! environment variable. A missing file is not an error: every value has a default, so the service
//! starts with no configuration at all.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `STEMD_` override YAML values
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `STEMD_SEPARATION__MODEL=htdemucs` sets the `separation.model` field.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use stemd::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration Structure
//!
//! - **Server**: `host`, `port` - HTTP server binding configuration
//! - **Filesystem**: `public_dir`, `uploads_dir` - static assets and upload destination
//! - **Separation**: `separation.program`, `separation.model`, `separation.output_dir`, `separation.timeout`
//! - **Probe**: `probe.enabled`, `probe.program`, `probe.args` - startup interpreter version check
//! - **Limits**: `limits.separations.*`, `limits.uploads.*` - admission control and upload size
//! - **Features**: `enable_metrics` - Prometheus endpoint toggle
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Override server port
//! STEMD_PORT=8080
//!
//! # Use a different separation model
//! STEMD_SEPARATION__MODEL=htdemucs
//!
//! # Allow four separations to run at once
//! STEMD_LIMITS__SEPARATIONS__MAX_CONCURRENT_JOBS=4
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::errors::Error;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "STEMD_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// This is the root configuration structure loaded from YAML and environment variables.
/// All fields have defaults defined in the `Default` implementation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Directory whose files are served at the web root
    pub public_dir: PathBuf,
    /// Directory uploaded files are written to. Created on startup if missing.
    pub uploads_dir: PathBuf,
    /// Enable Prometheus metrics endpoint at `/internal/metrics`
    pub enable_metrics: bool,
    /// External separation tool invocation
    pub separation: SeparationConfig,
    /// Startup interpreter version probe
    pub probe: ProbeConfig,
    /// Resource limits for protecting system capacity
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_dir: PathBuf::from("public"),
            uploads_dir: PathBuf::from("uploads"),
            enable_metrics: false,
            separation: SeparationConfig::default(),
            probe: ProbeConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// How the external separation tool is invoked.
///
/// The tool is run as `<program> -n <model> [-o <output_dir>/<upload stem>] <upload path>`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeparationConfig {
    /// Separation executable, resolved through `PATH` if not absolute
    pub program: String,
    /// Model name passed with `-n`
    pub model: String,
    /// Root for stems. Each upload gets `<output_dir>/<stored file stem>`, created before the
    /// tool runs. When unset the tool picks its own default location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Kill the tool and fail the request after this long. Unset means wait indefinitely.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            program: "demucs".to_string(),
            model: "mdx_extra_q".to_string(),
            output_dir: None,
            timeout: None,
        }
    }
}

/// Startup version probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
    /// Run the probe at startup
    pub enabled: bool,
    /// Interpreter binary to query
    pub program: String,
    /// Arguments that make the interpreter print its version
    pub args: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "python3".to_string(),
            args: vec!["--version".to_string()],
        }
    }
}

/// Resource limits configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Separation job concurrency
    pub separations: SeparationLimitsConfig,
    /// Upload size
    pub uploads: UploadLimitsConfig,
}

/// Separation job admission control.
///
/// Every upload request runs one external process. These settings bound how many run at once
/// and how many may queue for a slot; requests beyond that receive HTTP 429.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SeparationLimitsConfig {
    /// Maximum number of separation jobs running at once.
    /// Set to 0 for unlimited (one process per request, no matter how many).
    /// Default: 2
    pub max_concurrent_jobs: usize,
    /// Maximum number of jobs that can wait in queue for a slot.
    /// When this limit is reached, new uploads receive HTTP 429 immediately.
    /// Set to 0 for unlimited waiting queue.
    /// Default: 16
    pub max_waiting_jobs: usize,
    /// Maximum time in seconds to wait for a slot before returning HTTP 429.
    /// Set to 0 to reject immediately when no slot is available.
    /// Default: 600
    pub max_job_wait_secs: u64,
}

impl Default for SeparationLimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 2,
            max_waiting_jobs: 16,
            max_job_wait_secs: 600,
        }
    }
}

/// Upload limits configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadLimitsConfig {
    /// Maximum uploaded file size in bytes.
    /// Set to 0 for unlimited.
    /// Default: 0 (unlimited)
    pub max_file_size: u64,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.separation.program.trim().is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: separation.program cannot be empty".to_string(),
            });
        }

        if self.separation.model.trim().is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: separation.model cannot be empty".to_string(),
            });
        }

        if let Some(timeout) = self.separation.timeout
            && timeout.is_zero()
        {
            return Err(Error::Internal {
                operation: "Config validation: separation.timeout must be positive. Remove it to wait indefinitely.".to_string(),
            });
        }

        if self.probe.enabled && self.probe.program.trim().is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: probe.program cannot be empty while the probe is enabled".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("STEMD_").split("__"))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
