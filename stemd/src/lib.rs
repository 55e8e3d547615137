//! # stemd: upload-and-separate HTTP service
//!
//! `stemd` accepts an uploaded audio file over HTTP, runs an external source-separation tool
//! (by default `demucs`) on it, and returns the tool's standard output as JSON. It also serves
//! a directory of static files at the web root, so a plain HTML upload form can live beside it.
//!
//! ## Request Flow
//!
//! A `POST /upload` request carrying a multipart field named `file` goes through:
//!
//! 1. **Storage**: the file part is streamed to a generated path in the uploads directory
//!    ([`uploads::UploadStore`]).
//! 2. **Admission**: a slot is taken from the [`limits::SeparationLimiter`], or the request is
//!    rejected with 429 when too many separations are running or queued.
//! 3. **Separation**: the [`separator::Separator`] runs the tool on the stored file's absolute
//!    path and awaits its exit.
//! 4. **Response**: `200 {"message": "File processed successfully", "output": <stdout>}` or
//!    `500 {"error": "Error processing file"}`.
//!
//! Uploaded files and the tool's stems stay on disk; nothing here cleans them up. With
//! `separation.output_dir` set, each upload's stems go to their own subdirectory.
//!
//! ## Startup
//!
//! On start the configured interpreter is asked for its version ([`probe`]). The result is only
//! logged and never blocks the server.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use stemd::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = stemd::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     stemd::telemetry::init_telemetry()?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(stemd::shutdown_signal()).await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod config;
pub mod errors;
pub mod limits;
pub mod probe;
pub mod separator;
pub mod telemetry;
pub mod uploads;

#[cfg(test)]
pub mod test_utils;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use limits::SeparationLimiter;
use separator::{CommandSeparator, Separator};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::{
    services::ServeDir,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument, warn};
use uploads::UploadStore;

/// Application state shared across all request handlers.
///
/// # Fields
///
/// - `config`: Application configuration loaded from file/environment
/// - `uploads`: Where uploaded files are written
/// - `separator`: Runs the separation tool on a stored upload
/// - `limiter`: Admission gate for separation jobs; `None` means unlimited
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub uploads: UploadStore,
    pub separator: Arc<dyn Separator>,
    pub limiter: Option<Arc<SeparationLimiter>>,
}

impl AppState {
    /// Build state for the configured external tool.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let separator = Arc::new(CommandSeparator::new(&config.separation));
        Self::with_separator(config, separator).await
    }

    /// Build state around a given separator.
    pub async fn with_separator(config: Config, separator: Arc<dyn Separator>) -> anyhow::Result<Self> {
        let uploads = UploadStore::open(&config.uploads_dir, config.limits.uploads.max_file_size)
            .await
            .with_context(|| format!("Failed to prepare uploads directory {}", config.uploads_dir.display()))?;
        let limiter = SeparationLimiter::new(&config.limits.separations).map(Arc::new);

        Ok(AppState::builder()
            .config(config)
            .uploads(uploads)
            .separator(separator)
            .maybe_limiter(limiter)
            .build())
    }
}

/// Build the application router.
///
/// - `GET /healthz`: liveness check
/// - `POST /upload`: store a file and run the separation tool on it
/// - `GET /internal/metrics`: Prometheus metrics, when enabled
/// - everything else: files from the public directory, 404 when absent
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> Router {
    let public_dir = &state.config.public_dir;
    if !public_dir.is_dir() {
        warn!("Public directory {} does not exist, static requests will 404", public_dir.display());
    }

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        // Size is enforced while streaming the file part instead
        .route(
            "/upload",
            post(api::handlers::upload::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .with_state(state.clone())
        .fallback_service(ServeDir::new(public_dir));

    let router = if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer)
    } else {
        router
    };

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Main application struct.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] prepares the uploads directory, builds the router and
///    starts the interpreter version probe in the background
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and handles requests until the
///    shutdown future resolves
pub struct Application {
    router: Router,
    config: Config,
    _probe: Option<JoinHandle<()>>,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting stemd with configuration: {:#?}", config);

        // Diagnostic only; never gates startup
        let probe = probe::spawn_version_probe(&config.probe);

        let state = AppState::from_config(config.clone()).await?;
        let router = build_router(&state);

        Ok(Self {
            router,
            config,
            _probe: probe,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Server listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Server stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C, or on SIGTERM on unix.
///
/// A signal that cannot be listened for is logged and never fires; the other one still does.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = ctrl_c => "Ctrl+C",
        _ = terminate => "SIGTERM",
    };
    info!("Received {}, finishing in-flight separations before shutdown", signal);
}
