//! Test utilities: a scripted separator and test app constructors.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum_test::TestServer;

use crate::config::{Config, ProbeConfig, SeparationLimitsConfig};
use crate::separator::{SeparationError, SeparationOutput, Separator};
use crate::{AppState, build_router};

/// What a [`StubSeparator`] does when called.
#[derive(Debug, Clone)]
pub enum StubOutcome {
    Succeed { stdout: String, stderr: String },
    Exit { code: i32, stderr: String },
    FailToSpawn,
}

/// Separator that records its inputs and returns a scripted outcome.
#[derive(Debug)]
pub struct StubSeparator {
    outcome: StubOutcome,
    delay: Option<Duration>,
    calls: Mutex<Vec<PathBuf>>,
}

impl StubSeparator {
    pub fn new(outcome: StubOutcome) -> Self {
        Self {
            outcome,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(StubOutcome::Succeed {
            stdout: "done\n".to_string(),
            stderr: String::new(),
        })
    }

    /// Sleep this long before returning, to keep jobs in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Input paths seen so far, in call order.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Separator for StubSeparator {
    async fn separate(&self, input: &Path) -> Result<SeparationOutput, SeparationError> {
        self.calls.lock().unwrap().push(input.to_path_buf());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match &self.outcome {
            StubOutcome::Succeed { stdout, stderr } => Ok(SeparationOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                stems_dir: None,
            }),
            StubOutcome::Exit { code, stderr } => Err(SeparationError::Exited {
                code: Some(*code),
                stderr: stderr.clone(),
            }),
            StubOutcome::FailToSpawn => Err(SeparationError::Spawn {
                program: "demucs".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
            }),
        }
    }
}

/// Config rooted in a scratch directory, with the probe off and no job limit.
pub fn create_test_config(root: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        public_dir: root.join("public"),
        uploads_dir: root.join("uploads"),
        probe: ProbeConfig {
            enabled: false,
            ..Default::default()
        },
        limits: crate::config::LimitsConfig {
            separations: SeparationLimitsConfig {
                max_concurrent_jobs: 0,
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn create_test_state(config: Config, separator: Arc<dyn Separator>) -> AppState {
    AppState::with_separator(config, separator)
        .await
        .expect("Failed to create application state")
}

pub async fn create_test_server(config: Config, separator: Arc<dyn Separator>) -> TestServer {
    let state = create_test_state(config, separator).await;
    TestServer::new(build_router(&state)).expect("Failed to create test server")
}
