//! External source-separation tool invocation.
//!
//! This module defines the [`Separator`] trait to abstract running the separation tool on an
//! uploaded file, enabling handler tests without a real tool installed. The production
//! implementation, [`CommandSeparator`], spawns the configured executable as a child process and
//! awaits its exit without blocking the runtime.
//!
//! The tool is invoked as:
//!
//! ```text
//! <program> -n <model> [-o <output_dir>/<upload stem>] <absolute path to upload>
//! ```
//!
//! Without an output directory the tool writes its stems to its own default location. With one,
//! every upload gets its own subdirectory named after the stored file, so stems of different
//! uploads never land in the same place. Only stdout/stderr are captured here.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::config::SeparationConfig;

/// Captured output of a successful separation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeparationOutput {
    /// Everything the tool wrote to stdout
    pub stdout: String,
    /// Everything the tool wrote to stderr (progress bars, warnings)
    pub stderr: String,
    /// Directory the stems were written to, when one was assigned
    pub stems_dir: Option<PathBuf>,
}

/// Ways a separation run can fail.
#[derive(Debug, Error)]
pub enum SeparationError {
    /// The process could not be started, e.g. the program is not installed
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process ran and reported failure
    #[error("separation tool exited with {}: {stderr}", exit_description(.code))]
    Exited { code: Option<i32>, stderr: String },

    /// The process did not finish within the configured timeout and was killed
    #[error("separation tool did not finish within {0:?}")]
    TimedOut(Duration),

    /// The per-upload stems directory could not be created
    #[error("failed to create stems directory {}: {source}", .path.display())]
    StemsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Runs the separation tool on one input file.
///
/// Implementations must produce exactly one outcome per call: the captured output on success,
/// or an error. Concurrent calls are independent.
#[async_trait]
pub trait Separator: Send + Sync {
    /// Separate the audio file at `input`, which is an absolute path.
    async fn separate(&self, input: &Path) -> Result<SeparationOutput, SeparationError>;
}

/// Production separator running an external executable.
#[derive(Debug, Clone)]
pub struct CommandSeparator {
    program: String,
    model: String,
    output_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandSeparator {
    pub fn new(config: &SeparationConfig) -> Self {
        Self {
            program: config.program.clone(),
            model: config.model.clone(),
            output_dir: config.output_dir.clone(),
            timeout: config.timeout,
        }
    }

    /// Where the stems of `input` go: `<output_dir>/<file stem of input>`.
    ///
    /// `None` when no output directory is configured.
    pub fn stems_dir(&self, input: &Path) -> Option<PathBuf> {
        let output_dir = self.output_dir.as_ref()?;
        let stem = input.file_stem().unwrap_or(input.as_os_str());
        Some(output_dir.join(stem))
    }

    /// Arguments passed to the program for a given input file.
    pub fn args(&self, input: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-n".into(), self.model.clone().into()];
        if let Some(stems_dir) = self.stems_dir(input) {
            args.push("-o".into());
            args.push(stems_dir.into_os_string());
        }
        args.push(input.as_os_str().to_owned());
        args
    }

    fn command(&self, args: Vec<OsString>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the output future (timeout, client gone) must not leave the tool running
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Separator for CommandSeparator {
    #[instrument(skip(self), fields(program = %self.program, model = %self.model))]
    async fn separate(&self, input: &Path) -> Result<SeparationOutput, SeparationError> {
        let stems_dir = self.stems_dir(input);
        if let Some(dir) = &stems_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SeparationError::StemsDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        let args = self.args(input);
        debug!(?args, "Spawning separation tool");

        let mut cmd = self.command(args);
        let output = cmd.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, output)
                .await
                .map_err(|_| SeparationError::TimedOut(limit))?,
            None => output.await,
        }
        .map_err(|source| SeparationError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(SeparationError::Exited {
                code: output.status.code(),
                stderr,
            });
        }

        Ok(SeparationOutput {
            stdout,
            stderr,
            stems_dir,
        })
    }
}
