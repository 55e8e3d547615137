//! Startup interpreter version probe.
//!
//! The separation tool runs on an interpreter installed on the host. At startup we ask that
//! interpreter for its version and log the answer. The probe is diagnostic only: it runs in the
//! background and never prevents the server from starting.

use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::ProbeConfig;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exited {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Run `program args...` and return the version text it reports.
///
/// Some interpreters print their version on stderr, so stderr is used when stdout is empty.
pub async fn interpreter_version(program: &str, args: &[String]) -> Result<String, ProbeError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProbeError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        return Err(ProbeError::Exited {
            program: program.to_string(),
            status: output.status,
            stderr: stderr.trim().to_string(),
        });
    }

    let version = if stdout.trim().is_empty() { stderr } else { stdout };
    Ok(version.trim().to_string())
}

/// Fire-and-forget probe; logs the interpreter version or the failure.
///
/// Returns `None` when the probe is disabled.
pub fn spawn_version_probe(config: &ProbeConfig) -> Option<JoinHandle<()>> {
    if !config.enabled {
        return None;
    }

    let program = config.program.clone();
    let args = config.args.clone();
    Some(tokio::spawn(async move {
        match interpreter_version(&program, &args).await {
            Ok(version) => info!(program = %program, "Interpreter version: {}", version),
            Err(e) => error!("Interpreter version probe failed: {}", e),
        }
    }))
}
