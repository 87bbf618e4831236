use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};

use crate::error::Error;

/// Exit status and captured streams of one predictor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Parses standard output as a single JSON document.
    ///
    /// Surrounding whitespace is ignored. Standard error is never consulted.
    pub fn parse_prediction(&self) -> Result<Value, Error> {
        let raw = String::from_utf8_lossy(&self.stdout);
        let trimmed = raw.trim();
        serde_json::from_str(trimmed).map_err(|err| {
            tracing::debug!(error = %err, "predictor output is not JSON");
            Error::PredictorOutput {
                details: trimmed.to_string(),
            }
        })
    }
}

/// External prediction program, invoked as `<program> <args..> <image> <header>`.
#[derive(Debug, Clone)]
pub struct Predictor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Predictor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Predictor {
            program: program.into(),
            args: args.into_iter().filter(|arg| !arg.is_empty()).collect(),
            working_dir: None,
            timeout: None,
        }
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the predictor to completion on one image/header pair.
    ///
    /// Returns once the process has exited and both output streams have
    /// reached end of file.
    pub async fn run(&self, image: &Path, header: &Path) -> Result<ProcessOutcome, Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(image)
            .arg(header)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| Error::PredictorLaunch {
            program: self.program.clone(),
            source,
        })?;
        tracing::debug!(pid = ?child.id(), program = %self.program, "predictor spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes must drain while we wait, or a chatty child blocks on a
        // full buffer and never exits.
        let collect = async {
            let (stdout, stderr, status) =
                tokio::join!(drain(stdout), drain(stderr), child.wait());
            let status = status.map_err(Error::PredictorWait)?;
            Ok::<_, Error>(ProcessOutcome {
                exit_code: status.code(),
                stdout: stdout.map_err(Error::PredictorWait)?,
                stderr: stderr.map_err(Error::PredictorWait)?,
            })
        };

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, collect).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    // kill_on_drop takes the child down when we return.
                    tracing::warn!(program = %self.program, ?limit, "predictor timed out");
                    return Err(Error::PredictorTimeout(limit));
                }
            },
            None => collect.await?,
        };

        if outcome.success() {
            tracing::info!(exit_code = ?outcome.exit_code, "predictor exited");
        } else {
            tracing::warn!(exit_code = ?outcome.exit_code, "predictor exited abnormally");
        }
        if !outcome.stderr.is_empty() {
            tracing::warn!(
                stderr = %String::from_utf8_lossy(&outcome.stderr),
                "predictor wrote to stderr"
            );
        }
        tracing::debug!(
            stdout = %String::from_utf8_lossy(&outcome.stdout),
            "raw predictor output"
        );

        Ok(outcome)
    }
}

async fn drain<R: AsyncRead + Unpin>(stream: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}
