//! Running host binaries (`qemu-img`, `virsh`)
//!
//! Every external call goes through [Tool::run], which captures the output,
//! turns a non-zero exit status into an error carrying stderr and bounds the
//! call with a deadline so a wedged tool cannot hang a provisioning attempt.
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, error, trace};

/// Deadline applied when none is configured
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn {0}, reason: {1}")]
    Spawn(String, std::io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{0} did not complete within {1:?}")]
    Timeout(String, Duration),
}

/// A host binary invoked with a bounded deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    program: PathBuf,
    base_args: Vec<String>,
    timeout: Duration,
}

impl Tool {
    pub fn new(program: PathBuf) -> Tool {
        Tool {
            program,
            base_args: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Arguments prepended to every invocation, e.g. a connection URI
    pub fn with_base_args(mut self, base_args: Vec<String>) -> Tool {
        self.base_args = base_args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Tool {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn concat_args(&self, args: &[String]) -> Vec<String> {
        let mut combined = self.base_args.clone();
        combined.extend(args.iter().cloned());
        combined
    }

    /// Run the binary to completion and return its stdout
    pub async fn run(&self, args: &[String]) -> Result<String, CommandError> {
        self.execute(args, None).await
    }

    /// Same as [Tool::run] with `input` fed on stdin
    pub async fn run_with_input(&self, args: &[String], input: &[u8]) -> Result<String, CommandError> {
        self.execute(args, Some(input)).await
    }

    async fn execute(&self, args: &[String], input: Option<&[u8]>) -> Result<String, CommandError> {
        let args = self.concat_args(args);
        let program = self.program.display().to_string();
        debug!("{} {}", program, args.join(" "));

        let stdin = match input {
            Some(_) => Stdio::piped(),
            None => Stdio::null(),
        };
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::Spawn(program.clone(), e))?;

        let completion = async {
            if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
                stdin.write_all(input).await?;
                // closing stdin lets the tool see EOF
                drop(stdin);
            }
            child.wait_with_output().await
        };
        let output = tokio::time::timeout(self.timeout, completion)
            .await
            .map_err(|_| CommandError::Timeout(program.clone(), self.timeout))?
            .map_err(|e| CommandError::Spawn(program.clone(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        trace!("{} stdout: {}", program, stdout);

        if !output.status.success() {
            error!("{} failed: {}", program, stderr);
            return Err(CommandError::Failed {
                program,
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(stdout)
    }
}
