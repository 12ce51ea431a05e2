//! LeftHand CLIQ over SSH
//!
//! Remote snapshot schedules are not exposed by the REST API, so they are
//! driven through the array's command line on its SSH port.

use super::client::{RemoteSnapshotSchedule, SshSettings};
use crate::backends::http::{ClientError, ClientResult};
use async_trait::async_trait;
use shell_escape::unix::escape;
use std::borrow::Cow;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Captured output of an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Runs external programs; faked in tests
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, writing `input` to its stdin
    async fn run(&self, program: &str, args: &[String], input: &str) -> ClientResult<CommandOutput>;
}

pub type CommandRunnerRef = Arc<dyn CommandRunner>;

/// Runner that spawns processes on the local host
#[derive(Debug, Clone, Default)]
pub struct ProcessCommandRunner;

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(&self, program: &str, args: &[String], input: &str) -> ClientResult<CommandOutput> {
        let command_error = |err: std::io::Error| ClientError::Command {
            program: program.to_string(),
            message: err.to_string(),
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(command_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(command_error)?;
            stdin.write_all(b"\n").await.map_err(command_error)?;
            // Closing stdin ends the remote session after the command
            drop(stdin);
        }

        let output = child.wait_with_output().await.map_err(command_error)?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// CLIQ shell of one management group
pub struct CliqShell {
    runner: CommandRunnerRef,
    ssh_bin: String,
    settings: SshSettings,
}

impl CliqShell {
    /// Create a new CLIQ shell
    pub fn new(runner: CommandRunnerRef, ssh_bin: impl Into<String>, settings: SshSettings) -> Self {
        Self {
            runner,
            ssh_bin: ssh_bin.into(),
            settings,
        }
    }

    /// The CLIQ command itself travels on stdin, keeping parameters such as
    /// `remotePassword` out of the local process table
    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-T".to_string(),
            "-p".to_string(),
            self.settings.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.conn_timeout.as_secs()),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(key) = &self.settings.private_key {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.settings.username, self.settings.host));
        args
    }

    /// Render `command key=value ...` with every parameter escaped
    fn render(command: &str, params: &[(&str, String)]) -> String {
        let mut line = command.to_string();
        for (key, value) in params {
            line.push(' ');
            line.push_str(&escape(Cow::Owned(format!("{}={}", key, value))));
        }
        line
    }

    async fn run(&self, command: &str, params: &[(&str, String)]) -> ClientResult<CommandOutput> {
        debug!("CLIQ {} on {}", command, self.settings.host);

        let output = self
            .runner
            .run(&self.ssh_bin, &self.ssh_args(), &Self::render(command, params))
            .await?;
        if output.is_success() {
            return Ok(output);
        }

        let message = output.combined().trim().to_string();
        if is_not_found(&message) {
            return Err(ClientError::NotFound { message });
        }
        Err(ClientError::Command {
            program: format!("cliq {}", command),
            message,
        })
    }

    pub async fn schedule_exists(&self, name: &str) -> ClientResult<bool> {
        match self
            .run("getRemoteSnapshotSchedule", &[("scheduleName", name.to_string())])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn create_schedule(&self, schedule: &RemoteSnapshotSchedule) -> ClientResult<()> {
        let params = [
            ("volumeName", schedule.volume_name.clone()),
            ("scheduleName", schedule.schedule_name.clone()),
            ("periodSeconds", schedule.period_secs.to_string()),
            ("startTime", schedule.start_time.clone()),
            ("retentionCount", schedule.retention_count.to_string()),
            ("remoteCluster", schedule.source_cluster.clone()),
            ("remoteRetentionCount", schedule.remote_retention_count.to_string()),
            ("remoteVolumeName", schedule.remote_volume_name.clone()),
            ("remoteIp", schedule.remote_ip.clone()),
            ("remoteUserName", schedule.remote_username.clone()),
            ("remotePassword", schedule.remote_password.clone()),
        ];
        self.run("createRemoteSnapshotSchedule", &params).await.map(|_| ())
    }

    pub async fn start_schedule(&self, name: &str) -> ClientResult<()> {
        self.run("startRemoteSnapshotSchedule", &[("scheduleName", name.to_string())])
            .await
            .map(|_| ())
    }

    pub async fn stop_schedule(&self, name: &str) -> ClientResult<()> {
        self.run("stopRemoteSnapshotSchedule", &[("scheduleName", name.to_string())])
            .await
            .map(|_| ())
    }

    pub async fn delete_schedule(&self, name: &str) -> ClientResult<()> {
        self.run("deleteRemoteSnapshotSchedule", &[("scheduleName", name.to_string())])
            .await
            .map(|_| ())
    }
}

fn is_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found") || lower.contains("does not exist")
}
