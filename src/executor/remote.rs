//! Versioned remote command contract and the ssh channel that carries it.
//!
//! One request is a single JSON line on the agent's stdin:
//! `{"v":1,"op":"create","args":{...}}`. The agent answers with one line:
//! `OK:<count>`, `EXISTS`, `NOT_FOUND`, `DATA:<json>` or `ERROR:<reason>`.
//! Anything the agent prints before its last line is ignored.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use super::ExecutorError;
use crate::config::ShellConfig;

/// Contract version sent with every request.
pub const PROTOCOL_VERSION: u32 = 1;

/// Exit status ssh uses for its own failures.
const SSH_FAILURE: i32 = 255;
/// Exit status sshpass uses for a refused password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// Named operations the remote agent understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum RemoteOp {
    Create {
        endpoint_id: u32,
        identity: Uuid,
        label: String,
        expiry_ms: i64,
        ip_limit: u32,
        quota_bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
    },
    Delete {
        #[serde(skip_serializing_if = "Option::is_none")]
        identity: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    Find {
        #[serde(skip_serializing_if = "Option::is_none")]
        identity: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    List,
    Profile {
        endpoint_id: u32,
    },
    UpdateExpiry {
        identity: Uuid,
        expiry_ms: i64,
    },
    Restart,
}

#[derive(Serialize)]
struct Envelope<'a> {
    v: u32,
    #[serde(flatten)]
    op: &'a RemoteOp,
}

impl RemoteOp {
    /// Request line, without the trailing newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope {
            v: PROTOCOL_VERSION,
            op: self,
        })
    }

    /// Operations that change the backend's credential store.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            RemoteOp::Create { .. } | RemoteOp::Delete { .. } | RemoteOp::UpdateExpiry { .. }
        )
    }
}

/// Parsed agent answer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteReply {
    Ok(u64),
    Exists,
    NotFound,
    Data(Value),
    Error(String),
}

impl RemoteReply {
    /// Parse the last non-empty line of the agent output.
    pub fn parse(output: &str) -> Option<Self> {
        let line = output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()?;

        if let Some(count) = line.strip_prefix("OK:") {
            return count.trim().parse().ok().map(RemoteReply::Ok);
        }
        if let Some(json) = line.strip_prefix("DATA:") {
            return serde_json::from_str(json).ok().map(RemoteReply::Data);
        }
        if let Some(reason) = line.strip_prefix("ERROR:") {
            return Some(RemoteReply::Error(reason.trim().to_string()));
        }
        match line {
            "EXISTS" => Some(RemoteReply::Exists),
            "NOT_FOUND" => Some(RemoteReply::NotFound),
            _ => None,
        }
    }
}

/// Channel that delivers one request line and returns the raw output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &str) -> Result<String, ExecutorError>;
}

/// Runs the agent through the local ssh client.
pub struct SshRunner {
    backend: String,
    host: String,
    config: ShellConfig,
    timeout: Duration,
}

impl SshRunner {
    pub fn new(backend: &str, host: &str, config: ShellConfig, timeout: Duration) -> Self {
        Self {
            backend: backend.to_string(),
            host: host.to_string(),
            config,
            timeout,
        }
    }

    fn command(&self) -> Command {
        let mut command = match &self.config.password {
            Some(password) => {
                let mut command = Command::new("sshpass");
                command
                    .arg("-e")
                    .arg(&self.config.ssh_binary)
                    .env("SSHPASS", password.expose());
                command
            }
            None => {
                let mut command = Command::new(&self.config.ssh_binary);
                command.arg("-o").arg("BatchMode=yes");
                command
            }
        };

        if let Some(identity) = &self.config.identity_file {
            command.arg("-i").arg(identity);
        }
        command
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-T")
            .arg(format!("{}@{}", self.config.user, self.host))
            .arg(&self.config.agent_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn unreachable(&self, reason: impl Into<String>) -> ExecutorError {
        ExecutorError::Unreachable {
            backend: self.backend.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, request: &str) -> Result<String, ExecutorError> {
        let mut child = self
            .command()
            .spawn()
            .map_err(|e| self.unreachable(format!("cannot start ssh: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.unreachable("ssh stdin unavailable"))?;

        let exchange = async move {
            let line = format!("{}\n", request);
            // ssh may exit before reading stdin; its status says why.
            match stdin.write_all(line.as_bytes()).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
            drop(stdin);
            child.wait_with_output().await
        };

        // Dropping the exchange on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.unreachable(e.to_string())),
            Err(_) => {
                tracing::warn!(backend = %self.backend, "Remote command timed out");
                return Err(ExecutorError::Timeout {
                    backend: self.backend.clone(),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr_tail = stderr.lines().last().unwrap_or_default().trim().to_string();

        match output.status.code() {
            Some(0) => Ok(stdout),
            Some(SSHPASS_BAD_PASSWORD) if self.config.password.is_some() => {
                Err(ExecutorError::AuthenticationFailure {
                    backend: self.backend.clone(),
                    reason: "password refused".to_string(),
                })
            }
            Some(SSH_FAILURE) if stderr.contains("Permission denied") => {
                Err(ExecutorError::AuthenticationFailure {
                    backend: self.backend.clone(),
                    reason: stderr_tail,
                })
            }
            Some(SSH_FAILURE) => Err(self.unreachable(stderr_tail)),
            // The agent may exit non-zero after printing its ERROR line.
            _ if RemoteReply::parse(&stdout).is_some() => Ok(stdout),
            code => Err(ExecutorError::BackendRejected {
                backend: self.backend.clone(),
                reason: if stderr_tail.is_empty() {
                    format!("agent exited with {:?}", code)
                } else {
                    stderr_tail
                },
            }),
        }
    }
}
