//! External SSH client strategy
//!
//! Runs an installed client (OpenSSH `ssh`, PuTTY `plink`) with a typed
//! argument vector instead of the in-process transport. The child inherits
//! the terminal, except with `password_on_stdin`: then its stdin is a pipe
//! that gets the password line first and the local stdin after it.

use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::lifecycle::SessionOutcome;
use super::shutdown::ShutdownSignal;
use crate::credentials::ConnectionParameters;

/// Command-line dialect of the external client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgsStyle {
    #[default]
    OpenSsh,
    Plink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalClient {
    /// Executable name or path
    pub program: String,
    #[serde(default)]
    pub args_style: ArgsStyle,
    /// Write the password plus newline to the child's stdin before handing
    /// the terminal over
    #[serde(default)]
    pub password_on_stdin: bool,
    /// Appended after the generated arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for ExternalClient {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            args_style: ArgsStyle::OpenSsh,
            password_on_stdin: false,
            extra_args: Vec::new(),
        }
    }
}

impl ExternalClient {
    /// Argument vector for connecting with `params`. The password never
    /// appears here.
    pub fn build_args(&self, params: &ConnectionParameters) -> Vec<String> {
        let destination = format!("{}@{}", params.username, params.host);
        let port = params.port.to_string();

        let mut args = match self.args_style {
            ArgsStyle::OpenSsh => {
                let mut args = vec!["-p".to_string(), port];
                if !params.host_key_check {
                    args.extend([
                        "-o".to_string(),
                        "StrictHostKeyChecking=no".to_string(),
                        "-o".to_string(),
                        "UserKnownHostsFile=/dev/null".to_string(),
                    ]);
                }
                args.push(destination);
                args
            }
            ArgsStyle::Plink => {
                vec!["-P".to_string(), port, destination, "-no-antispoof".to_string()]
            }
        };
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Run the client until it exits or the session is cancelled. The
    /// child is killed if cancellation wins.
    pub async fn run(
        &self,
        params: &ConnectionParameters,
        shutdown: &ShutdownSignal,
    ) -> Result<SessionOutcome, SshError> {
        self.run_with_stdin(params, shutdown, tokio::io::stdin()).await
    }

    async fn run_with_stdin<R>(
        &self,
        params: &ConnectionParameters,
        shutdown: &ShutdownSignal,
        mut local_stdin: R,
    ) -> Result<SessionOutcome, SshError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let args = self.build_args(params);
        info!("Launching external client {} {:?}", self.program, args);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if self.password_on_stdin {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::inherit());
        }

        let mut child = command.spawn().map_err(|e| {
            SshError::ExternalClient(format!("failed to start {}: {}", self.program, e))
        })?;

        let mut relay = None;
        if let Some(mut pipe) = child.stdin.take() {
            let mut line = params.secret.as_bytes().to_vec();
            line.push(b'\n');
            let written = pipe.write_all(&line).await;
            zeroize::Zeroize::zeroize(&mut line);

            match written {
                Ok(()) => {
                    let token = shutdown.token();
                    relay = Some(tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            copied = tokio::io::copy(&mut local_stdin, &mut pipe) => match copied {
                                Ok(n) => debug!("Local stdin closed after {} bytes", n),
                                Err(e) => debug!("Stdin relay stopped: {}", e),
                            },
                        }
                        // Dropping the pipe gives the child EOF
                    }));
                }
                Err(e) => warn!("Could not pass password to {}: {}", self.program, e),
            }
        }

        let outcome = tokio::select! {
            status = child.wait() => {
                let status = status?;
                debug!("{} exited with {:?}", self.program, status);
                outcome_from_status(status)
            }
            _ = shutdown.triggered() => {
                info!("Session cancelled, stopping {}", self.program);
                if let Err(e) = child.kill().await {
                    debug!("Kill {}: {}", self.program, e);
                }
                SessionOutcome::Cancelled
            }
        };

        if let Some(relay) = relay {
            relay.abort();
        }
        Ok(outcome)
    }
}

/// Map a child exit status to a session outcome
pub fn outcome_from_status(status: ExitStatus) -> SessionOutcome {
    if let Some(code) = status.code() {
        return outcome_from_code(code);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return SessionOutcome::Signalled {
                signal: signal.to_string(),
            };
        }
    }

    SessionOutcome::ConnectionLost {
        reason: format!("client ended without status: {}", status),
    }
}

fn outcome_from_code(code: i32) -> SessionOutcome {
    match u32::try_from(code) {
        Ok(code) => SessionOutcome::from_remote_exit(Some(code), None),
        Err(_) => SessionOutcome::ConnectionLost {
            reason: format!("client exited with status {}", code),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::shutdown::ShutdownReason;
    use std::time::Duration;
    use zeroize::Zeroizing;

    fn params(host_key_check: bool) -> ConnectionParameters {
        ConnectionParameters {
            host: "10.0.0.5".to_string(),
            port: 2222,
            username: "alice".to_string(),
            secret: Zeroizing::new("p1".to_string()),
            host_key_check,
        }
    }

    #[test]
    fn test_openssh_args() {
        let client = ExternalClient::default();
        assert_eq!(
            client.build_args(&params(true)),
            vec!["-p", "2222", "alice@10.0.0.5"]
        );

        let insecure = client.build_args(&params(false));
        assert_eq!(insecure.last().map(String::as_str), Some("alice@10.0.0.5"));
        assert!(insecure.contains(&"StrictHostKeyChecking=no".to_string()));
    }

    #[test]
    fn test_plink_args() {
        let client = ExternalClient {
            program: "plink".to_string(),
            args_style: ArgsStyle::Plink,
            password_on_stdin: true,
            extra_args: vec!["-batch".to_string()],
        };
        let args = client.build_args(&params(true));
        assert_eq!(
            args,
            vec!["-P", "2222", "alice@10.0.0.5", "-no-antispoof", "-batch"]
        );
        assert!(!args.iter().any(|a| a.contains("p1")));
    }

    #[test]
    fn test_config_round_trip_defaults() {
        let client: ExternalClient = serde_json::from_str(r#"{"program": "ssh"}"#).unwrap();
        assert_eq!(client, ExternalClient::default());

        let plink: ExternalClient =
            serde_json::from_str(r#"{"program": "plink", "args_style": "plink"}"#).unwrap();
        assert_eq!(plink.args_style, ArgsStyle::Plink);
    }

    /// Executable script standing in for an ssh client
    #[cfg(unix)]
    fn script_client(dir: &std::path::Path, body: &str, password_on_stdin: bool) -> ExternalClient {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ssh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        ExternalClient {
            program: path.display().to_string(),
            args_style: ArgsStyle::OpenSsh,
            password_on_stdin,
            extra_args: vec![],
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_mapping() {
        let (temp_ok, temp_failed) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

        let ok = script_client(temp_ok.path(), "exit 0", false);
        assert_eq!(
            ok.run(&params(true), &ShutdownSignal::new()).await.unwrap(),
            SessionOutcome::Closed {
                exit_status: Some(0)
            }
        );

        let failed = script_client(temp_failed.path(), "exit 7", false);
        assert_eq!(
            failed.run(&params(true), &ShutdownSignal::new()).await.unwrap(),
            SessionOutcome::RemoteFailure { exit_status: 7 }
        );
    }

    #[test]
    fn test_negative_exit_code_is_not_wrapped() {
        assert_eq!(
            outcome_from_code(3),
            SessionOutcome::RemoteFailure { exit_status: 3 }
        );
        assert!(matches!(
            outcome_from_code(-1073741510),
            SessionOutcome::ConnectionLost { .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_password_and_args_reach_child() {
        let temp = tempfile::tempdir().unwrap();
        let capture = temp.path().join("capture.txt");
        let body = format!(
            "echo \"$@\" > '{0}'\ncat >> '{0}'",
            capture.display()
        );
        let client = script_client(temp.path(), &body, true);

        let outcome = client
            .run_with_stdin(&params(true), &ShutdownSignal::new(), tokio::io::empty())
            .await
            .unwrap();
        assert!(outcome.is_clean());
        assert_eq!(
            std::fs::read_to_string(capture).unwrap(),
            "-p 2222 alice@10.0.0.5\np1\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_stdin_follows_password() {
        let temp = tempfile::tempdir().unwrap();
        let capture = temp.path().join("capture.txt");
        let body = format!(
            "read pw\nif read more; then echo \"$pw more:$more\" > '{0}'; else echo EOF > '{0}'; fi",
            capture.display()
        );
        let client = script_client(temp.path(), &body, true);

        let outcome = client
            .run_with_stdin(&params(true), &ShutdownSignal::new(), &b"extra\n"[..])
            .await
            .unwrap();
        assert!(outcome.is_clean());
        assert_eq!(std::fs::read_to_string(capture).unwrap(), "p1 more:extra\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_child() {
        let temp = tempfile::tempdir().unwrap();
        let client = script_client(temp.path(), "sleep 30", false);
        let shutdown = ShutdownSignal::new();

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger(ShutdownReason::Interrupted);
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            client.run(&params(true), &shutdown),
        )
        .await
        .expect("child was not stopped")
        .unwrap();
        assert_eq!(outcome, SessionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_program_is_external_client_error() {
        let client = ExternalClient {
            program: "/nonexistent/vaultshell-test-ssh".to_string(),
            ..Default::default()
        };

        let err = client
            .run(&params(true), &ShutdownSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::ExternalClient(_)));
    }
}
