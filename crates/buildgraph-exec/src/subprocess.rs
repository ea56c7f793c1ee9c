//! Host-subprocess runtime: executes invocations directly on the host with a
//! scrubbed environment. Pairs with an identity-mapped context, where
//! container paths equal host paths and binds are a no-op. Used for tests,
//! bootstrap flows, and machines without a container runtime.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use buildgraph_core::{BuildGraphError, Result};

use crate::runtime::{LaunchRequest, Runtime};
use crate::stream::forward_stream;

/// Exit code reported when an invocation exceeds its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Default)]
pub struct SubprocessRuntime;

impl SubprocessRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runtime for SubprocessRuntime {
    async fn launch(&self, request: LaunchRequest) -> Result<i32> {
        let (program, args) = request.command.split_first().ok_or_else(|| {
            BuildGraphError::Execution("no command provided to execute".to_string())
        })?;

        let mut command = Command::new(program);
        command.args(args).env_clear().envs(&request.env);
        if let Some(workdir) = &request.host_workdir {
            std::fs::create_dir_all(workdir)?;
            command.current_dir(workdir);
        }

        if request.interactive {
            command
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        } else {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|error| {
            BuildGraphError::Execution(format!("failed to launch `{program}`: {error}"))
        })?;

        let mut forwards = Vec::new();
        if !request.interactive {
            if let Some(stdout) = child.stdout.take() {
                forwards.push(tokio::spawn(async move {
                    forward_stream(stdout, std::io::stdout()).await
                }));
            }
            if let Some(stderr) = child.stderr.take() {
                forwards.push(tokio::spawn(async move {
                    forward_stream(stderr, std::io::stderr()).await
                }));
            }
        }

        let status = match request.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(?timeout, command = %program, "invocation timed out, killing");
                    let _ = child.kill().await;
                    for forward in forwards {
                        let _ = forward.await;
                    }
                    return Ok(TIMEOUT_EXIT_CODE);
                }
            },
            None => child.wait().await?,
        };

        for forward in forwards {
            if let Ok(Err(error)) = forward.await {
                warn!(%error, "stream forwarding failed");
            }
        }

        let code = status.code().unwrap_or(-1);
        debug!(command = %program, code, "invocation finished");
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request(command: &[&str]) -> LaunchRequest {
        LaunchRequest {
            image: "host".to_string(),
            command: command.iter().map(|part| part.to_string()).collect(),
            env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            binds: Vec::new(),
            workdir: PathBuf::from("/"),
            host_workdir: Some(std::env::temp_dir()),
            interactive: false,
            display: false,
            hostname: "test".to_string(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn exit_codes_are_reported() {
        let runtime = SubprocessRuntime::new();
        assert_eq!(runtime.launch(request(&["/bin/sh", "-c", "true"])).await.unwrap(), 0);
        assert_eq!(
            runtime
                .launch(request(&["/bin/sh", "-c", "exit 3"]))
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        let runtime = SubprocessRuntime::new();
        let code = runtime
            .launch(request(&["/bin/sh", "-c", "test -z \"$HOME\""]))
            .await
            .unwrap();
        assert_eq!(code, 0, "inherited environment must not leak through");
    }

    #[tokio::test]
    async fn timeouts_surface_as_nonzero_exit() {
        let runtime = SubprocessRuntime::new();
        let mut req = request(&["/bin/sh", "-c", "sleep 5"]);
        req.timeout = Some(Duration::from_millis(100));
        assert_eq!(runtime.launch(req).await.unwrap(), TIMEOUT_EXIT_CODE);
    }

    #[tokio::test]
    async fn missing_binaries_are_execution_errors() {
        let runtime = SubprocessRuntime::new();
        let error = runtime
            .launch(request(&["/no/such/binary"]))
            .await
            .unwrap_err();
        assert!(matches!(error, BuildGraphError::Execution(_)));
    }
}
