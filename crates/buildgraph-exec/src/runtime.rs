//! The injected launch primitive: "run this command inside the isolation
//! boundary and give me the exit code". Container runtime selection
//! (Docker/Podman/...) lives outside the engine; anything that can satisfy
//! this trait can execute transforms.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use buildgraph_core::Result;

/// One bind mount applied to a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub host: PathBuf,
    pub cont: PathBuf,
    pub readonly: bool,
}

/// Everything a runtime needs to execute one command to completion.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub binds: Vec<Bind>,
    /// Working directory as seen inside the isolation boundary.
    pub workdir: PathBuf,
    /// Host-side equivalent of `workdir`, when it maps to one. Host-local
    /// runtimes use this directly.
    pub host_workdir: Option<PathBuf>,
    /// Attach a TTY and forward stdin.
    pub interactive: bool,
    /// Forward the host display (implies interactive).
    pub display: bool,
    pub hostname: String,
    /// Per-invocation timeout; expiry must surface as a nonzero exit code.
    pub timeout: Option<Duration>,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run to completion with stdio forwarded, returning the exit code.
    async fn launch(&self, request: LaunchRequest) -> Result<i32>;
}
