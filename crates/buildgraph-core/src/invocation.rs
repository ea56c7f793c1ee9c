//! A single execute-request yielded by a transform: the tool version to run,
//! what to launch, and any extra binds or environment the command needs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::tool::{Version, VersionKey};

/// The binary to launch: a path (translated to the tool's sandbox location)
/// or a bare name resolved through `$PATH`.
#[derive(Debug, Clone, PartialEq)]
pub enum Executable {
    Path(PathBuf),
    Name(String),
}

/// An invocation argument. Paths are translated to container-side strings
/// and their parent directories bound in.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Str(String),
    Path(PathBuf),
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

impl From<PathBuf> for Arg {
    fn from(value: PathBuf) -> Self {
        Arg::Path(value)
    }
}

/// An extra path to bind for the duration of the invocation. When no
/// container path is given it is derived through the context mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct BindSpec {
    pub host: PathBuf,
    pub cont: Option<PathBuf>,
}

impl BindSpec {
    pub fn mapped(host: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            cont: None,
        }
    }

    pub fn at(host: impl Into<PathBuf>, cont: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            cont: Some(cont.into()),
        }
    }
}

/// Encapsulates the invocation of a tool within the sandbox environment.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: VersionKey,
    pub execute: Executable,
    pub args: Vec<Arg>,
    pub workdir: Option<PathBuf>,
    pub interactive: bool,
    pub display: bool,
    pub binds: Vec<BindSpec>,
    pub ro_binds: Vec<BindSpec>,
    pub env: BTreeMap<String, String>,
    pub path: BTreeMap<String, Vec<PathBuf>>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(version: &Version, execute: Executable) -> Self {
        Self {
            tool: version.version_key(),
            execute,
            args: Vec::new(),
            workdir: None,
            interactive: false,
            display: false,
            binds: Vec::new(),
            ro_binds: Vec::new(),
            env: BTreeMap::new(),
            path: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = Arg>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    /// Forward the host display; implies an interactive terminal.
    pub fn display(mut self) -> Self {
        self.display = true;
        self.interactive = true;
        self
    }

    pub fn bind(mut self, bind: BindSpec) -> Self {
        self.binds.push(bind);
        self
    }

    pub fn bind_readonly(mut self, bind: BindSpec) -> Self {
        self.ro_binds.push(bind);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn extend_path(mut self, key: impl Into<String>, segments: Vec<PathBuf>) -> Self {
        self.path.insert(key.into(), segments);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
