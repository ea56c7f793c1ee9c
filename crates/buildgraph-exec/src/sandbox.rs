//! The sandbox: an isolated execution context assembled per transform from
//! path bindings, a composed environment, and a curated tool set.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use buildgraph_core::{
    paths::{resolve_lenient, same_file},
    Arg, BindSink, BuildGraphError, Context, Executable, Invocation, Result, ToolEnv, ToolKey,
    ToolRegistry, Version,
};

use crate::runtime::{Bind, LaunchRequest, Runtime};

fn bind_error(host: &Path, cont: &Path, readonly: bool, existing: &Bind) -> BuildGraphError {
    BuildGraphError::Bind(format!(
        "cannot bind {} to {} (as {}) due to collision with existing bind {} to {} (as {})",
        host.display(),
        cont.display(),
        if readonly { "readonly" } else { "writable" },
        existing.host.display(),
        existing.cont.display(),
        if existing.readonly { "readonly" } else { "writable" },
    ))
}

pub struct Sandbox {
    ctx: Arc<Context>,
    registry: Arc<ToolRegistry>,
    id: String,
    binds: Vec<Bind>,
    env: BTreeMap<String, String>,
    tools: HashMap<ToolKey, Version>,
    in_launch: bool,
}

impl Sandbox {
    /// A fresh sandbox with the standard baseline: the scratch area bound
    /// writable, default search paths, and the project environment.
    pub fn new(ctx: Arc<Context>, registry: Arc<ToolRegistry>) -> Result<Self> {
        let host_scratch = ctx.host_scratch.clone();
        let cont_scratch = ctx.container_scratch.clone();
        let cont_root = ctx.container_root.clone();
        let cont_tools = ctx.container_tools.clone();
        let project = ctx.project.clone();

        let mut sandbox = Self {
            ctx,
            registry,
            id: format!("bg_{}", Uuid::new_v4().simple()),
            binds: Vec::new(),
            env: BTreeMap::new(),
            tools: HashMap::new(),
            in_launch: false,
        };
        sandbox.bind_path(&host_scratch, Some(&cont_scratch), false, true)?;
        for path in [
            "/usr/local/sbin",
            "/usr/local/bin",
            "/usr/sbin",
            "/usr/bin",
            "/sbin",
            "/bin",
        ] {
            sandbox.append_env_path("PATH", path)?;
        }
        sandbox.set_env("BG_ROOT", &cont_root.to_string_lossy())?;
        sandbox.set_env("BG_SCRATCH", &cont_scratch.to_string_lossy())?;
        sandbox.set_env("BG_TOOLS", &cont_tools.to_string_lossy())?;
        sandbox.set_env("BG_PROJECT", &project)?;
        Ok(sandbox)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn check_mutable(&self) -> Result<()> {
        if self.in_launch {
            return Err(BuildGraphError::Bind(
                "sandbox is frozen while a launch is in flight".to_string(),
            ));
        }
        Ok(())
    }

    /// Bind a host path into the sandbox. Admission rules:
    /// - An exact repeat (same container path, same host file, same mode)
    ///   dedupes silently.
    /// - A bind nested inside an existing one (or enclosing one) with
    ///   matching host/container offsets and the same mode collapses to the
    ///   outer bind.
    /// - A nested bind with matching offsets but a different mode is kept as
    ///   a shadowing bind: a read-only input directory inside the writable
    ///   scratch area stays read-only. Launches mount ancestors first so the
    ///   inner mode wins.
    /// - Any other overlap on the container side is an error citing both
    ///   binds.
    ///
    /// Admission is therefore commutative: the effective bind set does not
    /// depend on the order binds arrive in.
    pub fn bind_path(
        &mut self,
        host: &Path,
        cont: Option<&Path>,
        readonly: bool,
        mkdir: bool,
    ) -> Result<PathBuf> {
        self.check_mutable()?;
        let cont = match cont {
            Some(cont) => buildgraph_core::paths::normalize_path(cont),
            None => {
                let name = host.file_name().ok_or_else(|| {
                    BuildGraphError::Bind(format!(
                        "cannot derive a container path for `{}`",
                        host.display()
                    ))
                })?;
                Path::new("/").join(name)
            }
        };
        let host = resolve_lenient(host);
        if mkdir && !host.exists() {
            std::fs::create_dir_all(&host)?;
        }

        let mut redundant = Vec::new();
        for (index, bind) in self.binds.iter().enumerate() {
            if bind.cont == cont {
                if same_file(&bind.host, &host) && bind.readonly == readonly {
                    return Ok(cont);
                }
                return Err(bind_error(&host, &cont, readonly, bind));
            }
            if bind.cont.starts_with(&cont) {
                // Existing bind is nested inside the new one.
                let offset = bind.cont.strip_prefix(&cont).expect("starts_with checked");
                let aligned = bind
                    .host
                    .strip_prefix(&host)
                    .map(|host_offset| host_offset == offset)
                    .unwrap_or(false);
                if !aligned {
                    return Err(bind_error(&host, &cont, readonly, bind));
                }
                if bind.readonly == readonly {
                    redundant.push(index);
                }
                continue;
            }
            if cont.starts_with(&bind.cont) {
                // The new bind is nested inside an existing one.
                let offset = cont.strip_prefix(&bind.cont).expect("starts_with checked");
                let aligned = host
                    .strip_prefix(&bind.host)
                    .map(|host_offset| host_offset == offset)
                    .unwrap_or(false);
                if !aligned {
                    return Err(bind_error(&host, &cont, readonly, bind));
                }
                if bind.readonly == readonly {
                    return Ok(cont);
                }
                // Different mode: fall through and keep both, the nested
                // bind shadows the enclosing one.
                continue;
            }
        }
        for index in redundant.into_iter().rev() {
            self.binds.remove(index);
        }
        self.binds.push(Bind {
            host,
            cont: cont.clone(),
            readonly,
        });
        Ok(cont)
    }

    /// Whether a host/container pair is already reachable through an
    /// existing bind with aligned offsets, regardless of mode.
    fn covers(&self, host: &Path, cont: &Path) -> bool {
        self.binds
            .iter()
            .any(|bind| match cont.strip_prefix(&bind.cont) {
                Ok(offset) => bind.host.join(offset).as_path() == host,
                Err(_) => false,
            })
    }

    /// Overlay environment variables; with `strict`, a collision with a
    /// differing existing value is an error.
    pub fn overlay_env(&mut self, env: &BTreeMap<String, String>, strict: bool) -> Result<()> {
        self.check_mutable()?;
        for (key, value) in env {
            if strict {
                if let Some(existing) = self.env.get(key) {
                    if existing != value {
                        return Err(BuildGraphError::Bind(format!(
                            "clash for key '{key}' between existing environment \
                             value '{existing}' and new value '{value}'"
                        )));
                    }
                }
            }
            self.env.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Add a tool version and, recursively, its requirements. A second
    /// version of an already-added tool is an error; the tool's location is
    /// bound read-only, its environment overlaid strictly, and its declared
    /// path segments prepended.
    pub fn add_tool(&mut self, version: &Version) -> Result<()> {
        if let Some(existing) = self.tools.get(&version.key) {
            if existing.version == version.version {
                return Ok(());
            }
            return Err(BuildGraphError::Tool(format!(
                "tool already registered for id '{}' at version {} (asked for {})",
                version.key, existing.version, version.version
            )));
        }

        for require in &version.requires {
            let required = self.registry.resolve(require)?.clone();
            if let Some(existing) = self.tools.get(&require.tool) {
                if existing.version != required.version {
                    return Err(BuildGraphError::Tool(format!(
                        "version clash for tool '{}': {} != {}",
                        require.tool, required.version, existing.version
                    )));
                }
            } else {
                self.add_tool(&required)?;
            }
        }

        self.tools.insert(version.key.clone(), version.clone());
        let host = version.host_path(&self.ctx);
        let cont = version.container_path(&self.ctx);
        debug!(tool = %version.version_key(), host = %host.display(), cont = %cont.display(), "binding tool");
        self.bind_path(&host, Some(&cont), true, false)?;

        let mut env = BTreeMap::new();
        for (key, value) in &version.env {
            let text = match value {
                ToolEnv::Literal(text) => text.clone(),
                ToolEnv::ToolPath(path) => version
                    .container_subpath(&self.ctx, path)
                    .to_string_lossy()
                    .into_owned(),
            };
            env.insert(key.clone(), text);
        }
        self.overlay_env(&env, true)?;

        for (key, segments) in &version.paths {
            for segment in segments {
                let resolved = version.container_subpath(&self.ctx, segment);
                self.prepend_env_path(key, &resolved.to_string_lossy())?;
            }
        }
        Ok(())
    }

    /// Evaluate a tool invocation: bind its tool and paths, compose the
    /// environment, and launch through the runtime. Returns the exit code.
    pub async fn invoke(
        &mut self,
        invocation: &Invocation,
        runtime: &dyn Runtime,
    ) -> Result<i32> {
        let version = self.registry.version(&invocation.tool)?.clone();
        self.add_tool(&version)?;

        // Convert path arguments to container-side strings, binding their
        // parent directories writable.
        let mut args = Vec::with_capacity(invocation.args.len());
        for arg in &invocation.args {
            match arg {
                Arg::Str(text) => args.push(text.clone()),
                Arg::Path(path) => {
                    let host = resolve_lenient(path);
                    match self.ctx.map_to_container(&host) {
                        Ok(cont) => {
                            // Paths already reachable through an interface or
                            // tool bind keep that bind's mode; only ad-hoc
                            // arguments get a fresh writable parent bind.
                            if !self.covers(&host, &cont) {
                                let host_parent = host.parent().ok_or_else(|| {
                                    BuildGraphError::Bind(format!(
                                        "path argument `{}` has no parent directory",
                                        host.display()
                                    ))
                                })?;
                                let cont_parent =
                                    cont.parent().expect("mapped path has a parent");
                                self.bind_path(host_parent, Some(cont_parent), false, true)?;
                            }
                            args.push(cont.to_string_lossy().into_owned());
                        }
                        Err(_) => {
                            debug!(path = %host.display(), "assuming container-relative path argument");
                            args.push(host.to_string_lossy().into_owned());
                        }
                    }
                }
            }
        }

        for spec in &invocation.binds {
            self.apply_bind_spec(spec, false)?;
        }
        for spec in &invocation.ro_binds {
            self.apply_bind_spec(spec, true)?;
        }

        let command = match &invocation.execute {
            Executable::Path(path) => version
                .container_subpath(&self.ctx, path)
                .to_string_lossy()
                .into_owned(),
            Executable::Name(name) => name.clone(),
        };

        let workdir = invocation
            .workdir
            .clone()
            .unwrap_or_else(|| self.ctx.container_root.clone());
        let host_workdir = self.ctx.map_to_host(&workdir).ok();
        if let Some(host_workdir) = &host_workdir {
            if !host_workdir.exists() {
                std::fs::create_dir_all(host_workdir)?;
            }
        }

        let mut env = self.env.clone();
        env.extend(invocation.env.clone());
        for (key, segments) in &invocation.path {
            let joined = segments
                .iter()
                .map(|segment| segment.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(":");
            match env.get_mut(key) {
                Some(existing) if !existing.is_empty() => {
                    *existing = format!("{existing}:{joined}");
                }
                _ => {
                    env.insert(key.clone(), joined);
                }
            }
        }

        let mut command_line = vec![command];
        command_line.extend(args);
        debug!(id = %self.id, command = ?command_line, "launching invocation");

        // Ancestors first, so nested shadowing binds keep their mode when a
        // runtime mounts in list order.
        let mut binds = self.binds.clone();
        binds.sort_by_key(|bind| bind.cont.components().count());

        self.in_launch = true;
        let result = runtime
            .launch(LaunchRequest {
                image: self.ctx.image.clone(),
                command: command_line,
                env,
                binds,
                workdir,
                host_workdir,
                interactive: invocation.interactive,
                display: invocation.display,
                hostname: self.id.clone(),
                timeout: invocation.timeout,
            })
            .await;
        self.in_launch = false;
        result
    }

    fn apply_bind_spec(
        &mut self,
        spec: &buildgraph_core::BindSpec,
        readonly: bool,
    ) -> Result<()> {
        let host = resolve_lenient(&spec.host);
        let cont = match &spec.cont {
            Some(cont) => cont.clone(),
            None => self.ctx.map_to_container(&host)?,
        };
        self.bind_path(&host, Some(&cont), readonly, false)?;
        Ok(())
    }
}

impl BindSink for Sandbox {
    fn bind(&mut self, host: &Path, cont: &Path, readonly: bool, mkdir: bool) -> Result<PathBuf> {
        self.bind_path(host, Some(cont), readonly, mkdir)
    }

    fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.check_mutable()?;
        self.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn append_env_path(&mut self, key: &str, value: &str) -> Result<()> {
        self.check_mutable()?;
        match self.env.get_mut(key) {
            Some(existing) => *existing = format!("{existing}:{}", value.trim()),
            None => {
                self.env.insert(key.to_string(), value.trim().to_string());
            }
        }
        Ok(())
    }

    fn prepend_env_path(&mut self, key: &str, value: &str) -> Result<()> {
        self.check_mutable()?;
        match self.env.get_mut(key) {
            Some(existing) => *existing = format!("{}:{existing}", value.trim()),
            None => {
                self.env.insert(key.to_string(), value.trim().to_string());
            }
        }
        Ok(())
    }

    fn env_value(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }
}
