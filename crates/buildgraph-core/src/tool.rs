//! Tools: named, versioned external dependencies bound into sandboxes.
//!
//! A tool is identified by `(vendor, name)` and carries one or more
//! versions, exactly one of which is the default. The registry is owned by
//! the workflow; equality is by key, never by address, and actions are a
//! typed map populated at registration time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{BuildGraphError, Result};
use crate::invocation::Invocation;

/// Marker vendor for tools with no associated vendor.
pub const NO_VENDOR: &str = "n/a";

/// Placeholder roots substituted for the context tool areas when a version's
/// location is declared relative to the managed tool store.
pub const HOST_ROOT: &str = "/__tool_host_root__";
pub const CONT_ROOT: &str = "/__tool_cont_root__";

/// Identity of a tool: lowercased vendor and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolKey {
    pub vendor: String,
    pub name: String,
}

impl ToolKey {
    pub fn new(vendor: &str, name: &str) -> Self {
        Self {
            vendor: vendor.trim().to_lowercase(),
            name: name.trim().to_lowercase(),
        }
    }

    /// A tool with no vendor.
    pub fn bare(name: &str) -> Self {
        Self::new(NO_VENDOR, name)
    }

    /// Flat identifier used for sandbox registration and tool handles.
    pub fn base_id(&self) -> String {
        if self.vendor == NO_VENDOR {
            self.name.clone()
        } else {
            format!("{}_{}", self.vendor, self.name)
        }
    }
}

impl fmt::Display for ToolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_id())
    }
}

/// Identity of a specific tool version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionKey {
    pub tool: ToolKey,
    pub version: String,
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.tool.base_id(), self.version)
    }
}

/// A requirement on another tool, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq)]
pub struct Require {
    pub tool: ToolKey,
    pub version: Option<String>,
}

impl Require {
    pub fn new(tool: ToolKey) -> Self {
        Self { tool, version: None }
    }

    pub fn pinned(tool: ToolKey, version: impl Into<String>) -> Self {
        Self {
            tool,
            version: Some(version.into()),
        }
    }
}

/// An environment value declared by a tool version. Paths are translated to
/// the version's container location when overlaid.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEnv {
    Literal(String),
    ToolPath(PathBuf),
}

/// One version of a tool.
#[derive(Debug, Clone)]
pub struct Version {
    pub key: ToolKey,
    pub version: String,
    pub location: PathBuf,
    pub env: BTreeMap<String, ToolEnv>,
    pub paths: BTreeMap<String, Vec<PathBuf>>,
    pub requires: Vec<Require>,
    pub default: bool,
}

impl Version {
    pub fn new(version: impl Into<String>, location: impl Into<PathBuf>) -> Self {
        Self {
            key: ToolKey::bare("unregistered"),
            version: version.into(),
            location: location.into(),
            env: BTreeMap::new(),
            paths: BTreeMap::new(),
            requires: Vec::new(),
            default: false,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: ToolEnv) -> Self {
        self.env.insert(key.into(), value);
        self
    }

    pub fn with_path(mut self, key: impl Into<String>, segments: Vec<PathBuf>) -> Self {
        self.paths.insert(key.into(), segments);
        self
    }

    pub fn with_require(mut self, require: Require) -> Self {
        self.requires.push(require);
        self
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn version_key(&self) -> VersionKey {
        VersionKey {
            tool: self.key.clone(),
            version: self.version.clone(),
        }
    }

    /// The per-version directory below the tool store.
    pub fn path_chunk(&self) -> PathBuf {
        if self.key.vendor == NO_VENDOR {
            PathBuf::from(&self.key.name).join(&self.version)
        } else {
            PathBuf::from(&self.key.vendor)
                .join(&self.key.name)
                .join(&self.version)
        }
    }

    /// The tool's location on the host, substituting the host placeholder
    /// root for the context's managed tool store.
    pub fn host_path(&self, ctx: &Context) -> PathBuf {
        match self.location.strip_prefix(HOST_ROOT) {
            Ok(relative) => ctx.host_tools.join(relative),
            Err(_) => self.location.clone(),
        }
    }

    /// The tool's root inside a sandbox.
    pub fn container_path(&self, ctx: &Context) -> PathBuf {
        ctx.container_tools.join(self.path_chunk())
    }

    /// Resolve a path declared relative to the container placeholder root
    /// against this version's sandbox location.
    pub fn container_subpath(&self, ctx: &Context, path: &Path) -> PathBuf {
        match path.strip_prefix(CONT_ROOT) {
            Ok(relative) => self.container_path(ctx).join(relative),
            Err(_) => path.to_path_buf(),
        }
    }
}

/// An action registered against a tool: builds an invocation from the
/// context, the active version, and caller arguments.
pub type ActionFn =
    Arc<dyn Fn(&Context, &Version, &[ActionArg]) -> Result<Invocation> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum ActionArg {
    Str(String),
    Path(PathBuf),
}

/// A tool definition: versions plus registered actions.
pub struct Tool {
    key: ToolKey,
    versions: Vec<Version>,
    actions: BTreeMap<String, ActionFn>,
}

impl Tool {
    /// Validate and construct a tool. A single version is implicitly the
    /// default; with several, exactly one must be marked and version strings
    /// must be unique.
    pub fn new(vendor: Option<&str>, name: &str, mut versions: Vec<Version>) -> Result<Self> {
        let key = match vendor {
            Some(vendor) => ToolKey::new(vendor, name),
            None => ToolKey::bare(name),
        };
        if versions.is_empty() {
            return Err(BuildGraphError::Config(format!(
                "tool {key} must declare at least one version"
            )));
        }
        for version in versions.iter_mut() {
            if version.version.trim().is_empty() {
                return Err(BuildGraphError::Config(format!(
                    "a version string must be specified for tool {key}"
                )));
            }
            version.key = key.clone();
        }
        if versions.len() == 1 {
            versions[0].default = true;
        } else {
            let mut seen = Vec::new();
            let mut defaults = 0;
            for version in &versions {
                if seen.contains(&&version.version) {
                    return Err(BuildGraphError::Config(format!(
                        "duplicate version {} for tool {key}",
                        version.version
                    )));
                }
                seen.push(&version.version);
                if version.default {
                    defaults += 1;
                }
            }
            if defaults != 1 {
                return Err(BuildGraphError::Config(format!(
                    "tool {key} must mark exactly one version as default, found {defaults}"
                )));
            }
        }
        Ok(Self {
            key,
            versions,
            actions: BTreeMap::new(),
        })
    }

    pub fn with_action(mut self, name: &str, action: ActionFn) -> Result<Self> {
        let name = name.to_lowercase();
        if self.actions.contains_key(&name) {
            return Err(BuildGraphError::Config(format!(
                "an action called '{name}' is already registered to tool {}",
                self.key
            )));
        }
        self.actions.insert(name, action);
        Ok(self)
    }

    pub fn key(&self) -> &ToolKey {
        &self.key
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn default_version(&self) -> &Version {
        self.versions
            .iter()
            .find(|version| version.default)
            .expect("validated at construction")
    }

    pub fn get_version(&self, version: &str) -> Option<&Version> {
        self.versions.iter().find(|v| v.version == version)
    }

    pub fn action(&self, name: &str) -> Result<ActionFn> {
        self.actions
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                BuildGraphError::Tool(format!(
                    "no action '{name}' registered for tool {}",
                    self.key
                ))
            })
    }
}

/// The lookup `(vendor, name) -> Tool`, owned by the workflow.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<ToolKey, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) -> Result<()> {
        let key = tool.key().clone();
        if self.tools.contains_key(&key) {
            return Err(BuildGraphError::Config(format!(
                "a tool is already registered for {key}"
            )));
        }
        self.tools.insert(key, tool);
        Ok(())
    }

    pub fn get(&self, key: &ToolKey) -> Result<&Tool> {
        self.tools.get(key).ok_or_else(|| {
            BuildGraphError::Tool(format!("no tool registered for {key}"))
        })
    }

    pub fn default_version(&self, key: &ToolKey) -> Result<&Version> {
        Ok(self.get(key)?.default_version())
    }

    pub fn version(&self, key: &VersionKey) -> Result<&Version> {
        self.get(&key.tool)?
            .get_version(&key.version)
            .ok_or_else(|| {
                BuildGraphError::Tool(format!(
                    "no version {} known for tool {}",
                    key.version, key.tool
                ))
            })
    }

    pub fn resolve(&self, require: &Require) -> Result<&Version> {
        let tool = self.get(&require.tool)?;
        match &require.version {
            Some(version) => tool.get_version(version).ok_or_else(|| {
                BuildGraphError::Tool(format!(
                    "could not resolve version {version} for {}",
                    require.tool
                ))
            }),
            None => Ok(tool.default_version()),
        }
    }

    /// Override a tool's nominated default version.
    pub fn select_version(&mut self, key: &ToolKey, version: &str) -> Result<()> {
        let tool = self.tools.get_mut(key).ok_or_else(|| {
            BuildGraphError::Tool(format!("no tool registered for {key}"))
        })?;
        if tool.get_version(version).is_none() {
            return Err(BuildGraphError::Tool(format!(
                "no version {version} known for tool {key}"
            )));
        }
        for entry in tool.versions.iter_mut() {
            entry.default = entry.version == version;
        }
        Ok(())
    }

    pub fn action(&self, key: &ToolKey, name: &str) -> Result<ActionFn> {
        self.get(key)?.action(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_version_tool() -> Tool {
        Tool::new(
            Some("Acme"),
            "Widget",
            vec![
                Version::new("1.0", "/opt/widget/1.0"),
                Version::new("2.0", "/opt/widget/2.0").as_default(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn keys_are_lowercased() {
        let tool = two_version_tool();
        assert_eq!(tool.key(), &ToolKey::new("acme", "widget"));
        assert_eq!(tool.key().base_id(), "acme_widget");
        assert_eq!(ToolKey::bare("Bash").base_id(), "bash");
    }

    #[test]
    fn single_version_is_implicit_default() {
        let tool = Tool::new(None, "solo", vec![Version::new("0.1", "/opt/solo")]).unwrap();
        assert_eq!(tool.default_version().version, "0.1");
    }

    #[test]
    fn duplicate_or_ambiguous_defaults_are_rejected() {
        assert!(Tool::new(
            None,
            "dup",
            vec![
                Version::new("1.0", "/a").as_default(),
                Version::new("1.0", "/b"),
            ],
        )
        .is_err());

        assert!(Tool::new(
            None,
            "nodefault",
            vec![Version::new("1.0", "/a"), Version::new("2.0", "/b")],
        )
        .is_err());

        assert!(Tool::new(
            None,
            "twodefaults",
            vec![
                Version::new("1.0", "/a").as_default(),
                Version::new("2.0", "/b").as_default(),
            ],
        )
        .is_err());
    }

    #[test]
    fn placeholder_roots_are_substituted() {
        let ctx = Context::new("demo", "/work/demo");
        let tool = Tool::new(
            None,
            "widget",
            vec![Version::new("1.0", PathBuf::from(HOST_ROOT).join("widget/1.0"))],
        )
        .unwrap();
        let version = tool.default_version();
        assert_eq!(
            version.host_path(&ctx),
            PathBuf::from("/work/demo/tools/widget/1.0")
        );
        assert_eq!(
            version.container_path(&ctx),
            PathBuf::from("/tools/widget/1.0")
        );
        assert_eq!(
            version.container_subpath(&ctx, &PathBuf::from(CONT_ROOT).join("bin/widget")),
            PathBuf::from("/tools/widget/1.0/bin/widget")
        );
        assert_eq!(
            version.container_subpath(&ctx, Path::new("/usr/bin/widget")),
            PathBuf::from("/usr/bin/widget")
        );
    }

    #[test]
    fn actions_are_a_typed_map() {
        use crate::invocation::Executable;

        let tool = Tool::new(None, "widget", vec![Version::new("1.0", "/opt/widget")])
            .unwrap()
            .with_action(
                "lint",
                Arc::new(|_ctx, version, args| {
                    let mut invocation =
                        Invocation::new(version, Executable::Name("widget-lint".to_string()));
                    for arg in args {
                        invocation = match arg {
                            ActionArg::Str(text) => invocation.arg(text.clone()),
                            ActionArg::Path(path) => invocation.arg(path.clone()),
                        };
                    }
                    Ok(invocation)
                }),
            )
            .unwrap();

        // Duplicate action names are rejected.
        assert!(tool
            .with_action("LINT", Arc::new(|_, _, _| unreachable!()))
            .is_err());
    }

    #[test]
    fn registered_actions_build_invocations() {
        let ctx = Context::new("demo", "/work/demo");
        let mut registry = ToolRegistry::new();
        registry
            .register(
                Tool::new(None, "widget", vec![Version::new("1.0", "/opt/widget")])
                    .unwrap()
                    .with_action(
                        "lint",
                        Arc::new(|_ctx, version, _args| {
                            Ok(Invocation::new(
                                version,
                                crate::invocation::Executable::Name("widget-lint".to_string()),
                            ))
                        }),
                    )
                    .unwrap(),
            )
            .unwrap();

        let key = ToolKey::bare("widget");
        let action = registry.action(&key, "Lint").unwrap();
        let version = registry.default_version(&key).unwrap();
        let invocation = (action.as_ref())(&ctx, version, &[]).unwrap();
        assert_eq!(invocation.tool, version.version_key());
        assert!(registry.action(&key, "format").is_err());
    }

    #[test]
    fn registry_resolves_versions_and_overrides() {
        let mut registry = ToolRegistry::new();
        registry.register(two_version_tool()).unwrap();
        let key = ToolKey::new("acme", "widget");

        assert_eq!(registry.default_version(&key).unwrap().version, "2.0");
        registry.select_version(&key, "1.0").unwrap();
        assert_eq!(registry.default_version(&key).unwrap().version, "1.0");
        assert!(registry.select_version(&key, "9.9").is_err());

        let pinned = Require::pinned(key.clone(), "2.0");
        assert_eq!(registry.resolve(&pinned).unwrap().version, "2.0");
        assert!(registry
            .resolve(&Require::new(ToolKey::bare("missing")))
            .is_err());
    }
}
