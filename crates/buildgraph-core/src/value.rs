//! The typed values that flow between transforms.
//!
//! A [`Value`] is the serialized interface form: a closed sum of constants,
//! collections, paths and environment bindings. The serde representation is
//! the stable on-disk format (`{"typ": "path", ...}` and friends), so a
//! serialized transform can be rehydrated by a remote worker with no ambient
//! state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::context::Context;
use crate::error::{BuildGraphError, Result};
use crate::paths::{normalize_path, resolve_lenient, resolve_strict};

/// Whether an interface acts as an input-to or output-from a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn is_input(self) -> bool {
        self == Direction::Input
    }

    pub fn is_output(self) -> bool {
        self == Direction::Output
    }
}

/// Behaviour when an environment variable is already set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvPolicy {
    /// Append to the existing value with a `:` separator.
    Append,
    /// Prepend to the existing value with a `:` separator. A list of values
    /// `[a, b, c]` therefore lands as `c:b:a`.
    Prepend,
    /// Replace the existing value. A list collapses to its last element.
    Replace,
    /// The default: error if the variable is already set to something else.
    Conflict,
}

impl fmt::Display for EnvPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvPolicy::Append => "APPEND",
            EnvPolicy::Prepend => "PREPEND",
            EnvPolicy::Replace => "REPLACE",
            EnvPolicy::Conflict => "CONFLICT",
        };
        write!(f, "{name}")
    }
}

/// Sink for the path and environment side effects of value resolution. The
/// sandbox implements this; resolution stays independent of any concrete
/// container runtime.
pub trait BindSink {
    /// Bind a host path into the sandbox, returning the container-side path.
    fn bind(&mut self, host: &Path, cont: &Path, readonly: bool, mkdir: bool) -> Result<PathBuf>;

    fn set_env(&mut self, key: &str, value: &str) -> Result<()>;

    fn append_env_path(&mut self, key: &str, value: &str) -> Result<()>;

    fn prepend_env_path(&mut self, key: &str, value: &str) -> Result<()>;

    fn env_value(&self, key: &str) -> Option<String>;
}

/// A typed interface value in its serialized (on-disk) form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typ", rename_all = "lowercase")]
pub enum Value {
    Const {
        val: serde_json::Value,
    },
    List {
        val: Vec<Value>,
    },
    Dict {
        val: BTreeMap<String, Value>,
    },
    Path {
        host: Option<String>,
        cont: Option<String>,
        is_dir: bool,
    },
    Env {
        key: String,
        val: Box<Value>,
        policy: EnvPolicy,
        wrap: bool,
    },
}

impl Value {
    /// A constant leaf (string, integer, float, bool or null).
    pub fn constant(val: impl Into<serde_json::Value>) -> Self {
        Value::Const { val: val.into() }
    }

    /// An ordered sequence. Downgraded to a single constant when every
    /// element is constant, keeping pure-constant payloads compact.
    pub fn list(items: Vec<Value>) -> Self {
        if items.iter().all(|item| matches!(item, Value::Const { .. })) {
            let payload = items
                .into_iter()
                .map(|item| match item {
                    Value::Const { val } => val,
                    _ => unreachable!("checked const above"),
                })
                .collect();
            return Value::Const {
                val: serde_json::Value::Array(payload),
            };
        }
        Value::List { val: items }
    }

    /// A string-keyed map, with the same constant downgrade rule as lists.
    pub fn dict(entries: BTreeMap<String, Value>) -> Self {
        if entries
            .values()
            .all(|item| matches!(item, Value::Const { .. }))
        {
            let payload = entries
                .into_iter()
                .map(|(key, item)| match item {
                    Value::Const { val } => (key, val),
                    _ => unreachable!("checked const above"),
                })
                .collect::<serde_json::Map<_, _>>();
            return Value::Const {
                val: serde_json::Value::Object(payload),
            };
        }
        Value::Dict { val: entries }
    }

    /// A host path (file by default).
    pub fn path(host: impl Into<PathBuf>) -> Result<Self> {
        Self::path_spec(Some(host.into()), None, false)
    }

    /// A host directory path.
    pub fn dir(host: impl Into<PathBuf>) -> Result<Self> {
        Self::path_spec(Some(host.into()), None, true)
    }

    /// A path with explicit host and/or container sides. At least one side
    /// must be given; both must be absolute. Host-side symlinks are resolved
    /// where possible so the bound path is the real location.
    pub fn path_spec(
        host: Option<PathBuf>,
        cont: Option<PathBuf>,
        is_dir: bool,
    ) -> Result<Self> {
        if host.is_none() && cont.is_none() {
            return Err(BuildGraphError::Interface(
                "both host path and container path cannot be none".to_string(),
            ));
        }
        let host = host
            .map(|path| {
                if !path.is_absolute() {
                    return Err(BuildGraphError::Interface(format!(
                        "interface paths must be absolute, got `{}`",
                        path.display()
                    )));
                }
                Ok(resolve_lenient(&path).to_string_lossy().into_owned())
            })
            .transpose()?;
        let cont = cont
            .map(|path| {
                if !path.is_absolute() {
                    return Err(BuildGraphError::Interface(format!(
                        "interface paths must be absolute, got `{}`",
                        path.display()
                    )));
                }
                Ok(normalize_path(&path).to_string_lossy().into_owned())
            })
            .transpose()?;
        Ok(Value::Path { host, cont, is_dir })
    }

    /// An environment binding exposing `val` as `$key`.
    pub fn env(key: impl Into<String>, val: Value, policy: EnvPolicy) -> Self {
        Self::env_with(key, val, policy, true)
    }

    pub fn env_with(
        key: impl Into<String>,
        val: Value,
        policy: EnvPolicy,
        wrap: bool,
    ) -> Self {
        Value::Env {
            key: key.into(),
            val: Box::new(val),
            policy,
            wrap,
        }
    }

    /// Collect the medial identities this value references. Only host-side
    /// paths flow between transforms, so only they contribute.
    pub fn walk_medials(&self, out: &mut Vec<String>) {
        match self {
            Value::Const { .. } => {}
            Value::List { val } => {
                for item in val {
                    item.walk_medials(out);
                }
            }
            Value::Dict { val } => {
                for item in val.values() {
                    item.walk_medials(out);
                }
            }
            Value::Path { host: Some(host), .. } => out.push(host.clone()),
            Value::Path { .. } => {}
            Value::Env { val, .. } => val.walk_medials(out),
        }
    }

    /// Collect the tokens that contribute to an input hash. Path literals are
    /// omitted (only their shape survives): scratch locations differ between
    /// hosts and must not perturb cache keys.
    pub fn walk_hashable(&self, out: &mut Vec<serde_json::Value>) {
        match self {
            Value::Const { val } => out.push(json!({"typ": "const", "val": val})),
            Value::List { val } => {
                for item in val {
                    item.walk_hashable(out);
                }
                out.push(json!({"typ": "list", "val": null}));
            }
            Value::Dict { val } => {
                for item in val.values() {
                    item.walk_hashable(out);
                }
                out.push(json!({"typ": "dict", "val": null}));
            }
            Value::Path { host, cont, is_dir } => {
                out.push(json!({
                    "typ": "path",
                    "host": host.is_some(),
                    "cont": cont.is_some(),
                    "is_dir": is_dir,
                }));
            }
            Value::Env {
                key,
                val,
                policy,
                wrap,
            } => {
                val.walk_hashable(out);
                out.push(json!({
                    "typ": "env",
                    "key": key,
                    "val": null,
                    "policy": policy.to_string(),
                    "wrap": wrap,
                }));
            }
        }
    }

    /// Resolve this value against a sandbox, binding paths and applying
    /// environment policies, and return the concrete value visible to the
    /// transform's execute routine.
    pub fn resolve(
        &self,
        ctx: &Context,
        sink: &mut dyn BindSink,
        direction: Direction,
    ) -> Result<Resolved> {
        match self {
            Value::Const { val } => Ok(Resolved::Const(val.clone())),
            Value::List { val } => {
                let items = val
                    .iter()
                    .map(|item| item.resolve(ctx, sink, direction))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Resolved::List(items))
            }
            Value::Dict { val } => {
                let items = val
                    .iter()
                    .map(|(key, item)| {
                        Ok((key.clone(), item.resolve(ctx, sink, direction)?))
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Ok(Resolved::Dict(items))
            }
            Value::Path { host, cont, is_dir } => {
                resolve_path(ctx, sink, direction, host.as_deref(), cont.as_deref(), *is_dir)
            }
            Value::Env {
                key,
                val,
                policy,
                wrap,
            } => {
                let inner = val.resolve(ctx, sink, direction)?;
                apply_env(sink, key, &inner, *policy)?;
                if *wrap {
                    Ok(Resolved::Env {
                        key: key.clone(),
                        value: Box::new(inner),
                    })
                } else {
                    Ok(inner)
                }
            }
        }
    }
}

fn resolve_path(
    ctx: &Context,
    sink: &mut dyn BindSink,
    direction: Direction,
    host: Option<&str>,
    cont: Option<&str>,
    is_dir: bool,
) -> Result<Resolved> {
    let Some(host) = host else {
        let cont = cont.ok_or_else(|| {
            BuildGraphError::Interface(
                "both host path and container path cannot be none".to_string(),
            )
        })?;
        // Container-only paths are exposed as-is; a parent bind is expected
        // to make them reachable.
        return Ok(Resolved::Path(PathBuf::from(cont)));
    };

    let host_path = Path::new(host);
    let resolved = if direction.is_input() {
        resolve_strict(host_path).map_err(|error| {
            BuildGraphError::Interface(format!(
                "could not resolve input host path `{host}`: {error}"
            ))
        })?
    } else {
        resolve_lenient(host_path)
    };

    let cont_path = match cont {
        Some(cont) => PathBuf::from(cont),
        None => ctx.map_to_container(host_path)?,
    };

    let readonly = direction.is_input();
    if is_dir {
        sink.bind(&resolved, &cont_path, readonly, true)?;
    } else {
        let host_parent = resolved.parent().ok_or_else(|| {
            BuildGraphError::Interface(format!("path `{host}` has no parent directory"))
        })?;
        let cont_parent = cont_path.parent().ok_or_else(|| {
            BuildGraphError::Interface(format!(
                "container path `{}` has no parent directory",
                cont_path.display()
            ))
        })?;
        sink.bind(host_parent, cont_parent, readonly, true)?;
    }
    Ok(Resolved::Path(cont_path))
}

fn apply_env(
    sink: &mut dyn BindSink,
    key: &str,
    value: &Resolved,
    policy: EnvPolicy,
) -> Result<()> {
    // Constant lists downgrade to a single Const holding an array, so both
    // shapes must be walked element-wise here.
    let items: Vec<Resolved> = match value {
        Resolved::List(items) => items.clone(),
        Resolved::Const(serde_json::Value::Array(items)) => {
            items.iter().cloned().map(Resolved::Const).collect()
        }
        other => vec![other.clone()],
    };
    for item in items {
        if matches!(item, Resolved::Const(serde_json::Value::Null)) {
            continue;
        }
        let text = item.to_env_string()?;
        match policy {
            EnvPolicy::Append => sink.append_env_path(key, &text)?,
            EnvPolicy::Prepend => sink.prepend_env_path(key, &text)?,
            EnvPolicy::Replace => sink.set_env(key, &text)?,
            EnvPolicy::Conflict => {
                if let Some(current) = sink.env_value(key) {
                    if current != text {
                        return Err(BuildGraphError::Interface(format!(
                            "cannot set `${key}` to `{text}` as it is already \
                             set to `{current}` and the policy is CONFLICT"
                        )));
                    }
                }
                sink.set_env(key, &text)?;
            }
        }
    }
    Ok(())
}

/// A value resolved against a sandbox: what execute routines actually see.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Const(serde_json::Value),
    List(Vec<Resolved>),
    Dict(BTreeMap<String, Resolved>),
    Path(PathBuf),
    Env { key: String, value: Box<Resolved> },
}

impl Resolved {
    pub fn as_path(&self) -> Result<&Path> {
        match self {
            Resolved::Path(path) => Ok(path),
            other => Err(BuildGraphError::Interface(format!(
                "expected a path value, got {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Resolved::Const(serde_json::Value::String(text)) => Ok(text),
            other => Err(BuildGraphError::Interface(format!(
                "expected a string value, got {other:?}"
            ))),
        }
    }

    pub fn as_list(&self) -> Result<&[Resolved]> {
        match self {
            Resolved::List(items) => Ok(items),
            other => Err(BuildGraphError::Interface(format!(
                "expected a list value, got {other:?}"
            ))),
        }
    }

    /// The string form used when exposing the value in an environment
    /// variable.
    pub fn to_env_string(&self) -> Result<String> {
        match self {
            Resolved::Const(serde_json::Value::String(text)) => Ok(text.clone()),
            Resolved::Const(serde_json::Value::Number(number)) => Ok(number.to_string()),
            Resolved::Const(serde_json::Value::Bool(flag)) => Ok(flag.to_string()),
            Resolved::Path(path) => Ok(path.to_string_lossy().into_owned()),
            Resolved::Env { value, .. } => value.to_env_string(),
            other => Err(BuildGraphError::Interface(format!(
                "value {other:?} cannot be exposed as an environment variable"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        binds: Vec<(PathBuf, PathBuf, bool)>,
        env: BTreeMap<String, String>,
    }

    impl BindSink for RecordingSink {
        fn bind(
            &mut self,
            host: &Path,
            cont: &Path,
            readonly: bool,
            _mkdir: bool,
        ) -> Result<PathBuf> {
            self.binds.push((host.to_path_buf(), cont.to_path_buf(), readonly));
            Ok(cont.to_path_buf())
        }

        fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
            self.env.insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn append_env_path(&mut self, key: &str, value: &str) -> Result<()> {
            match self.env.get_mut(key) {
                Some(current) => *current = format!("{current}:{value}"),
                None => {
                    self.env.insert(key.to_string(), value.to_string());
                }
            }
            Ok(())
        }

        fn prepend_env_path(&mut self, key: &str, value: &str) -> Result<()> {
            match self.env.get_mut(key) {
                Some(current) => *current = format!("{value}:{current}"),
                None => {
                    self.env.insert(key.to_string(), value.to_string());
                }
            }
            Ok(())
        }

        fn env_value(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }
    }

    #[test]
    fn constant_list_downgrades() {
        let value = Value::list(vec![Value::constant(1), Value::constant("x")]);
        assert!(matches!(value, Value::Const { .. }));
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, serde_json::json!({"typ": "const", "val": [1, "x"]}));
    }

    #[test]
    fn mixed_list_stays_a_list() {
        let value = Value::list(vec![
            Value::constant(1),
            Value::path_spec(None, Some(PathBuf::from("/data")), false).unwrap(),
        ]);
        assert!(matches!(value, Value::List { .. }));
    }

    #[test]
    fn serialized_form_round_trips() {
        let value = Value::env(
            "TOOL_HOME",
            Value::path_spec(None, Some(PathBuf::from("/tools/demo")), true).unwrap(),
            EnvPolicy::Prepend,
        );
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["typ"], "env");
        assert_eq!(json["policy"], "PREPEND");
        assert_eq!(json["val"]["typ"], "path");
        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(Value::path("relative/path").is_err());
        assert!(Value::path_spec(None, Some(PathBuf::from("rel")), false).is_err());
        assert!(Value::path_spec(None, None, false).is_err());
    }

    #[test]
    fn hashable_tokens_omit_path_literals() {
        let dir = tempfile::tempdir().unwrap();
        let value = Value::path(dir.path().join("out.bin")).unwrap();
        let mut tokens = Vec::new();
        value.walk_hashable(&mut tokens);
        assert_eq!(tokens.len(), 1);
        assert_eq!(
            tokens[0],
            serde_json::json!({"typ": "path", "host": true, "cont": false, "is_dir": false})
        );

        // Two different locations with the same shape hash identically.
        let other = Value::path(dir.path().join("elsewhere.bin")).unwrap();
        let mut other_tokens = Vec::new();
        other.walk_hashable(&mut other_tokens);
        assert_eq!(tokens, other_tokens);
    }

    #[test]
    fn medials_are_the_host_paths() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("a.txt");
        let value = Value::list(vec![
            Value::path(&host).unwrap(),
            Value::path_spec(None, Some(PathBuf::from("/cont/only")), false).unwrap(),
        ]);
        let mut medials = Vec::new();
        value.walk_medials(&mut medials);
        assert_eq!(medials, vec![host.to_string_lossy().into_owned()]);
    }

    #[test]
    fn input_paths_bind_parent_readonly() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("in.txt");
        std::fs::write(&file, "x").unwrap();
        let ctx = Context::new("demo", dir.path());
        let value = Value::path(&file).unwrap();

        let mut sink = RecordingSink::default();
        let resolved = value.resolve(&ctx, &mut sink, Direction::Input).unwrap();
        let cont = ctx.map_to_container(&file).unwrap();
        assert_eq!(resolved, Resolved::Path(cont.clone()));
        assert_eq!(sink.binds.len(), 1);
        assert_eq!(sink.binds[0].1, cont.parent().unwrap());
        assert!(sink.binds[0].2, "input binds must be readonly");
    }

    #[test]
    fn missing_input_path_fails_to_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new("demo", dir.path());
        let value = Value::path(dir.path().join("missing.txt")).unwrap();
        let mut sink = RecordingSink::default();
        assert!(value.resolve(&ctx, &mut sink, Direction::Input).is_err());
        // The same value resolves fine as an output.
        assert!(value.resolve(&ctx, &mut sink, Direction::Output).is_ok());
    }

    #[test]
    fn env_conflict_policy_rejects_differing_values() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new("demo", dir.path());
        let value = Value::env("MODE", Value::constant("fast"), EnvPolicy::Conflict);

        let mut sink = RecordingSink::default();
        sink.env.insert("MODE".to_string(), "slow".to_string());
        assert!(value.resolve(&ctx, &mut sink, Direction::Input).is_err());

        sink.env.insert("MODE".to_string(), "fast".to_string());
        let resolved = value.resolve(&ctx, &mut sink, Direction::Input).unwrap();
        assert!(matches!(resolved, Resolved::Env { .. }));
    }

    #[test]
    fn env_list_prepend_reverses() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new("demo", dir.path());
        // Downgrades to a constant array, which must still be walked
        // element-wise when applied to the environment.
        let value = Value::env_with(
            "ORDER",
            Value::list(vec![
                Value::constant("a"),
                Value::constant("b"),
                Value::constant("c"),
            ]),
            EnvPolicy::Prepend,
            false,
        );
        let mut sink = RecordingSink::default();
        value.resolve(&ctx, &mut sink, Direction::Input).unwrap();
        assert_eq!(sink.env["ORDER"], "c:b:a");
    }
}
