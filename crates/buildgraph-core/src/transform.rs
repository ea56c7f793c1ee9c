//! Transforms: declarative units of work with typed input and output fields.
//!
//! A [`TransformDef`] is the reusable definition: its field descriptors, the
//! tools it needs, and its execute routine. Definitions are registered
//! explicitly at startup in a [`TransformRegistry`] keyed by `(module, name)`
//! so a serialized transform can be rehydrated anywhere with no ambient
//! state. A [`Transform`] is one immutable instance: every field resolved to
//! an interface specification at construction.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{BuildGraphError, Result};
use crate::iface::IfaceSpec;
use crate::invocation::Invocation;
use crate::tool::{ToolKey, Version};
use crate::value::{Direction, EnvPolicy, Resolved, Value};

/// The static type of a transform field, consulted when no value and no
/// default is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Const,
    List,
    Dict,
    Path,
    Env,
}

/// Factory used for defaults that must be built per instance.
pub type DefaultFactory = Arc<dyn Fn() -> Value + Send + Sync>;

/// One declared field of a transform definition.
#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    pub direction: Direction,
    pub field_type: FieldType,
    pub default: Option<Value>,
    pub default_factory: Option<DefaultFactory>,
    pub env: Option<String>,
    pub env_policy: EnvPolicy,
}

impl std::fmt::Debug for FieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("field_type", &self.field_type)
            .field("default", &self.default)
            .field("default_factory", &self.default_factory.as_ref().map(|_| "<fn>"))
            .field("env", &self.env)
            .field("env_policy", &self.env_policy)
            .finish()
    }
}

impl FieldDef {
    pub fn input(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, Direction::Input, field_type)
    }

    pub fn output(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, Direction::Output, field_type)
    }

    fn new(name: impl Into<String>, direction: Direction, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            direction,
            field_type,
            default: None,
            default_factory: None,
            env: None,
            env_policy: EnvPolicy::Conflict,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_default_factory(mut self, factory: DefaultFactory) -> Self {
        self.default_factory = Some(factory);
        self
    }

    /// Additionally expose the field as an environment variable.
    pub fn with_env(mut self, key: impl Into<String>) -> Self {
        self.env = Some(key.into());
        self
    }

    pub fn with_env_policy(mut self, policy: EnvPolicy) -> Self {
        self.env_policy = policy;
        self
    }
}

/// Everything an execute routine can see: the context, the resolved field
/// values, and handles to the transform's tools.
pub struct ExecuteCtx<'a> {
    pub ctx: &'a Context,
    pub io: &'a ResolvedIo,
    pub tools: &'a ToolHandles,
}

/// The execute routine of a transform definition: yields the invocations to
/// dispatch, in order.
pub type ExecuteFn =
    Arc<dyn Fn(&ExecuteCtx<'_>) -> Result<Vec<Invocation>> + Send + Sync>;

/// A transform definition: the declarative "class" a transform instance is
/// built from.
pub struct TransformDef {
    pub module: String,
    pub name: String,
    pub fields: Vec<FieldDef>,
    pub tools: Vec<ToolKey>,
    pub execute: ExecuteFn,
}

impl std::fmt::Debug for TransformDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformDef")
            .field("module", &self.module)
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("tools", &self.tools)
            .finish_non_exhaustive()
    }
}

impl TransformDef {
    pub fn new(
        module: impl Into<String>,
        name: impl Into<String>,
        fields: Vec<FieldDef>,
        tools: Vec<ToolKey>,
        execute: ExecuteFn,
    ) -> Result<Self> {
        let module = module.into();
        let name = name.into();
        let mut seen: Vec<&str> = Vec::new();
        for field in &fields {
            if seen.contains(&field.name.as_str()) {
                return Err(BuildGraphError::Config(format!(
                    "transform {module}::{name} declares field `{}` twice",
                    field.name
                )));
            }
            seen.push(&field.name);
            if field.direction.is_output() && field.env.is_some() {
                return Err(BuildGraphError::Config(format!(
                    "transform {module}::{name} field `{}`: env bindings are \
                     only valid on input interfaces",
                    field.name
                )));
            }
            if field.default.is_some() && field.default_factory.is_some() {
                return Err(BuildGraphError::Config(format!(
                    "transform {module}::{name} field `{}`: one of default and \
                     default_factory may be set, but not both",
                    field.name
                )));
            }
        }
        Ok(Self {
            module,
            name,
            fields,
            tools,
            execute,
        })
    }

    fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }
}

/// Explicit startup registration of transform definitions, keyed by
/// `(module, name)`.
#[derive(Default)]
pub struct TransformRegistry {
    defs: HashMap<(String, String), Arc<TransformDef>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: TransformDef) -> Result<Arc<TransformDef>> {
        let key = (def.module.clone(), def.name.clone());
        if self.defs.contains_key(&key) {
            return Err(BuildGraphError::Config(format!(
                "a transform is already registered for {}::{}",
                key.0, key.1
            )));
        }
        let def = Arc::new(def);
        self.defs.insert(key, def.clone());
        Ok(def)
    }

    pub fn get(&self, module: &str, name: &str) -> Result<Arc<TransformDef>> {
        self.defs
            .get(&(module.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| {
                BuildGraphError::Config(format!(
                    "no transform registered for {module}::{name}"
                ))
            })
    }
}

/// One field of a transform instance: its name, direction, and serialized
/// interface.
#[derive(Debug, Clone)]
pub struct IfaceEntry {
    pub name: String,
    pub direction: Direction,
    pub spec: IfaceSpec,
}

/// A named, immutable transform instance. Field order follows the
/// definition's declaration order, which the input hash depends on.
#[derive(Debug, Clone)]
pub struct Transform {
    pub module: String,
    pub name: String,
    /// The configuration unit this transform belongs to (scratch-path
    /// derivation namespace).
    pub unit: String,
    /// Instance identity within the unit.
    pub ident: String,
    pub tools: Vec<ToolKey>,
    ifaces: Vec<IfaceEntry>,
}

impl Transform {
    /// Construct an instance, resolving every declared field: a supplied
    /// value wins, then the static default, then the default factory, then
    /// the per-type factory (empty list/dict, derived scratch path for
    /// output paths). Anything else is a configuration error.
    pub fn new(
        def: &TransformDef,
        ctx: &Context,
        unit: impl Into<String>,
        ident: impl Into<String>,
        mut values: BTreeMap<String, Value>,
    ) -> Result<Self> {
        let unit = unit.into();
        let ident = ident.into();
        let mut ifaces = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let value = match values.remove(&field.name) {
                Some(value) => value,
                None => default_value(def, field, ctx, &unit, &ident)?,
            };
            let value = match &field.env {
                Some(key) => Value::env_with(key, value, field.env_policy, false),
                None => value,
            };
            ifaces.push(IfaceEntry {
                name: field.name.clone(),
                direction: field.direction,
                spec: IfaceSpec::new(value),
            });
        }
        if let Some(unknown) = values.keys().next() {
            return Err(BuildGraphError::Config(format!(
                "transform {}::{} has no field `{unknown}`",
                def.module, def.name
            )));
        }
        Ok(Self {
            module: def.module.clone(),
            name: def.name.clone(),
            unit,
            ident,
            tools: def.tools.clone(),
            ifaces,
        })
    }

    pub fn ifaces(&self) -> impl Iterator<Item = &IfaceEntry> {
        self.ifaces.iter()
    }

    pub fn iface(&self, name: &str) -> Option<&IfaceEntry> {
        self.ifaces.iter().find(|entry| entry.name == name)
    }

    pub fn input_ifaces(&self) -> impl Iterator<Item = &IfaceEntry> {
        self.ifaces.iter().filter(|entry| entry.direction.is_input())
    }

    pub fn output_ifaces(&self) -> impl Iterator<Item = &IfaceEntry> {
        self.ifaces
            .iter()
            .filter(|entry| entry.direction.is_output())
    }

    /// Qualified label for logs and diagnostics.
    pub fn label(&self) -> String {
        if self.unit.is_empty() && self.ident.is_empty() {
            format!("{}::{}", self.module, self.name)
        } else {
            format!("{}::{} [{}:{}]", self.module, self.name, self.unit, self.ident)
        }
    }

    /// The stable on-disk form: enough for a remote worker to rehydrate the
    /// instance through its own registry.
    pub fn serialize(&self) -> TransformSpec {
        TransformSpec {
            module: self.module.clone(),
            name: self.name.clone(),
            ifaces: self
                .ifaces
                .iter()
                .map(|entry| (entry.name.clone(), entry.spec.value.clone()))
                .collect(),
        }
    }

    /// Rehydrate from a serialized spec, bypassing field resolution: the
    /// saved shapes already carry resolved values.
    pub fn deserialize(spec: TransformSpec, registry: &TransformRegistry) -> Result<Self> {
        let def = registry.get(&spec.module, &spec.name)?;
        let mut ifaces = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            let value = spec.ifaces.get(&field.name).cloned().ok_or_else(|| {
                BuildGraphError::Config(format!(
                    "serialized transform {}::{} is missing field `{}`",
                    spec.module, spec.name, field.name
                ))
            })?;
            ifaces.push(IfaceEntry {
                name: field.name.clone(),
                direction: field.direction,
                spec: IfaceSpec::new(value),
            });
        }
        for name in spec.ifaces.keys() {
            if def.field(name).is_none() {
                return Err(BuildGraphError::Config(format!(
                    "serialized transform {}::{} carries unknown field `{name}`",
                    spec.module, spec.name
                )));
            }
        }
        Ok(Self {
            module: spec.module,
            name: spec.name,
            unit: String::new(),
            ident: String::new(),
            tools: def.tools.clone(),
            ifaces,
        })
    }
}

fn default_value(
    def: &TransformDef,
    field: &FieldDef,
    ctx: &Context,
    unit: &str,
    ident: &str,
) -> Result<Value> {
    if let Some(default) = &field.default {
        return Ok(default.clone());
    }
    if let Some(factory) = &field.default_factory {
        return Ok((factory.as_ref())());
    }
    match field.field_type {
        FieldType::List => Ok(Value::list(Vec::new())),
        FieldType::Dict => Ok(Value::dict(BTreeMap::new())),
        FieldType::Path if field.direction.is_output() => {
            Value::path_spec(Some(ctx.scratch_path(unit, ident, &field.name)), None, false)
        }
        _ => Err(BuildGraphError::Config(format!(
            "cannot automatically default field `{}` of transform {}::{}",
            field.name, def.module, def.name
        ))),
    }
}

/// Serialized transform: `{mod, name, ifaces}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformSpec {
    #[serde(rename = "mod")]
    pub module: String,
    pub name: String,
    pub ifaces: BTreeMap<String, Value>,
}

/// The resolved field values handed to an execute routine.
#[derive(Debug, Default)]
pub struct ResolvedIo {
    values: BTreeMap<String, Resolved>,
}

impl ResolvedIo {
    pub fn new(values: BTreeMap<String, Resolved>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Result<&Resolved> {
        self.values.get(name).ok_or_else(|| {
            BuildGraphError::Execution(format!("no resolved value for field `{name}`"))
        })
    }

    pub fn path(&self, name: &str) -> Result<&Path> {
        self.get(name)?.as_path()
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        self.get(name)?.as_str()
    }

    pub fn list(&self, name: &str) -> Result<&[Resolved]> {
        self.get(name)?.as_list()
    }
}

/// Handles to the default versions of a transform's required tools, keyed by
/// base id.
#[derive(Default)]
pub struct ToolHandles {
    versions: BTreeMap<String, Version>,
}

impl ToolHandles {
    pub fn new(versions: BTreeMap<String, Version>) -> Self {
        Self { versions }
    }

    pub fn get(&self, base_id: &str) -> Result<&Version> {
        self.versions.get(base_id).ok_or_else(|| {
            BuildGraphError::Tool(format!(
                "tool `{base_id}` is not declared by this transform"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::Executable;

    fn noop_execute() -> ExecuteFn {
        Arc::new(|_| Ok(Vec::new()))
    }

    fn copy_def() -> TransformDef {
        TransformDef::new(
            "demo::transforms",
            "Copy",
            vec![
                FieldDef::input("frm", FieldType::Path),
                FieldDef::output("to", FieldType::Path),
                FieldDef::input("flags", FieldType::List),
            ],
            vec![ToolKey::bare("shell")],
            noop_execute(),
        )
        .unwrap()
    }

    fn test_ctx(dir: &Path) -> Context {
        Context::new("demo", dir)
    }

    #[test]
    fn fields_resolve_with_defaults_and_factories() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let frm = dir.path().join("input.txt");

        let def = copy_def();
        let transform = Transform::new(
            &def,
            &ctx,
            "top",
            "copy",
            BTreeMap::from([("frm".to_string(), Value::path(&frm).unwrap())]),
        )
        .unwrap();

        // The output path was derived from (unit, ident, field).
        let to = transform.iface("to").unwrap();
        assert!(to.direction.is_output());
        assert_eq!(
            to.spec.medials,
            vec![ctx
                .scratch_path("top", "copy", "to")
                .to_string_lossy()
                .into_owned()]
        );
        // The unset list field defaulted to empty.
        let flags = transform.iface("flags").unwrap();
        assert_eq!(flags.spec.value, Value::list(Vec::new()));
    }

    #[test]
    fn unset_input_path_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let def = copy_def();
        let error = Transform::new(&def, &ctx, "top", "copy", BTreeMap::new()).unwrap_err();
        assert!(matches!(error, BuildGraphError::Config(_)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let frm = dir.path().join("input.txt");
        let def = copy_def();
        let error = Transform::new(
            &def,
            &ctx,
            "top",
            "copy",
            BTreeMap::from([
                ("frm".to_string(), Value::path(&frm).unwrap()),
                ("bogus".to_string(), Value::constant(1)),
            ]),
        )
        .unwrap_err();
        assert!(matches!(error, BuildGraphError::Config(_)));
    }

    #[test]
    fn env_bound_fields_wrap_bare() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let def = TransformDef::new(
            "demo::transforms",
            "Lint",
            vec![FieldDef::input("mode", FieldType::Const).with_env("LINT_MODE")],
            vec![],
            noop_execute(),
        )
        .unwrap();
        let transform = Transform::new(
            &def,
            &ctx,
            "top",
            "lint",
            BTreeMap::from([("mode".to_string(), Value::constant("strict"))]),
        )
        .unwrap();
        let mode = transform.iface("mode").unwrap();
        assert_eq!(
            mode.spec.value,
            Value::env_with("LINT_MODE", Value::constant("strict"), EnvPolicy::Conflict, false)
        );
    }

    #[test]
    fn env_on_output_is_rejected() {
        let error = TransformDef::new(
            "demo::transforms",
            "Bad",
            vec![FieldDef::output("out", FieldType::Path).with_env("OUT")],
            vec![],
            noop_execute(),
        )
        .unwrap_err();
        assert!(matches!(error, BuildGraphError::Config(_)));
    }

    #[test]
    fn serialization_round_trips_through_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let frm = dir.path().join("input.txt");

        let mut registry = TransformRegistry::new();
        registry.register(copy_def()).unwrap();
        let def = registry.get("demo::transforms", "Copy").unwrap();

        let transform = Transform::new(
            &def,
            &ctx,
            "top",
            "copy",
            BTreeMap::from([("frm".to_string(), Value::path(&frm).unwrap())]),
        )
        .unwrap();

        let spec = transform.serialize();
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"mod\":\"demo::transforms\""));

        let parsed: TransformSpec = serde_json::from_str(&json).unwrap();
        let back = Transform::deserialize(parsed, &registry).unwrap();
        assert_eq!(back.module, transform.module);
        for (a, b) in back.ifaces().zip(transform.ifaces()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.direction, b.direction);
            assert_eq!(a.spec, b.spec);
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TransformRegistry::new();
        registry.register(copy_def()).unwrap();
        assert!(registry.register(copy_def()).is_err());
    }

    #[test]
    fn execute_fns_build_invocations() {
        // Smoke check that the ExecuteCtx surface is usable from a plain
        // closure definition.
        let def = TransformDef::new(
            "demo::transforms",
            "Touch",
            vec![FieldDef::output("out", FieldType::Path)],
            vec![ToolKey::bare("shell")],
            Arc::new(|exec: &ExecuteCtx<'_>| {
                let shell = exec.tools.get("shell")?;
                let out = exec.io.path("out")?;
                Ok(vec![Invocation::new(
                    shell,
                    Executable::Name("/bin/sh".to_string()),
                )
                .arg("-c")
                .arg("touch \"$0\"")
                .arg(out.to_path_buf())])
            }),
        )
        .unwrap();
        assert_eq!(def.fields.len(), 1);
    }
}
