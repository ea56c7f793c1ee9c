//! The project context: where the work area, scratch space, state and tools
//! live on the host, and where they appear inside a sandbox.
//!
//! A context is constructed explicitly by the embedding application (config
//! file discovery is an external collaborator) and is immutable for the
//! lifetime of a workflow run.

use std::path::{Path, PathBuf};

use crate::error::{BuildGraphError, Result};
use crate::paths::normalize_path;

#[derive(Debug, Clone)]
pub struct Context {
    pub project: String,
    pub host_root: PathBuf,
    pub host_scratch: PathBuf,
    pub host_state: PathBuf,
    pub host_tools: PathBuf,
    pub container_root: PathBuf,
    pub container_scratch: PathBuf,
    pub container_tools: PathBuf,
    /// Image identifier handed to the sandbox runtime.
    pub image: String,
}

impl Context {
    /// A context with the standard layout: scratch, state and tools areas
    /// under the host root, mapped to fixed container locations.
    pub fn new(project: impl Into<String>, host_root: impl Into<PathBuf>) -> Self {
        let project = project.into();
        let host_root = normalize_path(&host_root.into());
        Self {
            host_scratch: host_root.join("scratch"),
            host_state: host_root.join(".state"),
            host_tools: host_root.join("tools"),
            container_root: PathBuf::from("/project"),
            container_scratch: PathBuf::from("/scratch"),
            container_tools: PathBuf::from("/tools"),
            image: format!("foundation-{project}"),
            project,
            host_root,
        }
    }

    /// A context whose container paths equal its host paths. Used with the
    /// subprocess runtime, where invocations execute directly on the host and
    /// no path translation happens.
    pub fn identity(project: impl Into<String>, host_root: impl Into<PathBuf>) -> Self {
        let mut ctx = Self::new(project, host_root);
        ctx.container_root = ctx.host_root.clone();
        ctx.container_scratch = ctx.host_scratch.clone();
        ctx.container_tools = ctx.host_tools.clone();
        ctx
    }

    pub fn with_host_scratch(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_scratch = normalize_path(&path.into());
        self
    }

    pub fn with_host_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_state = normalize_path(&path.into());
        self
    }

    pub fn with_host_tools(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_tools = normalize_path(&path.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Create the host-side working areas.
    pub fn ensure_areas(&self) -> Result<()> {
        std::fs::create_dir_all(&self.host_scratch)?;
        std::fs::create_dir_all(&self.host_state)?;
        Ok(())
    }

    /// Map a host path to its location inside a sandbox. Paths outside the
    /// project root and scratch area are not reachable from a sandbox.
    pub fn map_to_container(&self, host: &Path) -> Result<PathBuf> {
        let host = normalize_path(host);
        for (host_base, cont_base) in [
            (&self.host_root, &self.container_root),
            (&self.host_scratch, &self.container_scratch),
        ] {
            if let Ok(relative) = host.strip_prefix(host_base) {
                return Ok(cont_base.join(relative));
            }
        }
        Err(BuildGraphError::HostPath(format!(
            "path {} is not within the project working directory {} or scratch area {}",
            host.display(),
            self.host_root.display(),
            self.host_scratch.display()
        )))
    }

    /// Map a sandbox path back to its host location.
    pub fn map_to_host(&self, cont: &Path) -> Result<PathBuf> {
        let cont = normalize_path(cont);
        for (host_base, cont_base) in [
            (&self.host_root, &self.container_root),
            (&self.host_scratch, &self.container_scratch),
        ] {
            if let Ok(relative) = cont.strip_prefix(cont_base) {
                return Ok(host_base.join(relative));
            }
        }
        Err(BuildGraphError::ContainerPath(format!(
            "path {} is not within the container working directory {} or scratch area {}",
            cont.display(),
            self.container_root.display(),
            self.container_scratch.display()
        )))
    }

    /// Derive the scratch location for an automatically defaulted output
    /// field.
    pub fn scratch_path(&self, unit: &str, ident: &str, field: &str) -> PathBuf {
        self.host_scratch.join(unit).join(ident).join(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_between_host_and_container() {
        let ctx = Context::new("demo", "/work/demo");
        let cont = ctx
            .map_to_container(Path::new("/work/demo/rtl/top.sv"))
            .unwrap();
        assert_eq!(cont, PathBuf::from("/project/rtl/top.sv"));
        assert_eq!(
            ctx.map_to_host(&cont).unwrap(),
            PathBuf::from("/work/demo/rtl/top.sv")
        );

        let scratch = ctx
            .map_to_container(Path::new("/work/demo/scratch/unit/out"))
            .unwrap();
        assert_eq!(scratch, PathBuf::from("/scratch/unit/out"));
    }

    #[test]
    fn identity_context_maps_to_itself() {
        let ctx = Context::identity("demo", "/work/demo");
        let path = Path::new("/work/demo/scratch/out.bin");
        assert_eq!(ctx.map_to_container(path).unwrap(), path);
        assert_eq!(ctx.map_to_host(path).unwrap(), path);
    }

    #[test]
    fn unmapped_paths_error() {
        let ctx = Context::new("demo", "/work/demo");
        assert!(matches!(
            ctx.map_to_container(Path::new("/elsewhere/file")),
            Err(BuildGraphError::HostPath(_))
        ));
        assert!(matches!(
            ctx.map_to_host(Path::new("/elsewhere/file")),
            Err(BuildGraphError::ContainerPath(_))
        ));
    }

    #[test]
    fn scratch_paths_are_per_unit_and_field() {
        let ctx = Context::new("demo", "/work/demo");
        assert_eq!(
            ctx.scratch_path("top", "synth", "netlist"),
            PathBuf::from("/work/demo/scratch/top/synth/netlist")
        );
    }
}
