//! The transform run lifecycle: fresh sandbox, tools, interface resolution,
//! execute, dispatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use buildgraph_core::{
    BuildGraphError, Context, ExecuteCtx, ResolvedIo, Result, ToolHandles, ToolRegistry,
    Transform, TransformRegistry,
};

use crate::runtime::Runtime;
use crate::sandbox::Sandbox;

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_time: Duration,
}

/// Run a transform to completion inside a fresh sandbox.
///
/// Inputs bind read-only; outputs bind writable with parent directories
/// created. Invocations dispatch in the order the execute routine yields
/// them; the first nonzero exit aborts. Cancellation is checked between
/// invocations so a cancelled workflow stops at the next boundary.
pub async fn run_transform(
    ctx: &Arc<Context>,
    tools: &Arc<ToolRegistry>,
    defs: &TransformRegistry,
    transform: &Transform,
    runtime: &dyn Runtime,
    cancel: &CancellationToken,
) -> Result<RunResult> {
    let start = Instant::now();
    let def = defs.get(&transform.module, &transform.name)?;

    let mut sandbox = Sandbox::new(ctx.clone(), tools.clone())?;
    let mut handles = BTreeMap::new();
    for key in &transform.tools {
        let version = tools.default_version(key)?.clone();
        sandbox.add_tool(&version)?;
        handles.insert(key.base_id(), version);
    }

    let mut resolved = BTreeMap::new();
    for entry in transform.ifaces() {
        let value = entry.spec.resolve(ctx, &mut sandbox, entry.direction)?;
        resolved.insert(entry.name.clone(), value);
    }

    let io = ResolvedIo::new(resolved);
    let handles = ToolHandles::new(handles);
    let invocations = (def.execute.as_ref())(&ExecuteCtx {
        ctx,
        io: &io,
        tools: &handles,
    })?;

    debug!(transform = %transform.label(), count = invocations.len(), "dispatching invocations");
    for invocation in invocations {
        if cancel.is_cancelled() {
            return Err(BuildGraphError::Execution(format!(
                "transform `{}` cancelled",
                transform.label()
            )));
        }
        let exit_code = sandbox.invoke(&invocation, runtime).await?;
        if exit_code != 0 {
            return Err(BuildGraphError::Execution(format!(
                "invocation of `{}` for transform `{}` failed with exit code {exit_code}",
                invocation.tool, transform.label()
            )));
        }
    }

    Ok(RunResult {
        run_time: start.elapsed(),
    })
}
