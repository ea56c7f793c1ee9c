//! The two-pass cache-aware workflow driver.
//!
//! Pass 1 walks the target closure in reverse dependency order: a transform
//! whose dependents are all satisfied from cache is skipped outright (its
//! outputs will never be read); otherwise its outputs are pulled from the
//! caches when present. Targets are never skipped — their outputs are the
//! point of the run — but they are fetched like everything else.
//!
//! Pass 2 walks forward in dependency order, running whatever pass 1 could
//! not satisfy and pushing fresh outputs back out to the caches. Every
//! transform therefore runs at most once per workflow, and only when its
//! inputs differ from every cached key.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use buildgraph_core::{
    BuildGraphError, Context, ModuleHasher, Result, ToolRegistry, TransformRegistry,
};
use buildgraph_cache::CacheHub;
use buildgraph_exec::{run_transform, Runtime};
use buildgraph_graph::{HashEngine, Scheduler, TransformId};

use crate::bridge::{build_plan, ConfigNode, Plan};

/// The four disjoint outcomes per transform, primarily for reporting and
/// unit testing.
#[derive(Debug, Default, Clone)]
pub struct WorkflowResults {
    pub run: HashSet<TransformId>,
    pub stored: HashSet<TransformId>,
    pub fetched: HashSet<TransformId>,
    pub skipped: HashSet<TransformId>,
}

pub struct Workflow {
    ctx: Arc<Context>,
    tools: Arc<ToolRegistry>,
    defs: Arc<TransformRegistry>,
    runtime: Arc<dyn Runtime>,
    caches: CacheHub,
    cancel: CancellationToken,
    module_fingerprint: Option<String>,
}

impl Workflow {
    pub fn new(
        ctx: Arc<Context>,
        tools: Arc<ToolRegistry>,
        defs: Arc<TransformRegistry>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self {
            ctx,
            tools,
            defs,
            runtime,
            caches: CacheHub::default(),
            cancel: CancellationToken::new(),
            module_fingerprint: None,
        }
    }

    pub fn with_caches(mut self, caches: CacheHub) -> Self {
        self.caches = caches;
        self
    }

    /// Pin the module fingerprint, keeping input hashes stable across
    /// rebuilds of the engine itself.
    pub fn with_module_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.module_fingerprint = Some(fingerprint.into());
        self
    }

    /// Token checked between scheduler steps and between invocations.
    /// Cancelling aborts the workflow at the next boundary; partially
    /// produced outputs are never stored.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Build the plan from a configuration tree and run it.
    pub async fn run(&self, root: &dyn ConfigNode) -> Result<WorkflowResults> {
        let plan = build_plan(root, &self.ctx)?;
        self.run_plan(&plan).await
    }

    /// Run a pre-built plan.
    pub async fn run_plan(&self, plan: &Plan) -> Result<WorkflowResults> {
        let modules = match &self.module_fingerprint {
            Some(fingerprint) => ModuleHasher::with_fingerprint(fingerprint.clone()),
            None => ModuleHasher::new(),
        };
        let mut hashes = HashEngine::new(modules);
        if self.caches.enabled() {
            hashes = hashes.with_trace();
        }

        let mut results = WorkflowResults::default();

        // Pass 1: cache-aware, reverse order, dependents before
        // dependencies.
        if self.caches.enabled() {
            // Only dependents inside the target closure can make a
            // transform's outputs needed; pruned dependents never run.
            let mut closure: HashSet<TransformId> = HashSet::new();
            let mut stack: Vec<TransformId> = plan.targets.iter().copied().collect();
            while let Some(tid) = stack.pop() {
                if closure.insert(tid) {
                    if let Some(dependencies) = plan.dependency_map.get(&tid) {
                        stack.extend(dependencies.iter().copied());
                    }
                }
            }

            let mut scheduler = Scheduler::build(&plan.dependency_map, Some(&plan.targets), true);
            while !scheduler.is_complete() {
                for tid in scheduler.schedulable()? {
                    self.check_cancelled()?;
                    scheduler.schedule(tid)?;
                    let label = plan.graph.transform(tid).label();
                    let dependents: Vec<TransformId> = plan
                        .dependent_map
                        .get(&tid)
                        .map(|set| {
                            set.iter()
                                .copied()
                                .filter(|id| closure.contains(id))
                                .collect()
                        })
                        .unwrap_or_default();
                    let satisfied = |id: &TransformId| {
                        results.fetched.contains(id) || results.skipped.contains(id)
                    };
                    if !plan.targets.contains(&tid)
                        && !dependents.is_empty()
                        && dependents.iter().all(satisfied)
                    {
                        info!(transform = %label, "skipping transform, all dependents satisfied from cache");
                        results.skipped.insert(tid);
                    } else if self
                        .caches
                        .fetch_transform(&plan.graph, &hashes, tid)
                        .await?
                    {
                        info!(transform = %label, "fetched transform from cache");
                        results.fetched.insert(tid);
                    }
                    scheduler.finish(tid)?;
                }
            }
        }

        // Pass 2: forward execution, skipping whatever pass 1 satisfied.
        let mut scheduler = Scheduler::build(&plan.dependency_map, Some(&plan.targets), false);
        while !scheduler.is_complete() {
            for tid in scheduler.schedulable()? {
                self.check_cancelled()?;
                scheduler.schedule(tid)?;
                let transform = plan.graph.transform(tid);
                if results.fetched.contains(&tid) {
                    info!(transform = %transform.label(), "skipped cached transform");
                } else if results.skipped.contains(&tid) {
                    info!(transform = %transform.label(), "skipped transform, only cached dependents");
                } else {
                    info!(transform = %transform.label(), "running transform");
                    let outcome = run_transform(
                        &self.ctx,
                        &self.tools,
                        &self.defs,
                        transform,
                        self.runtime.as_ref(),
                        &self.cancel,
                    )
                    .await?;
                    info!(
                        transform = %transform.label(),
                        run_time = ?outcome.run_time,
                        "transform finished"
                    );
                    results.run.insert(tid);
                    if self.caches.enabled()
                        && self
                            .caches
                            .store_transform(&plan.graph, &hashes, tid)
                            .await?
                    {
                        results.stored.insert(tid);
                    } else if self.caches.enabled() && !self.caches.determinism() {
                        warn!(transform = %transform.label(), "transform outputs were not stored to any cache");
                    }
                }
                scheduler.finish(tid)?;
            }
        }

        Ok(results)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BuildGraphError::Execution(
                "workflow cancelled".to_string(),
            ));
        }
        Ok(())
    }
}
