use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use dr_adapters::cli::CliAgentAdapter;
use dr_adapters::http::HttpAgentAdapter;
use dr_adapters::AdapterRegistry;
use dr_audit::AuditStore;
use dr_core::config::Config;
use dr_core::types::ExecutionModel;
use dr_core::workspace::WorkspaceManager;
use dr_overlay::OverlayBroker;
use dr_policy::PolicyGuard;
use dr_sandbox::{PtyNativeLauncher, SandboxRunner};

use crate::cancel::CancelToken;
use crate::driver::EngineDeps;
use crate::predicate::{PredicateRegistry, ScriptPredicate};
use crate::scheduler::Scheduler;

/// Process harness: builds the component graph from configuration, runs
/// the scheduler, and sweeps retired workspaces until shutdown.
pub struct Daemon {
    config: Arc<Config>,
    scheduler: Scheduler,
    shutdown: CancelToken,
}

impl Daemon {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let store =
            Arc::new(AuditStore::open(&config.audit.dir).context("failed to open audit store")?);
        let broker = Arc::new(OverlayBroker::new(
            Arc::clone(&store),
            config.overlay.clone(),
        ));
        let guard = Arc::new(PolicyGuard::new(
            Arc::clone(&store),
            config.budget.safety_multiplier,
        ));
        let workspaces = Arc::new(WorkspaceManager::new(
            &config.engine.workspace_root,
            config.engine.retention_grace_secs,
        ));
        let sandbox = Arc::new(SandboxRunner::new(
            Arc::new(PtyNativeLauncher::new()),
            Arc::clone(&broker),
            Arc::clone(&guard),
            config.sandbox.clone(),
            config.overlay.clone(),
        ));

        let mut registry = AdapterRegistry::new(config.routing.clone());
        let run_timeout = Duration::from_secs(config.engine.phase_timeout_secs);
        for descriptor in &config.adapters {
            match descriptor.execution {
                ExecutionModel::CliPty => {
                    let binary = descriptor
                        .binary
                        .clone()
                        .unwrap_or_else(|| descriptor.id.clone());
                    let adapter = CliAgentAdapter::new(
                        descriptor.clone(),
                        binary,
                        descriptor.args.clone(),
                        Arc::clone(&sandbox),
                        Arc::clone(&broker),
                        config.profiles.clone(),
                        run_timeout,
                    );
                    registry
                        .register(Arc::new(adapter))
                        .with_context(|| format!("registering adapter {}", descriptor.id))?;
                }
                ExecutionModel::HttpApi => {
                    let endpoint = descriptor.endpoint.clone().with_context(|| {
                        format!("http adapter {} has no endpoint", descriptor.id)
                    })?;
                    let adapter = HttpAgentAdapter::new(
                        descriptor.clone(),
                        endpoint,
                        Arc::clone(&guard),
                        config.profiles.clone(),
                        run_timeout,
                    )
                    .map_err(anyhow::Error::msg)?;
                    registry
                        .register(Arc::new(adapter))
                        .with_context(|| format!("registering adapter {}", descriptor.id))?;
                }
                ExecutionModel::InProcess => {
                    warn!(adapter = %descriptor.id, "in_process adapters are registered programmatically, skipping");
                }
            }
        }

        let mut predicates = PredicateRegistry::new();
        for spec in &config.predicates {
            predicates
                .register(Arc::new(ScriptPredicate::new(
                    &spec.name,
                    spec.argv.clone(),
                    Duration::from_secs(spec.wait_secs),
                )))
                .with_context(|| format!("registering predicate {}", spec.name))?;
        }

        let deps = EngineDeps {
            store,
            broker,
            guard,
            workspaces,
            sandbox,
            registry: Arc::new(registry),
            predicates: Arc::new(predicates),
            config: Arc::clone(&config),
        };
        let scheduler = Scheduler::new(deps);

        Ok(Self {
            config,
            scheduler,
            shutdown: CancelToken::new(),
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Handle for wiring ctrl-c (or an operator surface) to shutdown.
    pub fn shutdown_handle(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Recover interrupted tasks, then run until the shutdown handle
    /// fires.
    pub async fn run(&self) -> Result<()> {
        let recovered = self.scheduler.recover();
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered interrupted tasks");
        }

        let admission = {
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        let mut sweep = tokio::time::interval(Duration::from_secs(60));
        sweep.tick().await;
        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let deps_sweep = self.scheduler_deps_sweep();
                    if !deps_sweep.is_empty() {
                        info!(count = deps_sweep.len(), "swept retired workspaces");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        let grace = Duration::from_secs(self.config.engine.cancel_grace_secs);
        self.scheduler.shutdown(grace).await;
        admission.abort();
        info!("daemon stopped");
        Ok(())
    }

    fn scheduler_deps_sweep(&self) -> Vec<String> {
        // The workspace manager is shared; sweeping from here keeps the
        // driver hot path free of filesystem walks.
        self.scheduler.workspaces().sweep()
    }
}
