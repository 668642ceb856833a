//! Phase runner.
//!
//! Drives the root unit through load → initialize → start, waits for shutdown, then
//! stop → uninitialize → unload. Shutdown can be driven by OS signals, an external
//! `CancellationToken`, or an arbitrary future. Partial failures are logged with the
//! filtered status summary and the run goes on; a fatal failure of the root's own
//! load / initialize / start tears down what is up and aborts the run.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigBackend;
use crate::error::{error_chain, ModuleError};
use crate::phase::Phase;
use crate::runtime::shutdown;
use crate::status::{FilteredRecord, PhaseReport};
use crate::unit::ModuleUnit;

/// How the runner should decide when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, we initiate shutdown.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct RunOptions {
    /// Freshly built, unloaded root.
    pub root: Arc<ModuleUnit>,
    /// Backend the root resolves its own configuration through, if any.
    pub backend: Option<Arc<dyn ConfigBackend>>,
    pub shutdown: ShutdownOptions,
    /// Upper bound for each phase call on the root.
    pub phase_timeout: Option<Duration>,
}

/// Full cycle: load → initialize → start → wait → stop → uninitialize → unload.
pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let RunOptions {
        root,
        backend,
        shutdown,
        phase_timeout,
    } = opts;

    let cancel = match &shutdown {
        ShutdownOptions::Token(t) => t.clone(),
        _ => CancellationToken::new(),
    };
    match shutdown {
        ShutdownOptions::Signals => {
            let c = cancel.clone();
            tokio::spawn(async move {
                match shutdown::wait_for_shutdown().await {
                    Ok(()) => tracing::info!("shutdown: signal received"),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            "shutdown: primary waiter failed; falling back to ctrl_c()"
                        );
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
                c.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let c = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("shutdown: external future completed");
                c.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::info!("shutdown: external token will control lifecycle");
        }
    }

    tracing::info!("Phase: load");
    let res = within("load", phase_timeout, root.load(backend)).await;
    bring_up(&root, "load", res).await?;

    tracing::info!("Phase: initialize");
    let res = within("initialize", phase_timeout, root.initialize()).await;
    bring_up(&root, "initialize", res).await?;

    tracing::info!("Phase: start");
    let res = within("start", phase_timeout, root.start()).await;
    bring_up(&root, "start", res).await?;

    cancel.cancelled().await;

    tracing::info!("Phase: stop");
    teardown(&root, phase_timeout).await;
    Ok(())
}

/// Load the tree, report its filtered status, unload it again.
pub async fn check(
    root: &Arc<ModuleUnit>,
    backend: Option<Arc<dyn ConfigBackend>>,
    phase_timeout: Option<Duration>,
) -> anyhow::Result<Vec<FilteredRecord>> {
    let summary = match within("load", phase_timeout, root.load(backend)).await? {
        Ok(report) => report.summary(),
        Err(e) => match e.report() {
            Some(report) => report.summary(),
            None => anyhow::bail!("{}", error_chain(&e)),
        },
    };
    teardown(root, phase_timeout).await;
    Ok(summary)
}

async fn within<F, T>(phase: &'static str, limit: Option<Duration>, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = T>,
{
    match limit {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| anyhow::anyhow!("phase '{phase}' timed out after {d:?}")),
        None => Ok(fut.await),
    }
}

/// Accept a bring-up phase result; on a fatal one, tear down and fail the run.
async fn bring_up(
    root: &Arc<ModuleUnit>,
    phase: &'static str,
    res: anyhow::Result<Result<PhaseReport, ModuleError>>,
) -> anyhow::Result<()> {
    let err = match res {
        Ok(res) => match settle(phase, res) {
            Ok(()) => return Ok(()),
            Err(e) => anyhow::anyhow!("{}", error_chain(&e)),
        },
        Err(timeout) => timeout,
    };
    tracing::error!(phase, error = %err, "phase failed; tearing down");
    teardown(root, None).await;
    Err(err.context(format!("phase '{phase}' failed")))
}

fn settle(phase: &'static str, res: Result<PhaseReport, ModuleError>) -> Result<(), ModuleError> {
    match res {
        Ok(_) => {
            tracing::info!(phase, "phase completed");
            Ok(())
        }
        Err(e) => match e.report() {
            Some(report) => {
                tracing::warn!(
                    phase,
                    summary = %report.summary_json(),
                    "phase completed with failed modules"
                );
                Ok(())
            }
            None => Err(e),
        },
    }
}

/// Best-effort teardown from whatever phase the root reached. Failures are logged.
async fn teardown(root: &Arc<ModuleUnit>, phase_timeout: Option<Duration>) {
    if root.phase() == Phase::Started {
        log_teardown("stop", within("stop", phase_timeout, root.stop()).await);
    }
    if matches!(root.phase(), Phase::Initialized | Phase::Stopped) {
        log_teardown(
            "uninitialize",
            within("uninitialize", phase_timeout, root.uninitialize()).await,
        );
    }
    if matches!(root.phase(), Phase::Loaded | Phase::Uninitialized) {
        log_teardown("unload", within("unload", phase_timeout, root.unload()).await);
    }
}

fn log_teardown(phase: &'static str, res: anyhow::Result<Result<PhaseReport, ModuleError>>) {
    match res {
        Ok(res) => {
            if let Err(e) = settle(phase, res) {
                tracing::error!(phase, error = %error_chain(&e), "teardown phase failed");
            }
        }
        Err(e) => tracing::error!(phase, error = %e, "teardown phase failed"),
    }
}
