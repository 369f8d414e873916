//! AdapterHandle: lifecycle wrapper owning one adapter instance.
//!
//! The handle supervises the logic's background task, watches the bus for
//! `ShuttingDown`, applies the crash/restart policy, and guarantees the
//! shutdown publication order on every exit path:
//! `AdapterStopping` -> `logic.stop()` -> `AdapterStopped`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::adapters::traits::{AdapterContext, AdapterLogic};
use crate::bus::{Event, SharedBus};
use crate::error::Result;

/// Crash/restart policy for an adapter's background task.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Fixed delay before a restart attempt.
    pub backoff: Duration,
    /// Consecutive-failure budget. Reaching it stops the adapter for good.
    pub max_failures: u32,
    /// A run at least this long counts as healthy and resets the counter.
    pub healthy_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            max_failures: 5,
            healthy_after: Duration::from_secs(300),
        }
    }
}

/// Owns one adapter's supervision task. Created per enabled adapter by the
/// coordinator; a fresh handle starts with a fresh failure counter.
pub struct AdapterHandle {
    logic: Arc<dyn AdapterLogic>,
    bus: SharedBus,
    shutdown: CancellationToken,
    policy: RestartPolicy,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AdapterHandle {
    pub fn new(logic: Arc<dyn AdapterLogic>, bus: SharedBus, shutdown: CancellationToken) -> Self {
        Self::with_policy(logic, bus, shutdown, RestartPolicy::default())
    }

    pub fn with_policy(
        logic: Arc<dyn AdapterLogic>,
        bus: SharedBus,
        shutdown: CancellationToken,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            logic,
            bus,
            shutdown,
            policy,
            task: Mutex::new(None),
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.logic.prefix()
    }

    pub fn logic(&self) -> &Arc<dyn AdapterLogic> {
        &self.logic
    }

    /// Spawn the supervision task. Idempotent while a task is alive.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.task.lock().await;
        if let Some(task) = slot.as_ref() {
            if !task.is_finished() {
                return Ok(());
            }
        }

        let logic = self.logic.clone();
        let bus = self.bus.clone();
        let token = self.shutdown.clone();
        let policy = self.policy.clone();
        *slot = Some(tokio::spawn(supervise(logic, bus, token, policy)));
        Ok(())
    }

    /// Cooperative stop: cancel, then wait for the supervision task (and
    /// through it `logic.stop()`) to complete. This is the ACK the
    /// coordinator relies on.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(adapter = self.logic.prefix(), "supervision task panicked: {e}");
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}

enum RunOutcome {
    Clean,
    Shutdown,
    Crashed(String),
}

/// Supervision loop: run the logic, restart on crash within policy, always
/// end with the Stopping/stop()/Stopped sequence.
async fn supervise(
    logic: Arc<dyn AdapterLogic>,
    bus: SharedBus,
    token: CancellationToken,
    policy: RestartPolicy,
) {
    let prefix = logic.prefix();
    let mut failures: u32 = 0;
    let mut rx = bus.subscribe();

    info!(adapter = prefix, "adapter starting");

    loop {
        if token.is_cancelled() {
            break;
        }

        let started = Instant::now();
        let outcome = run_once(&logic, &bus, &token, &mut rx).await;

        match outcome {
            RunOutcome::Clean => {
                info!(adapter = prefix, "adapter run completed");
                break;
            }
            RunOutcome::Shutdown => break,
            RunOutcome::Crashed(reason) => {
                if started.elapsed() >= policy.healthy_after {
                    failures = 0;
                }
                failures += 1;

                if failures >= policy.max_failures {
                    error!(
                        adapter = prefix,
                        failures,
                        "restart budget exhausted, adapter stays stopped: {reason}"
                    );
                    break;
                }

                warn!(
                    adapter = prefix,
                    failures,
                    backoff = ?policy.backoff,
                    "adapter crashed, restarting: {reason}"
                );

                // The backoff wait also honours a shutdown broadcast, so a
                // crash-looping adapter still stops within the grace window.
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = wait_for_shutdown_event(&mut rx) => break,
                    _ = tokio::time::sleep(policy.backoff) => {}
                }
            }
        }
    }

    // Shutdown publication, on every path. Stopping goes out first so the
    // aggregator flushes this adapter's zones before the ACK is observed.
    bus.publish(Event::AdapterStopping {
        adapter: prefix.to_string(),
    });
    logic.stop().await;
    bus.publish(Event::AdapterStopped {
        adapter: prefix.to_string(),
    });
    info!(adapter = prefix, "adapter stopped");
}

async fn run_once(
    logic: &Arc<dyn AdapterLogic>,
    bus: &SharedBus,
    token: &CancellationToken,
    rx: &mut broadcast::Receiver<Event>,
) -> RunOutcome {
    let ctx = AdapterContext {
        bus: bus.clone(),
        shutdown: token.clone(),
    };

    // The logic runs in its own task so a panic is contained and counted as
    // a crash rather than taking down the supervisor.
    let mut run_task = tokio::spawn({
        let logic = logic.clone();
        async move { logic.run(ctx).await }
    });

    let outcome = tokio::select! {
        res = &mut run_task => match res {
            Ok(Ok(())) => RunOutcome::Clean,
            Ok(Err(e)) => RunOutcome::Crashed(e.to_string()),
            Err(join_err) if join_err.is_panic() => {
                RunOutcome::Crashed("task panicked".to_string())
            }
            Err(_) => RunOutcome::Crashed("task aborted".to_string()),
        },
        _ = wait_for_shutdown_event(rx) => RunOutcome::Shutdown,
        _ = token.cancelled() => RunOutcome::Shutdown,
    };

    // On the shutdown paths the logic future is still in flight; cancel it
    // and wait briefly so stop() finds quiesced I/O.
    if matches!(outcome, RunOutcome::Shutdown) {
        token.cancel();
        if tokio::time::timeout(Duration::from_secs(2), &mut run_task)
            .await
            .is_err()
        {
            run_task.abort();
        }
    }
    outcome
}

async fn wait_for_shutdown_event(rx: &mut broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(Event::ShuttingDown) => return,
            Ok(_) => {}
            // Lagged receivers must still observe shutdown; the publisher
            // guarantees ShuttingDown lands before ACK waiting starts, and a
            // closed bus means the process is tearing down anyway.
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
