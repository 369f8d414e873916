//! AdapterCoordinator: decides which adapter handles exist and routes
//! commands to them.
//!
//! The coordinator reads the enabled-adapter configuration, builds handles
//! for exactly the enabled adapters (a disabled adapter is never started and
//! never appears "searching" anywhere), keeps the `prefix -> adapter`
//! registry used for command routing, and drives graceful shutdown:
//! publish `ShuttingDown`, await `AdapterStopped` ACKs bounded by a grace
//! timeout, then exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::handle::{AdapterHandle, RestartPolicy};
use crate::adapters::traits::{AdapterLogic, ControlAction};
use crate::bus::{Event, ImageData, NowPlaying, SharedBus, Zone};
use crate::error::{BridgeError, Result};

/// Default time the coordinator waits for shutdown ACKs.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

struct Registered {
    logic: Arc<dyn AdapterLogic>,
    enabled: bool,
    handle: Option<Arc<AdapterHandle>>,
}

pub struct AdapterCoordinator {
    adapters: RwLock<HashMap<String, Registered>>,
    bus: SharedBus,
    /// Parent of every handle's cancellation token.
    shutdown: CancellationToken,
    grace: Duration,
    policy: RestartPolicy,
}

impl AdapterCoordinator {
    pub fn new(bus: SharedBus) -> Self {
        Self::with_grace(bus, DEFAULT_GRACE)
    }

    pub fn with_grace(bus: SharedBus, grace: Duration) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            bus,
            shutdown: CancellationToken::new(),
            grace,
            policy: RestartPolicy::default(),
        }
    }

    /// Override the restart policy applied to handles created from now on.
    pub fn set_restart_policy(&mut self, policy: RestartPolicy) {
        self.policy = policy;
    }

    /// Register an adapter under its prefix. Registration is inert: nothing
    /// runs until [`start_enabled`](Self::start_enabled) or a reconfigure.
    pub async fn register(&self, logic: Arc<dyn AdapterLogic>, enabled: bool) {
        let prefix = logic.prefix().to_string();
        debug!(adapter = %prefix, enabled, "adapter registered");
        self.adapters.write().await.insert(
            prefix,
            Registered {
                logic,
                enabled,
                handle: None,
            },
        );
    }

    /// Build and start a handle for every enabled adapter.
    pub async fn start_enabled(&self) -> Result<()> {
        let mut adapters = self.adapters.write().await;
        for (prefix, entry) in adapters.iter_mut() {
            if !entry.enabled {
                info!(adapter = %prefix, "adapter disabled, not starting");
                continue;
            }
            self.start_entry(prefix, entry).await?;
        }
        Ok(())
    }

    async fn start_entry(&self, prefix: &str, entry: &mut Registered) -> Result<()> {
        if let Some(handle) = entry.handle.as_ref() {
            if handle.is_running().await {
                debug!(adapter = %prefix, "adapter already running");
                return Ok(());
            }
        }
        let handle = Arc::new(AdapterHandle::with_policy(
            entry.logic.clone(),
            self.bus.clone(),
            self.shutdown.child_token(),
            self.policy.clone(),
        ));
        handle.start().await?;
        entry.handle = Some(handle);
        info!(adapter = %prefix, "adapter started");
        Ok(())
    }

    /// Idempotently apply a runtime enable/disable change. Re-enabling an
    /// adapter builds a fresh handle, which also resets its crash counter.
    pub async fn reconfigure(&self, prefix: &str, enabled: bool) -> Result<()> {
        let handle_to_stop = {
            let mut adapters = self.adapters.write().await;
            let entry = adapters
                .get_mut(prefix)
                .ok_or_else(|| BridgeError::NotFound(format!("adapter {prefix}")))?;
            entry.enabled = enabled;

            if enabled {
                self.start_entry(prefix, entry).await?;
                None
            } else {
                entry.handle.take()
            }
        };

        if let Some(handle) = handle_to_stop {
            info!(adapter = prefix, "adapter disabled, stopping");
            handle.stop().await;
        }
        Ok(())
    }

    pub async fn is_enabled(&self, prefix: &str) -> bool {
        self.adapters
            .read()
            .await
            .get(prefix)
            .map(|a| a.enabled)
            .unwrap_or(false)
    }

    pub async fn is_running(&self, prefix: &str) -> bool {
        let handle = {
            let adapters = self.adapters.read().await;
            adapters.get(prefix).and_then(|a| a.handle.clone())
        };
        match handle {
            Some(h) => h.is_running().await,
            None => false,
        }
    }

    /// Resolve the adapter owning a prefixed zone id.
    pub async fn adapter_for(&self, zone_id: &str) -> Result<Arc<dyn AdapterLogic>> {
        let prefix = zone_id.split(':').next().unwrap_or("");
        let adapters = self.adapters.read().await;
        adapters
            .get(prefix)
            .filter(|entry| entry.enabled)
            .map(|entry| entry.logic.clone())
            .ok_or_else(|| BridgeError::NotFound(format!("no adapter for zone {zone_id}")))
    }

    /// Look up an adapter by its prefix, enabled or not.
    pub async fn adapter(&self, prefix: &str) -> Option<Arc<dyn AdapterLogic>> {
        self.adapters
            .read()
            .await
            .get(prefix)
            .map(|entry| entry.logic.clone())
    }

    /// Route a control action to the adapter owning the zone.
    pub async fn control(
        &self,
        zone_id: &str,
        action: ControlAction,
        value: Option<f64>,
    ) -> Result<()> {
        let adapter = self.adapter_for(zone_id).await?;
        adapter.control(zone_id, action, value).await
    }

    /// Route a now-playing query to the adapter owning the zone.
    pub async fn now_playing(&self, zone_id: &str) -> Result<NowPlaying> {
        let adapter = self.adapter_for(zone_id).await?;
        adapter.get_now_playing(zone_id).await
    }

    /// Route an image fetch to the adapter owning the zone.
    pub async fn get_image(&self, zone_id: &str, image_key: &str) -> Result<ImageData> {
        let adapter = self.adapter_for(zone_id).await?;
        adapter.get_image(image_key).await
    }

    /// Zones as reported directly by one adapter (bypasses the aggregator).
    pub async fn adapter_zones(&self, prefix: &str) -> Vec<Zone> {
        match self.adapter(prefix).await {
            Some(adapter) => adapter.get_zones().await,
            None => Vec::new(),
        }
    }

    /// Graceful shutdown: publish `ShuttingDown`, wait for every running
    /// handle's ACK within the grace timeout, then force-stop stragglers.
    pub async fn shutdown(&self) {
        let running: Vec<(String, Arc<AdapterHandle>)> = {
            let adapters = self.adapters.read().await;
            let mut running = Vec::new();
            for (prefix, entry) in adapters.iter() {
                if let Some(handle) = entry.handle.clone() {
                    if handle.is_running().await {
                        running.push((prefix.clone(), handle));
                    }
                }
            }
            running
        };

        if running.is_empty() {
            info!("no adapters running, shutdown complete");
            return;
        }

        info!(count = running.len(), "coordinator shutting down adapters");

        // Subscribe before publishing so no ACK can be missed.
        let rx = self.bus.subscribe();
        self.bus.publish(Event::ShuttingDown);

        let expected: Vec<String> = running.iter().map(|(p, _)| p.clone()).collect();
        let acked = self.wait_for_acks(rx, &expected).await;
        if acked < expected.len() {
            warn!(
                acked,
                expected = expected.len(),
                "grace timeout elapsed before all shutdown ACKs"
            );
        }

        // Cancel any stragglers and join every supervision task.
        self.shutdown.cancel();
        for (prefix, handle) in running {
            handle.stop().await;
            debug!(adapter = %prefix, "handle joined");
        }

        let mut adapters = self.adapters.write().await;
        for entry in adapters.values_mut() {
            entry.handle = None;
        }

        info!("coordinator shutdown complete");
    }

    async fn wait_for_acks(
        &self,
        mut rx: tokio::sync::broadcast::Receiver<Event>,
        expected: &[String],
    ) -> usize {
        let deadline = tokio::time::Instant::now() + self.grace;
        let mut received: Vec<String> = Vec::new();

        while received.len() < expected.len() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(Event::AdapterStopped { adapter })) => {
                    if expected.contains(&adapter) && !received.contains(&adapter) {
                        debug!(%adapter, "shutdown ACK received");
                        received.push(adapter);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
                Err(_) => break,
            }
        }

        received.len()
    }

    /// Registered prefixes with their enabled/running flags, for diagnostics.
    pub async fn adapter_states(&self) -> HashMap<String, (bool, bool)> {
        let entries: Vec<(String, bool, Option<Arc<AdapterHandle>>)> = {
            let adapters = self.adapters.read().await;
            adapters
                .iter()
                .map(|(p, e)| (p.clone(), e.enabled, e.handle.clone()))
                .collect()
        };

        let mut out = HashMap::new();
        for (prefix, enabled, handle) in entries {
            let running = match handle {
                Some(h) => h.is_running().await,
                None => false,
            };
            out.insert(prefix, (enabled, running));
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::adapters::traits::AdapterContext;
    use crate::bus::EventBus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ParkingLogic {
        prefix: &'static str,
        ran: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AdapterLogic for ParkingLogic {
        fn prefix(&self) -> &'static str {
            self.prefix
        }

        async fn run(&self, ctx: AdapterContext) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            ctx.shutdown.cancelled().await;
            Ok(())
        }

        async fn stop(&self) {}

        async fn get_zones(&self) -> Vec<Zone> {
            Vec::new()
        }

        async fn get_now_playing(&self, zone_id: &str) -> Result<NowPlaying> {
            Err(BridgeError::NotFound(zone_id.to_string()))
        }

        async fn control(
            &self,
            _zone_id: &str,
            _action: ControlAction,
            _value: Option<f64>,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn parking(prefix: &'static str) -> (Arc<ParkingLogic>, Arc<AtomicBool>) {
        let ran = Arc::new(AtomicBool::new(false));
        (
            Arc::new(ParkingLogic {
                prefix,
                ran: ran.clone(),
            }),
            ran,
        )
    }

    #[tokio::test]
    async fn disabled_adapter_is_never_started() {
        let bus = EventBus::shared();
        let coord = AdapterCoordinator::new(bus);

        let (enabled_logic, enabled_ran) = parking("hqp");
        let (disabled_logic, disabled_ran) = parking("lms");

        coord.register(enabled_logic, true).await;
        coord.register(disabled_logic, false).await;
        coord.start_enabled().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(enabled_ran.load(Ordering::SeqCst));
        assert!(!disabled_ran.load(Ordering::SeqCst));
        assert!(coord.is_running("hqp").await);
        assert!(!coord.is_running("lms").await);

        coord.shutdown().await;
    }

    #[tokio::test]
    async fn routing_rejects_unknown_and_disabled_prefixes() {
        let bus = EventBus::shared();
        let coord = AdapterCoordinator::new(bus);
        let (logic, _) = parking("hqp");
        coord.register(logic, false).await;

        assert!(matches!(
            coord.adapter_for("hqp:x").await,
            Err(BridgeError::NotFound(_))
        ));
        assert!(matches!(
            coord.adapter_for("nope:x").await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_publishes_and_collects_acks() {
        let bus = EventBus::shared();
        let mut rx = bus.subscribe();
        let coord = AdapterCoordinator::with_grace(bus.clone(), Duration::from_secs(2));

        let (a, _) = parking("hqp");
        let (b, _) = parking("lms");
        coord.register(a, true).await;
        coord.register(b, true).await;
        coord.start_enabled().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        coord.shutdown().await;

        let mut saw_shutting_down = false;
        let mut stopped = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::ShuttingDown => saw_shutting_down = true,
                Event::AdapterStopped { adapter } => stopped.push(adapter),
                _ => {}
            }
        }
        assert!(saw_shutting_down);
        stopped.sort();
        assert_eq!(stopped, vec!["hqp".to_string(), "lms".to_string()]);
        assert!(!coord.is_running("hqp").await);
        assert!(!coord.is_running("lms").await);
    }

    #[tokio::test]
    async fn reconfigure_starts_and_stops_idempotently() {
        let bus = EventBus::shared();
        let coord = AdapterCoordinator::new(bus);
        let (logic, _) = parking("hqp");
        coord.register(logic, false).await;

        coord.reconfigure("hqp", true).await.unwrap();
        coord.reconfigure("hqp", true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coord.is_running("hqp").await);

        coord.reconfigure("hqp", false).await.unwrap();
        coord.reconfigure("hqp", false).await.unwrap();
        assert!(!coord.is_running("hqp").await);
    }
}
