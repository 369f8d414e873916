//! Zone aggregator: the single source of truth for zone state.
//!
//! Subscribes to the bus, folds adapter events into one `zone_id -> Zone`
//! map, and answers the read queries the HTTP layer uses. Mutation critical
//! sections never hold a lock across a suspension point: events are applied
//! under a short write guard, and follow-up publishes happen after the guard
//! is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::bus::{Event, NowPlaying, SharedBus, Zone, ZoneId};

pub struct ZoneAggregator {
    zones: Arc<RwLock<HashMap<String, Zone>>>,
    now_playing: Arc<RwLock<HashMap<String, NowPlaying>>>,
    bus: SharedBus,
}

impl ZoneAggregator {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            zones: Arc::new(RwLock::new(HashMap::new())),
            now_playing: Arc::new(RwLock::new(HashMap::new())),
            bus,
        }
    }

    /// Event loop; spawn as a task.
    ///
    /// `ShuttingDown` starts a drain phase rather than an immediate exit:
    /// handles publish `AdapterStopping` only after the shutdown broadcast,
    /// and those flushes must still be applied. The loop ends once the zone
    /// map is empty or the drain grace elapses.
    pub async fn run(&self) {
        const DRAIN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

        let mut rx = self.bus.subscribe();
        let mut draining = false;
        info!("zone aggregator started");

        loop {
            let received = if draining {
                match tokio::time::timeout(DRAIN_GRACE, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        info!("zone aggregator drain grace elapsed");
                        break;
                    }
                }
            } else {
                rx.recv().await
            };

            match received {
                Ok(Event::ShuttingDown) => {
                    info!("zone aggregator draining");
                    draining = true;
                }
                Ok(event) => self.apply(event).await,
                // Lagged: drop missed events and keep folding. The zone map
                // self-heals on the adapters' next poll cycle.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(missed = n, "zone aggregator lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }

            if draining && self.zones.read().await.is_empty() {
                break;
            }
        }

        info!("zone aggregator stopped");
    }

    async fn apply(&self, event: Event) {
        match event {
            Event::ZoneDiscovered { zone } | Event::ZoneUpdated { zone } => {
                debug!(zone_id = %zone.zone_id, "zone upserted");
                self.zones
                    .write()
                    .await
                    .insert(zone.zone_id.as_str().to_string(), zone);
            }

            Event::ZoneRemoved { zone_id } => {
                debug!(%zone_id, "zone removed");
                self.zones.write().await.remove(zone_id.as_str());
                self.now_playing.write().await.remove(zone_id.as_str());
            }

            Event::NowPlayingChanged {
                zone_id,
                now_playing,
            } => {
                let mut np = self.now_playing.write().await;
                match now_playing {
                    Some(info) => {
                        np.insert(zone_id.as_str().to_string(), info);
                    }
                    None => {
                        np.remove(zone_id.as_str());
                    }
                }
            }

            Event::VolumeChanged {
                zone_id,
                value,
                is_muted,
            } => {
                let mut zones = self.zones.write().await;
                if let Some(zone) = zones.get_mut(zone_id.as_str()) {
                    if let Some(vc) = zone.volume_control.as_mut() {
                        vc.value = value;
                        vc.is_muted = is_muted;
                    }
                }
            }

            Event::AdapterStopping { adapter } => {
                let flushed = self.flush_prefix(&adapter).await;
                info!(adapter, count = flushed.len(), "flushed adapter zones");
                self.bus.publish(Event::ZonesFlushed {
                    adapter,
                    zone_ids: flushed,
                });
            }

            _ => {}
        }
    }

    /// Atomically drop every zone whose id starts with `<prefix>:`.
    async fn flush_prefix(&self, prefix: &str) -> Vec<ZoneId> {
        let needle = format!("{prefix}:");
        let mut zones = self.zones.write().await;
        let mut np = self.now_playing.write().await;

        let victims: Vec<String> = zones
            .keys()
            .filter(|k| k.starts_with(&needle))
            .cloned()
            .collect();

        let mut flushed = Vec::with_capacity(victims.len());
        for key in victims {
            if let Some(zone) = zones.remove(&key) {
                flushed.push(zone.zone_id);
            }
            np.remove(&key);
        }
        flushed
    }

    /// Snapshot of all zones.
    pub async fn list_zones(&self) -> Vec<Zone> {
        self.zones.read().await.values().cloned().collect()
    }

    /// Snapshot of the zones owned by one adapter.
    pub async fn zones_for(&self, prefix: &str) -> Vec<Zone> {
        let needle = format!("{prefix}:");
        self.zones
            .read()
            .await
            .values()
            .filter(|z| z.zone_id.as_str().starts_with(&needle))
            .cloned()
            .collect()
    }

    pub async fn get_zone(&self, zone_id: &str) -> Option<Zone> {
        self.zones.read().await.get(zone_id).cloned()
    }

    /// Last now-playing snapshot observed on the bus for a zone. The owning
    /// adapter remains the authoritative source; this is the cheap read used
    /// by event-stream consumers.
    pub async fn now_playing(&self, zone_id: &str) -> Option<NowPlaying> {
        self.now_playing.read().await.get(zone_id).cloned()
    }

    pub async fn zone_count(&self) -> usize {
        self.zones.read().await.len()
    }
}
