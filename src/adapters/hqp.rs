//! hqp adapter: wraps the DSP protocol client in the common adapter surface
//! and owns the pipeline-view abstraction.
//!
//! External callers never see wire indices. `PipelineView` speaks in domain
//! names (mode "PCM", filter "poly-sinc-ext2", shaper "ASDM7") and Hz; the
//! INDEX <-> name translation against the per-connection caches happens
//! entirely in this module and the client below it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::adapters::hqp_client::{
    DspListItem, DspState, DspStatus, DspVolumeRange, HqpClient, MatrixProfile, DEFAULT_PORT,
};
use crate::adapters::traits::{
    AdapterContext, AdapterLogic, AdapterStatus, Capabilities, ControlAction,
};
use crate::bus::{
    DspLink, Event, NowPlaying, PlaybackState, SharedBus, VolumeControl, VolumeKind, Zone, ZoneId,
};
use crate::error::{BridgeError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Settings addressable through `set_pipeline`. `dither` is the historical
/// alias for the noise-shaper list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineSetting {
    Mode,
    Filter1x,
    FilterNx,
    Shaper,
    Samplerate,
}

impl FromStr for PipelineSetting {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mode" => Ok(Self::Mode),
            "filter1x" => Ok(Self::Filter1x),
            "filterNx" | "filter_nx" => Ok(Self::FilterNx),
            "shaper" | "dither" => Ok(Self::Shaper),
            "samplerate" => Ok(Self::Samplerate),
            other => Err(BridgeError::NotFound(format!(
                "unknown pipeline setting {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineVolume {
    pub value: i32,
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub is_fixed: bool,
}

/// Domain-named view of the DSP's current configuration.
///
/// `mode`/`filter1x`/`filter_nx`/`shaper`/`samplerate` are the *configured*
/// values. `active_mode` and `active_rate_hz` are authoritative for what is
/// audibly playing (from State); a Set accepted mid-playback updates the
/// configured fields immediately while the active ones keep reporting the
/// running pipeline until the next track. `active_filter`/`active_shaper`
/// are display strings from Status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineView {
    pub state: PlaybackState,
    pub mode: String,
    pub filter1x: String,
    pub filter_nx: String,
    pub shaper: String,
    /// Hz; 0 means "auto".
    pub samplerate: u32,
    pub volume: PipelineVolume,
    pub active_mode: String,
    pub active_rate_hz: u32,
    pub active_filter: String,
    pub active_shaper: String,
    pub convolution: bool,
    pub invert: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub matrix_profile: String,
}

fn name_by_index(items: &[DspListItem], index: u32) -> String {
    items
        .iter()
        .find(|i| i.index == index)
        .map(|i| i.name.clone())
        .unwrap_or_default()
}

fn index_by_name(items: &[DspListItem], name: &str) -> Option<u32> {
    items.iter().find(|i| i.name == name).map(|i| i.index)
}

fn playback_state(raw: u8) -> PlaybackState {
    match raw {
        0 => PlaybackState::Stopped,
        1 => PlaybackState::Paused,
        2 => PlaybackState::Playing,
        _ => PlaybackState::Unknown,
    }
}

struct HqpShared {
    host: Option<String>,
    port: u16,
    client: Option<HqpClient>,
    zone: Option<Zone>,
    last_status: Option<DspStatus>,
    last_state: Option<DspState>,
    /// None until probed once per process; probing needs a connection.
    has_profiles: Option<bool>,
    connected: bool,
}

/// The DSP adapter, prefix `hqp`.
pub struct HqpAdapter {
    shared: RwLock<HqpShared>,
    bus: SharedBus,
}

impl HqpAdapter {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            shared: RwLock::new(HqpShared {
                host: None,
                port: DEFAULT_PORT,
                client: None,
                zone: None,
                last_status: None,
                last_state: None,
                has_profiles: None,
                connected: false,
            }),
            bus,
        }
    }

    /// Point the adapter at a DSP instance. Replacing the host drops the
    /// existing connection; the next poll reconnects lazily.
    pub async fn configure(&self, host: String, port: Option<u16>) {
        let old_client = {
            let mut shared = self.shared.write().await;
            let port = port.unwrap_or(DEFAULT_PORT);
            let changed = shared.host.as_deref() != Some(host.as_str()) || shared.port != port;
            shared.host = Some(host);
            shared.port = port;
            if changed {
                shared.connected = false;
                shared.zone = None;
                shared.has_profiles = None;
                shared.client.take()
            } else {
                None
            }
        };
        if let Some(client) = old_client {
            client.stop().await;
        }
    }

    pub async fn is_configured(&self) -> bool {
        self.shared.read().await.host.is_some()
    }

    /// The client for the configured host, created on first use.
    async fn client(&self) -> Result<HqpClient> {
        let mut shared = self.shared.write().await;
        if let Some(client) = shared.client.as_ref() {
            return Ok(client.clone());
        }
        let host = shared
            .host
            .clone()
            .ok_or(BridgeError::NotConfigured("hqplayer"))?;
        let client = HqpClient::new(host, shared.port, self.bus.clone());
        shared.client = Some(client.clone());
        Ok(client)
    }

    fn zone_id(host: &str) -> ZoneId {
        ZoneId::hqp(host)
    }

    async fn current_zone_id(&self) -> Result<ZoneId> {
        let shared = self.shared.read().await;
        shared
            .host
            .as_deref()
            .map(Self::zone_id)
            .ok_or(BridgeError::NotConfigured("hqplayer"))
    }

    /// One poll cycle: read Status + State, refresh the zone and publish
    /// change events.
    async fn poll_once(&self, client: &HqpClient) -> Result<()> {
        let status = client.get_status().await?;
        let state = client.get_state().await?;
        let caches = client.caches().await;

        // Profile support is probed once per configured instance; a failure
        // counts as "no profiles" rather than blocking every poll.
        let has_profiles = {
            let known = self.shared.read().await.has_profiles;
            match known {
                Some(flag) => flag,
                None => {
                    let flag = client
                        .matrix_profiles()
                        .await
                        .map(|profiles| !profiles.is_empty())
                        .unwrap_or(false);
                    self.shared.write().await.has_profiles = Some(flag);
                    flag
                }
            }
        };

        let (host, instance) = {
            let shared = self.shared.read().await;
            let host = shared
                .host
                .clone()
                .ok_or(BridgeError::NotConfigured("hqplayer"))?;
            let instance = caches
                .info
                .as_ref()
                .map(|i| i.name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| host.clone());
            (host, instance)
        };

        let zone_id = Self::zone_id(&host);
        let volume_range = caches.volume_range.clone().unwrap_or_default();
        let zone = Zone {
            zone_id: zone_id.clone(),
            zone_name: instance.clone(),
            output_name: caches
                .info
                .as_ref()
                .map(|i| i.engine.clone())
                .unwrap_or_default(),
            device_name: caches
                .info
                .as_ref()
                .map(|i| i.product.clone())
                .unwrap_or_default(),
            state: playback_state(state.state),
            volume_control: Some(volume_descriptor(&volume_range, state.volume_db)),
            dsp: Some(DspLink::hqplayer(&instance, &zone_id, has_profiles)),
        };

        let (previous_zone, previous_status, previous_state) = {
            let mut shared = self.shared.write().await;
            shared.connected = true;
            let prev = (
                shared.zone.replace(zone.clone()),
                shared.last_status.replace(status.clone()),
                shared.last_state.replace(state.clone()),
            );
            prev
        };

        match previous_zone {
            None => {
                info!(zone_id = %zone.zone_id, "dsp zone discovered");
                self.bus.publish(Event::ZoneDiscovered { zone });
            }
            Some(prev) if prev != zone => {
                self.bus.publish(Event::ZoneUpdated { zone });
            }
            Some(_) => {}
        }

        if previous_state.as_ref().map(|s| s.state) != Some(state.state) {
            self.bus.publish(Event::DspStateChanged {
                instance: instance.clone(),
                state: playback_state(state.state),
            });
        }

        let pipeline_changed = previous_state
            .as_ref()
            .map(|prev| {
                prev.mode_idx != state.mode_idx
                    || prev.filter_idx != state.filter_idx
                    || prev.filter1x_idx != state.filter1x_idx
                    || prev.filter_nx_idx != state.filter_nx_idx
                    || prev.shaper_idx != state.shaper_idx
                    || prev.rate_idx != state.rate_idx
            })
            .unwrap_or(false);
        if pipeline_changed {
            self.bus.publish(Event::DspPipelineChanged {
                instance: instance.clone(),
            });
        }

        if let Some(prev) = previous_status.as_ref() {
            if prev.track_id != status.track_id || prev.state != status.state {
                self.bus.publish(Event::NowPlayingChanged {
                    zone_id: zone_id.clone(),
                    now_playing: Some(now_playing_from(&status)),
                });
            }
            if prev.position != status.position {
                self.bus.publish(Event::SeekPositionChanged {
                    zone_id: zone_id.clone(),
                    position: f64::from(status.position),
                });
            }
            if prev.volume_db != status.volume_db {
                self.bus.publish(Event::VolumeChanged {
                    zone_id,
                    value: status.volume_db as f32,
                    is_muted: false,
                });
            }
        } else {
            self.bus.publish(Event::NowPlayingChanged {
                zone_id,
                now_playing: Some(now_playing_from(&status)),
            });
        }

        Ok(())
    }

    async fn mark_disconnected(&self) {
        let zone_id = {
            let mut shared = self.shared.write().await;
            if !shared.connected {
                return;
            }
            shared.connected = false;
            shared.zone.take().map(|z| z.zone_id)
        };
        if let Some(zone_id) = zone_id {
            self.bus.publish(Event::ZoneRemoved { zone_id });
        }
    }

    // ------------------------------------------------------------------
    // Pipeline view
    // ------------------------------------------------------------------

    /// Read State + Status and translate indices to names.
    pub async fn pipeline(&self) -> Result<PipelineView> {
        let client = self.client().await?;
        let state = client.get_state().await?;
        let status = client.get_status().await?;
        let caches = client.caches().await;

        let filter1x_idx = state.filter1x_idx.unwrap_or(state.filter_idx);
        let filter_nx_idx = state.filter_nx_idx.unwrap_or(state.filter_idx);
        let volume_range = caches.volume_range.clone().unwrap_or_default();

        let samplerate = if state.rate_idx == 0 {
            0
        } else {
            caches
                .rates
                .iter()
                .find(|r| r.index == state.rate_idx)
                .map(|r| r.rate)
                .unwrap_or(0)
        };

        Ok(PipelineView {
            state: playback_state(state.state),
            mode: name_by_index(&caches.modes, state.mode_idx),
            filter1x: name_by_index(&caches.filters, filter1x_idx),
            filter_nx: name_by_index(&caches.filters, filter_nx_idx),
            shaper: name_by_index(&caches.shapers, state.shaper_idx),
            samplerate,
            volume: PipelineVolume {
                value: state.volume_db,
                min: volume_range.min,
                max: volume_range.max,
                step: volume_range.step,
                is_fixed: !volume_range.enabled,
            },
            active_mode: name_by_index(&caches.modes, state.active_mode_idx),
            active_rate_hz: state.active_rate_hz,
            active_filter: status.active_filter,
            active_shaper: status.active_shaper,
            convolution: state.convolution,
            invert: state.invert,
            matrix_profile: state.matrix_profile,
        })
    }

    /// Resolve a domain name (or Hz value) to its list index and issue the
    /// corresponding Set command. The wire `value` is the State index.
    pub async fn set_pipeline(&self, setting: &str, value: &str) -> Result<()> {
        let setting: PipelineSetting = setting.parse()?;
        let client = self.client().await?;
        // Name resolution needs the per-connection caches; a cold client has
        // not populated them yet.
        client.ensure_connected().await?;
        let caches = client.caches().await;

        match setting {
            PipelineSetting::Mode => {
                let index = index_by_name(&caches.modes, value)
                    .ok_or_else(|| BridgeError::NotFound(format!("mode {value}")))?;
                client.set_mode(index).await
            }
            PipelineSetting::Filter1x => {
                let index = index_by_name(&caches.filters, value)
                    .ok_or_else(|| BridgeError::NotFound(format!("filter {value}")))?;
                client.set_filter(index, None).await
            }
            PipelineSetting::FilterNx => {
                let index = index_by_name(&caches.filters, value)
                    .ok_or_else(|| BridgeError::NotFound(format!("filter {value}")))?;
                // Preserve the configured 1x filter alongside the new Nx one.
                let state = client.get_state().await?;
                let current_1x = state.filter1x_idx.unwrap_or(state.filter_idx);
                client.set_filter(index, Some(current_1x)).await
            }
            PipelineSetting::Shaper => {
                let index = index_by_name(&caches.shapers, value)
                    .ok_or_else(|| BridgeError::NotFound(format!("shaper {value}")))?;
                client.set_shaping(index).await
            }
            PipelineSetting::Samplerate => {
                let hz: u32 = if value.eq_ignore_ascii_case("auto") {
                    0
                } else {
                    value.parse().map_err(|_| {
                        BridgeError::NotFound(format!("sample rate {value}"))
                    })?
                };
                let index = if hz == 0 {
                    0
                } else {
                    caches
                        .rates
                        .iter()
                        .find(|r| r.rate == hz)
                        .map(|r| r.index)
                        .ok_or_else(|| BridgeError::NotFound(format!("sample rate {hz}")))?
                };
                client.set_rate(index).await
            }
        }
    }

    pub async fn matrix_profiles(&self) -> Result<Vec<MatrixProfile>> {
        self.client().await?.matrix_profiles().await
    }

    pub async fn matrix_profile(&self) -> Result<Option<MatrixProfile>> {
        self.client().await?.matrix_profile().await
    }

    pub async fn set_matrix_profile(&self, name: &str) -> Result<()> {
        self.client().await?.set_matrix_profile(name).await
    }
}

fn volume_descriptor(range: &DspVolumeRange, value_db: i32) -> VolumeControl {
    VolumeControl {
        kind: if range.enabled {
            VolumeKind::Decibel
        } else {
            VolumeKind::Fixed
        },
        value: value_db as f32,
        min: range.min as f32,
        max: range.max as f32,
        step: range.step as f32,
        is_muted: false,
    }
}

/// The control protocol carries no track metadata, so the display lines stay
/// empty; transport and volume fields come from Status.
fn now_playing_from(status: &DspStatus) -> NowPlaying {
    NowPlaying {
        title: String::new(),
        artist: String::new(),
        album: String::new(),
        is_playing: status.state == 2,
        volume: Some(status.volume_db as f32),
        seek_position: Some(f64::from(status.position)),
        length: Some(f64::from(status.length)),
        image_key: None,
        artwork_url: None,
    }
}

#[async_trait]
impl AdapterLogic for HqpAdapter {
    fn prefix(&self) -> &'static str {
        "hqp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: false,
            seek: true,
            grouping: false,
        }
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        if !self.is_configured().await {
            return Err(BridgeError::NotConfigured("hqplayer"));
        }
        let client = self.client().await?;

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return Ok(()),
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once(&client).await {
                        debug!("dsp poll failed: {e}");
                        self.mark_disconnected().await;
                    }
                }
            }
        }
    }

    async fn stop(&self) {
        let client = self.shared.write().await.client.take();
        if let Some(client) = client {
            client.stop().await;
        }
        let mut shared = self.shared.write().await;
        shared.connected = false;
        shared.zone = None;
    }

    async fn get_zones(&self) -> Vec<Zone> {
        self.shared.read().await.zone.clone().into_iter().collect()
    }

    async fn get_now_playing(&self, zone_id: &str) -> Result<NowPlaying> {
        let expected = self.current_zone_id().await?;
        if zone_id != expected.as_str() {
            return Err(BridgeError::NotFound(zone_id.to_string()));
        }
        let client = self.client().await?;
        let status = client.get_status().await?;
        Ok(now_playing_from(&status))
    }

    async fn control(
        &self,
        zone_id: &str,
        action: ControlAction,
        value: Option<f64>,
    ) -> Result<()> {
        let expected = self.current_zone_id().await?;
        if zone_id != expected.as_str() {
            return Err(BridgeError::NotFound(zone_id.to_string()));
        }
        let client = self.client().await?;

        match action {
            ControlAction::Play => client.play().await,
            ControlAction::Pause => client.pause().await,
            ControlAction::PlayPause => {
                let state = client.get_state().await?;
                if state.state == 2 {
                    client.pause().await
                } else {
                    client.play().await
                }
            }
            ControlAction::Stop => client.stop_playback().await,
            ControlAction::Next => client.next().await,
            ControlAction::Previous => client.previous().await,
            ControlAction::VolumeAbsolute => {
                let target = value.ok_or(BridgeError::Unsupported("vol_abs needs a value"))?;
                client.ensure_connected().await?;
                let range = client.caches().await.volume_range.unwrap_or_default();
                let clamped = (target as i32).clamp(range.min, range.max);
                client.set_volume(clamped).await
            }
            ControlAction::VolumeRelative => {
                let delta = value.ok_or(BridgeError::Unsupported("vol_rel needs a value"))?;
                let state = client.get_state().await?;
                let range = client.caches().await.volume_range.unwrap_or_default();
                let clamped = (state.volume_db + delta as i32).clamp(range.min, range.max);
                client.set_volume(clamped).await
            }
            ControlAction::Seek => {
                let position = value.ok_or(BridgeError::Unsupported("seek needs a value"))?;
                client.seek(position.max(0.0) as u32).await
            }
        }
    }

    async fn status(&self) -> AdapterStatus {
        let shared = self.shared.read().await;
        AdapterStatus {
            configured: shared.host.is_some(),
            connected: shared.connected,
            detail: shared.host.clone(),
        }
    }
}
