//! The capability surface every adapter implements.
//!
//! Lifecycle (supervision, restart budget, ACK publication) lives in
//! [`crate::adapters::handle::AdapterHandle`]; implementors only provide the
//! protocol work.

use async_trait::async_trait;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::bus::{ImageData, NowPlaying, SharedBus, Zone};
use crate::error::{BridgeError, Result};

/// Context handed to adapter logic for one run.
pub struct AdapterContext {
    /// Bus for publishing zone and lifecycle events.
    pub bus: SharedBus,
    /// Cancelled when the adapter must wind down.
    pub shutdown: CancellationToken,
}

/// Transport/volume actions routable to any adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    PlayPause,
    Play,
    Pause,
    Stop,
    Next,
    Previous,
    /// Signed delta in the zone's volume scale.
    VolumeRelative,
    /// Absolute level in the zone's volume scale.
    VolumeAbsolute,
    /// Position in seconds.
    Seek,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlayPause => "play_pause",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::VolumeRelative => "vol_rel",
            Self::VolumeAbsolute => "vol_abs",
            Self::Seek => "seek",
        }
    }

    /// True when the action is meaningless without a value argument.
    pub fn needs_value(self) -> bool {
        matches!(self, Self::VolumeRelative | Self::VolumeAbsolute | Self::Seek)
    }
}

impl FromStr for ControlAction {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "play_pause" => Ok(Self::PlayPause),
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "stop" => Ok(Self::Stop),
            "next" => Ok(Self::Next),
            "previous" | "prev" => Ok(Self::Previous),
            "vol_rel" => Ok(Self::VolumeRelative),
            "vol_abs" => Ok(Self::VolumeAbsolute),
            "seek" => Ok(Self::Seek),
            other => Err(BridgeError::NotFound(format!("unknown action {other}"))),
        }
    }
}

/// Capability flags callers can check before issuing a command, instead of
/// round-tripping an `Unsupported` error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub images: bool,
    pub seek: bool,
    pub grouping: bool,
}

/// Connection snapshot for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct AdapterStatus {
    pub configured: bool,
    pub connected: bool,
    pub detail: Option<String>,
}

/// Adapter-specific logic. Object-safe so the coordinator can route over a
/// heterogeneous registry.
#[async_trait]
pub trait AdapterLogic: Send + Sync + 'static {
    /// Zone-id prefix this adapter owns (e.g. `hqp`, `lms`).
    fn prefix(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Main loop: discover zones, poll or subscribe, publish events on
    /// `ctx.bus`. Returns when `ctx.shutdown` fires (clean stop) or with an
    /// error (the handle applies its restart policy).
    async fn run(&self, ctx: AdapterContext) -> Result<()>;

    /// Cooperative shutdown. Must release all I/O resources before
    /// returning; the coordinator waits on this acknowledgement.
    async fn stop(&self);

    /// Current zones from this adapter's own cache.
    async fn get_zones(&self) -> Vec<Zone>;

    /// Now-playing for one of this adapter's zones, derived on demand.
    async fn get_now_playing(&self, zone_id: &str) -> Result<NowPlaying>;

    /// Execute a control action against one of this adapter's zones.
    async fn control(&self, zone_id: &str, action: ControlAction, value: Option<f64>)
        -> Result<()>;

    /// Fetch artwork by backend-specific key.
    async fn get_image(&self, _image_key: &str) -> Result<ImageData> {
        Err(BridgeError::Unsupported("images"))
    }

    /// HTTP basic-auth credentials for this adapter's backend, used when an
    /// image key is an absolute URL into that backend.
    fn basic_auth(&self) -> Option<(String, String)> {
        None
    }

    async fn status(&self) -> AdapterStatus {
        AdapterStatus::default()
    }
}
