//! Typed events and the zone domain model carried on the bus.
//!
//! Everything here crosses the SSE boundary unchanged, so the serde shapes
//! are part of the external contract: events serialize as
//! `{"type": "<EventName>", "payload": {...}}` and zones carry the JSON
//! layout hardware knobs and home-automation clients already parse.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Adapter prefixes this bridge routes on. The prefix of a zone id is
/// authoritative: there is no separate "source" attribute.
pub const KNOWN_PREFIXES: &[&str] = &["roon", "lms", "hqp", "upnp", "openhome"];

/// A zone identifier enforcing the `<prefix>:<opaque>` format.
///
/// Adapters that emit raw backend ids onto the bus would make the aggregator
/// silently drop updates; constructing ids through this type prevents that
/// class of bug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    /// Build a zone id from an adapter prefix and a backend-opaque id.
    pub fn new(prefix: &str, raw: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", prefix, raw.as_ref()))
    }

    pub fn hqp(raw: impl AsRef<str>) -> Self {
        Self::new("hqp", raw)
    }

    pub fn lms(raw: impl AsRef<str>) -> Self {
        Self::new("lms", raw)
    }

    /// Accept an already-prefixed id, rejecting unknown prefixes.
    pub fn parse(s: impl AsRef<str>) -> Option<Self> {
        let s = s.as_ref();
        KNOWN_PREFIXES
            .iter()
            .any(|p| s.starts_with(p) && s[p.len()..].starts_with(':'))
            .then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The adapter prefix, e.g. `hqp`.
    pub fn prefix(&self) -> &str {
        self.0.split(':').next().unwrap_or("")
    }

    /// The backend-opaque remainder after the first `:`.
    pub fn raw_id(&self) -> &str {
        match self.0.find(':') {
            Some(pos) => &self.0[pos + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ZoneId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<ZoneId> for String {
    fn from(id: ZoneId) -> Self {
        id.0
    }
}

/// Playback state of a zone.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Stopped,
    Paused,
    Playing,
    #[default]
    Unknown,
}

impl PlaybackState {
    pub fn is_playing(self) -> bool {
        matches!(self, Self::Playing)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Paused => "paused",
            Self::Playing => "playing",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

impl From<&str> for PlaybackState {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "playing" | "play" => Self::Playing,
            "paused" | "pause" => Self::Paused,
            "stopped" | "stop" => Self::Stopped,
            _ => Self::Unknown,
        }
    }
}

/// How a zone's volume scale behaves.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    /// Plain number scale, typically 0..100.
    #[default]
    Number,
    /// Decibel scale, typically -60..0.
    Decibel,
    /// The output has no adjustable volume.
    Fixed,
}

/// Volume control descriptor for a zone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeControl {
    pub kind: VolumeKind,
    pub value: f32,
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub is_muted: bool,
}

impl VolumeControl {
    /// Clamp a target value into this control's range.
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }
}

/// Link from a zone to the DSP instance processing its audio.
///
/// `pipeline` and `profiles` are ready-made HTTP paths so web clients need no
/// URL assembly of their own; `profiles` is present iff the linked instance
/// supports profile switching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DspLink {
    #[serde(rename = "type")]
    pub kind: String,
    pub instance: String,
    pub pipeline: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<String>,
}

impl DspLink {
    /// Standard link for an HQPlayer-style DSP instance.
    pub fn hqplayer(instance: &str, zone_id: &ZoneId, has_profiles: bool) -> Self {
        Self {
            kind: "hqplayer".to_string(),
            instance: instance.to_string(),
            pipeline: format!(
                "/hqp/pipeline?zone_id={}",
                urlencoding::encode(zone_id.as_str())
            ),
            profiles: has_profiles.then(|| "/hqp/profiles".to_string()),
        }
    }
}

/// Unified zone representation across all adapters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Zone {
    pub zone_id: ZoneId,
    pub zone_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_name: String,
    pub state: PlaybackState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_control: Option<VolumeControl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dsp: Option<DspLink>,
}

/// Now-playing snapshot for a zone. Derived on demand from the owning
/// adapter; never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NowPlaying {
    /// Display line 1.
    pub title: String,
    /// Display line 2.
    pub artist: String,
    /// Display line 3.
    pub album: String,
    pub is_playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
    /// Seek position in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek_position: Option<f64>,
    /// Track length in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<f64>,
    /// Opaque artwork key: an absolute URL or a backend coverart id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_key: Option<String>,
    /// Direct artwork URL when the backend exposes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
}

/// Raw image bytes plus content type, as served by `get_image`.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Events flowing on the in-process bus.
///
/// Serialized one per SSE data frame as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    /// A new zone surfaced from an adapter.
    ZoneDiscovered { zone: Zone },

    /// An existing zone changed; carries the full replacement state.
    ZoneUpdated { zone: Zone },

    /// A zone went away (offline, adapter disconnect).
    ZoneRemoved { zone_id: ZoneId },

    /// Track metadata changed for a zone.
    NowPlayingChanged {
        zone_id: ZoneId,
        now_playing: Option<NowPlaying>,
    },

    /// Volume or mute changed for a zone.
    VolumeChanged {
        zone_id: ZoneId,
        value: f32,
        is_muted: bool,
    },

    /// Playback position progressed, in seconds.
    SeekPositionChanged { zone_id: ZoneId, position: f64 },

    /// An adapter reached its backend.
    AdapterConnected {
        adapter: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// An adapter lost its backend.
    AdapterDisconnected {
        adapter: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// An adapter is about to stop; the aggregator flushes its zones.
    AdapterStopping { adapter: String },

    /// An adapter finished stopping and released its resources (the ACK the
    /// coordinator waits on).
    AdapterStopped { adapter: String },

    /// The aggregator dropped every zone owned by an adapter.
    ZonesFlushed {
        adapter: String,
        zone_ids: Vec<ZoneId>,
    },

    /// Process-wide shutdown begins. Published before ACKs are awaited, so
    /// every subscriber observes it.
    ShuttingDown,

    /// The DSP pipeline configuration changed (filters, shaper, rate, mode).
    DspPipelineChanged { instance: String },

    /// The DSP transport state changed (stopped/paused/playing).
    DspStateChanged {
        instance: String,
        state: PlaybackState,
    },

    /// An LMS player changed playback state.
    LmsPlayerStateChanged {
        player_id: String,
        state: PlaybackState,
    },
}

impl Event {
    /// Stable event name, identical to the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ZoneDiscovered { .. } => "ZoneDiscovered",
            Self::ZoneUpdated { .. } => "ZoneUpdated",
            Self::ZoneRemoved { .. } => "ZoneRemoved",
            Self::NowPlayingChanged { .. } => "NowPlayingChanged",
            Self::VolumeChanged { .. } => "VolumeChanged",
            Self::SeekPositionChanged { .. } => "SeekPositionChanged",
            Self::AdapterConnected { .. } => "AdapterConnected",
            Self::AdapterDisconnected { .. } => "AdapterDisconnected",
            Self::AdapterStopping { .. } => "AdapterStopping",
            Self::AdapterStopped { .. } => "AdapterStopped",
            Self::ZonesFlushed { .. } => "ZonesFlushed",
            Self::ShuttingDown => "ShuttingDown",
            Self::DspPipelineChanged { .. } => "DspPipelineChanged",
            Self::DspStateChanged { .. } => "DspStateChanged",
            Self::LmsPlayerStateChanged { .. } => "LmsPlayerStateChanged",
        }
    }

    /// True for events that change the aggregator's zone map.
    pub fn is_zone_event(&self) -> bool {
        matches!(
            self,
            Self::ZoneDiscovered { .. }
                | Self::ZoneUpdated { .. }
                | Self::ZoneRemoved { .. }
                | Self::ZonesFlushed { .. }
        )
    }
}
