//! LMS (Lyrion/Logitech Media Server) adapter, prefix `lms`.
//!
//! Speaks the JSON-RPC protocol over HTTP (`POST /jsonrpc.js`, method
//! `slim.request`). Players become zones `lms:<playerid>`; playback state
//! and track metadata come from per-player `status` queries polled on a
//! fixed interval.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::adapters::traits::{
    AdapterContext, AdapterLogic, AdapterStatus, Capabilities, ControlAction,
};
use crate::bus::{
    Event, ImageData, NowPlaying, PlaybackState, SharedBus, VolumeControl, VolumeKind, Zone,
    ZoneId,
};
use crate::error::{BridgeError, Result};

const DEFAULT_PORT: u16 = 9000;
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Tags requested from the `status` query: artist, album, duration, track
/// artwork and coverid.
const STATUS_TAGS: &str = "tags:aAdltKc";

/// One player as assembled from `players` + `status` queries.
#[derive(Debug, Clone, Default, PartialEq)]
struct LmsPlayer {
    playerid: String,
    name: String,
    model: String,
    connected: bool,
    power: bool,
    state: PlaybackState,
    volume: i32,
    time: f64,
    duration: f64,
    title: String,
    artist: String,
    album: String,
    coverid: Option<String>,
    artwork_url: Option<String>,
}

struct LmsShared {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    connected: bool,
    players: HashMap<String, LmsPlayer>,
}

pub struct LmsAdapter {
    shared: RwLock<LmsShared>,
    client: Client,
    bus: SharedBus,
}

impl LmsAdapter {
    pub fn new(bus: SharedBus) -> Self {
        Self {
            shared: RwLock::new(LmsShared {
                host: None,
                port: DEFAULT_PORT,
                username: None,
                password: None,
                connected: false,
                players: HashMap::new(),
            }),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            bus,
        }
    }

    pub async fn configure(
        &self,
        host: String,
        port: Option<u16>,
        username: Option<String>,
        password: Option<String>,
    ) {
        let mut shared = self.shared.write().await;
        shared.host = Some(host);
        shared.port = port.unwrap_or(DEFAULT_PORT);
        shared.username = username;
        shared.password = password;
        shared.connected = false;
    }

    pub async fn is_configured(&self) -> bool {
        self.shared.read().await.host.is_some()
    }

    async fn base_url(&self) -> Result<String> {
        let shared = self.shared.read().await;
        let host = shared
            .host
            .as_ref()
            .ok_or(BridgeError::NotConfigured("lms"))?;
        Ok(format!("http://{}:{}", host, shared.port))
    }

    /// Execute one JSON-RPC command against the server.
    async fn execute(&self, player_id: Option<&str>, params: Vec<Value>) -> Result<Value> {
        let url = format!("{}/jsonrpc.js", self.base_url().await?);

        let body = json!({
            "id": 1,
            "method": "slim.request",
            "params": [player_id.unwrap_or(""), params],
        });

        let mut request = self.client.post(&url).json(&body);
        {
            let shared = self.shared.read().await;
            if let (Some(user), Some(pass)) = (&shared.username, &shared.password) {
                request = request.basic_auth(user, Some(pass));
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::Other(format!(
                "lms request failed: {}",
                response.status()
            )));
        }

        let data: Value = response.json().await?;
        if let Some(error) = data.get("error") {
            if !error.is_null() {
                return Err(BridgeError::ProtocolMalformed(format!("lms error: {error}")));
            }
        }
        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn fetch_players(&self) -> Result<Vec<LmsPlayer>> {
        let result = self
            .execute(None, vec![json!("players"), json!(0), json!(100)])
            .await?;

        let players = result
            .get("players_loop")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(players
            .into_iter()
            .filter_map(|p| {
                let playerid = p.get("playerid")?.as_str()?.to_string();
                Some(LmsPlayer {
                    playerid,
                    name: str_field(&p, "name"),
                    model: str_field(&p, "model"),
                    connected: int_field(&p, "connected") == 1,
                    power: int_field(&p, "power") == 1,
                    ..Default::default()
                })
            })
            .collect())
    }

    async fn fetch_status(&self, player: &mut LmsPlayer) -> Result<()> {
        let base_url = self.base_url().await?;
        let result = self
            .execute(
                Some(&player.playerid),
                vec![json!("status"), json!("-"), json!(1), json!(STATUS_TAGS)],
            )
            .await?;

        let mode = result.get("mode").and_then(Value::as_str).unwrap_or("stop");
        player.state = PlaybackState::from(mode);
        player.power = int_field(&result, "power") == 1;
        player.volume = result
            .get("mixer volume")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        player.time = result.get("time").and_then(Value::as_f64).unwrap_or(0.0);

        let track = result
            .get("playlist_loop")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first())
            .cloned()
            .unwrap_or(Value::Null);

        player.duration = track
            .get("duration")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        player.title = str_field(&track, "title");
        player.artist = str_field(&track, "artist");
        player.album = str_field(&track, "album");

        player.coverid = track
            .get("coverid")
            .or_else(|| track.get("artwork_track_id"))
            .or_else(|| track.get("id"))
            .and_then(|v| {
                v.as_str()
                    .map(str::to_string)
                    .or_else(|| v.as_i64().map(|n| n.to_string()))
            });

        player.artwork_url = track
            .get("artwork_url")
            .and_then(Value::as_str)
            .map(|url| {
                if url.starts_with('/') {
                    format!("{base_url}{url}")
                } else {
                    url.to_string()
                }
            });

        Ok(())
    }

    /// One poll cycle: refresh the player set and publish zone diffs.
    async fn poll_once(&self) -> Result<()> {
        let mut players = self.fetch_players().await?;
        for player in players.iter_mut() {
            if let Err(e) = self.fetch_status(player).await {
                warn!(player = %player.playerid, "lms status query failed: {e}");
            }
        }

        let fresh: HashMap<String, LmsPlayer> = players
            .into_iter()
            .map(|p| (p.playerid.clone(), p))
            .collect();

        let previous = {
            let mut shared = self.shared.write().await;
            shared.connected = true;
            std::mem::replace(&mut shared.players, fresh.clone())
        };

        // Diff the player sets into zone lifecycle events.
        for (id, player) in &fresh {
            let zone = zone_from(player);
            match previous.get(id) {
                None => {
                    info!(player = %id, "lms player discovered");
                    self.bus.publish(Event::ZoneDiscovered { zone });
                }
                Some(old) => {
                    if old.name != player.name
                        || old.state != player.state
                        || old.volume != player.volume
                    {
                        self.bus.publish(Event::ZoneUpdated { zone });
                    }
                    if old.state != player.state {
                        self.bus.publish(Event::LmsPlayerStateChanged {
                            player_id: id.clone(),
                            state: player.state,
                        });
                    }
                    if old.title != player.title || old.album != player.album {
                        self.bus.publish(Event::NowPlayingChanged {
                            zone_id: ZoneId::lms(id),
                            now_playing: Some(now_playing_from(player)),
                        });
                    }
                    if old.time != player.time {
                        self.bus.publish(Event::SeekPositionChanged {
                            zone_id: ZoneId::lms(id),
                            position: player.time,
                        });
                    }
                    if old.volume != player.volume {
                        self.bus.publish(Event::VolumeChanged {
                            zone_id: ZoneId::lms(id),
                            value: player.volume as f32,
                            is_muted: player.volume == 0,
                        });
                    }
                }
            }
        }
        for id in previous.keys() {
            if !fresh.contains_key(id) {
                info!(player = %id, "lms player gone");
                self.bus.publish(Event::ZoneRemoved {
                    zone_id: ZoneId::lms(id),
                });
            }
        }

        Ok(())
    }

    async fn player(&self, zone_id: &str) -> Result<LmsPlayer> {
        let id = ZoneId::parse(zone_id)
            .filter(|z| z.prefix() == "lms")
            .ok_or_else(|| BridgeError::NotFound(zone_id.to_string()))?;
        self.shared
            .read()
            .await
            .players
            .get(id.raw_id())
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(zone_id.to_string()))
    }
}

fn str_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn int_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

fn zone_from(player: &LmsPlayer) -> Zone {
    Zone {
        zone_id: ZoneId::lms(&player.playerid),
        zone_name: player.name.clone(),
        output_name: player.name.clone(),
        device_name: player.model.clone(),
        state: player.state,
        volume_control: Some(VolumeControl {
            kind: VolumeKind::Number,
            value: player.volume as f32,
            min: 0.0,
            max: 100.0,
            step: 1.0,
            is_muted: player.volume == 0,
        }),
        dsp: None,
    }
}

fn now_playing_from(player: &LmsPlayer) -> NowPlaying {
    NowPlaying {
        title: player.title.clone(),
        artist: player.artist.clone(),
        album: player.album.clone(),
        is_playing: player.state.is_playing(),
        volume: Some(player.volume as f32),
        seek_position: Some(player.time),
        length: (player.duration > 0.0).then_some(player.duration),
        image_key: player
            .artwork_url
            .clone()
            .or_else(|| player.coverid.clone()),
        artwork_url: player.artwork_url.clone(),
    }
}

#[async_trait]
impl AdapterLogic for LmsAdapter {
    fn prefix(&self) -> &'static str {
        "lms"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            images: true,
            seek: true,
            grouping: false,
        }
    }

    async fn run(&self, ctx: AdapterContext) -> Result<()> {
        if !self.is_configured().await {
            return Err(BridgeError::NotConfigured("lms"));
        }

        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => return Ok(()),
                _ = poll.tick() => {
                    if let Err(e) = self.poll_once().await {
                        debug!("lms poll failed: {e}");
                        self.shared.write().await.connected = false;
                    }
                }
            }
        }
    }

    async fn stop(&self) {
        // The HTTP client holds no persistent sockets worth tearing down;
        // dropping cached players is the whole cleanup.
        let mut shared = self.shared.write().await;
        shared.connected = false;
        shared.players.clear();
    }

    async fn get_zones(&self) -> Vec<Zone> {
        let shared = self.shared.read().await;
        shared.players.values().map(zone_from).collect()
    }

    async fn get_now_playing(&self, zone_id: &str) -> Result<NowPlaying> {
        let mut player = self.player(zone_id).await?;
        // Derive fresh on demand; the cached copy is only a fallback shape.
        if self.fetch_status(&mut player).await.is_ok() {
            let mut shared = self.shared.write().await;
            shared
                .players
                .insert(player.playerid.clone(), player.clone());
        }
        Ok(now_playing_from(&player))
    }

    async fn control(
        &self,
        zone_id: &str,
        action: ControlAction,
        value: Option<f64>,
    ) -> Result<()> {
        let player = self.player(zone_id).await?;
        let id = player.playerid.as_str();

        let params: Vec<Value> = match action {
            ControlAction::Play => vec![json!("play")],
            ControlAction::Pause => vec![json!("pause"), json!(1)],
            // Bare "pause" toggles on LMS.
            ControlAction::PlayPause => vec![json!("pause")],
            ControlAction::Stop => vec![json!("stop")],
            ControlAction::Next => vec![json!("playlist"), json!("index"), json!("+1")],
            ControlAction::Previous => vec![json!("playlist"), json!("index"), json!("-1")],
            ControlAction::VolumeAbsolute => {
                let v = value.ok_or(BridgeError::Unsupported("vol_abs needs a value"))? as i64;
                vec![json!("mixer"), json!("volume"), json!(v.clamp(0, 100))]
            }
            ControlAction::VolumeRelative => {
                let delta = value.ok_or(BridgeError::Unsupported("vol_rel needs a value"))? as i64;
                let rendered = if delta >= 0 {
                    format!("+{delta}")
                } else {
                    delta.to_string()
                };
                vec![json!("mixer"), json!("volume"), json!(rendered)]
            }
            ControlAction::Seek => {
                let secs = value.ok_or(BridgeError::Unsupported("seek needs a value"))?;
                vec![json!("time"), json!(secs.max(0.0))]
            }
        };

        self.execute(Some(id), params).await?;
        Ok(())
    }

    async fn get_image(&self, image_key: &str) -> Result<ImageData> {
        let url = if image_key.starts_with("http://") || image_key.starts_with("https://") {
            image_key.to_string()
        } else {
            format!("{}/music/{}/cover.jpg", self.base_url().await?, image_key)
        };

        let mut request = self.client.get(&url);
        {
            let shared = self.shared.read().await;
            if let (Some(user), Some(pass)) = (&shared.username, &shared.password) {
                request = request.basic_auth(user, Some(pass));
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BridgeError::NotFound(format!("artwork {image_key}")));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        let data = response.bytes().await?.to_vec();
        Ok(ImageData { content_type, data })
    }

    fn basic_auth(&self) -> Option<(String, String)> {
        // Used by the facade when fetching absolute artwork URLs that point
        // back into this server. Credentials rarely change, so a blocking
        // read here would be overkill; take the cheap try_read path.
        let shared = self.shared.try_read().ok()?;
        match (&shared.username, &shared.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }

    async fn status(&self) -> AdapterStatus {
        let shared = self.shared.read().await;
        AdapterStatus {
            configured: shared.host.is_some(),
            connected: shared.connected,
            detail: shared
                .host
                .as_ref()
                .map(|h| format!("{h}:{} ({} players)", shared.port, shared.players.len())),
        }
    }
}
