#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock LMS JSON-RPC endpoint.
//!
//! Serves `POST /jsonrpc.js` over a hand-rolled HTTP/1.1 responder; just
//! enough of the protocol for the adapter's `players`, `status` and control
//! requests.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockPlayer {
    pub playerid: String,
    pub name: String,
    pub mode: String,
    pub volume: i64,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration: f64,
    pub time: f64,
    pub coverid: Option<String>,
}

impl MockPlayer {
    pub fn new(playerid: &str, name: &str) -> Self {
        Self {
            playerid: playerid.to_string(),
            name: name.to_string(),
            mode: "stop".to_string(),
            volume: 50,
            title: String::new(),
            artist: String::new(),
            album: String::new(),
            duration: 0.0,
            time: 0.0,
            coverid: None,
        }
    }
}

struct Shared {
    players: HashMap<String, MockPlayer>,
    /// Raw `params` arrays received, for wire assertions.
    commands: Vec<Value>,
}

pub struct MockLmsServer {
    addr: SocketAddr,
    shared: Arc<RwLock<Shared>>,
    accept_task: JoinHandle<()>,
}

impl MockLmsServer {
    pub async fn start() -> Self {
        let shared = Arc::new(RwLock::new(Shared {
            players: HashMap::new(),
            commands: Vec::new(),
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let shared = accept_shared.clone();
                        tokio::spawn(handle_http(stream, shared));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub async fn add_player(&self, playerid: &str, name: &str) {
        self.shared
            .write()
            .await
            .players
            .insert(playerid.to_string(), MockPlayer::new(playerid, name));
    }

    pub async fn remove_player(&self, playerid: &str) {
        self.shared.write().await.players.remove(playerid);
    }

    pub async fn update_player<F: FnOnce(&mut MockPlayer)>(&self, playerid: &str, mutate: F) {
        if let Some(player) = self.shared.write().await.players.get_mut(playerid) {
            mutate(player);
        }
    }

    pub async fn commands(&self) -> Vec<Value> {
        self.shared.read().await.commands.clone()
    }

    pub async fn stop(self) {
        self.accept_task.abort();
    }
}

async fn handle_http(stream: TcpStream, shared: Arc<RwLock<Shared>>) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        // Request line + headers.
        let mut line = String::new();
        if matches!(reader.read_line(&mut line).await, Ok(0) | Err(_)) {
            break;
        }
        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if matches!(reader.read_line(&mut header).await, Ok(0) | Err(_)) {
                return;
            }
            let header = header.trim();
            if header.is_empty() {
                break;
            }
            if let Some(value) = header
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(str::trim)
                .and_then(|v| v.parse().ok())
            {
                content_length = value;
            }
        }

        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            break;
        }

        let response_body = match serde_json::from_slice::<Value>(&body) {
            Ok(request) => dispatch(&request, &shared).await.to_string(),
            Err(_) => json!({"error": "bad request"}).to_string(),
        };

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            response_body.len(),
            response_body
        );
        if writer.write_all(response.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn dispatch(request: &Value, shared: &Arc<RwLock<Shared>>) -> Value {
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let player_id = params
        .get(0)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let command = params.get(1).cloned().unwrap_or(Value::Null);
    let verb = command
        .get(0)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let mut shared = shared.write().await;
    shared.commands.push(params.clone());

    let result = match verb.as_str() {
        "players" => {
            let players: Vec<Value> = shared
                .players
                .values()
                .map(|p| {
                    json!({
                        "playerid": p.playerid,
                        "name": p.name,
                        "model": "squeezelite",
                        "connected": 1,
                        "power": 1,
                    })
                })
                .collect();
            json!({ "players_loop": players })
        }
        "status" => match shared.players.get(&player_id) {
            Some(p) => json!({
                "mode": p.mode,
                "power": 1,
                "mixer volume": p.volume,
                "time": p.time,
                "playlist_loop": [{
                    "title": p.title,
                    "artist": p.artist,
                    "album": p.album,
                    "duration": p.duration,
                    "coverid": p.coverid,
                }],
            }),
            None => json!({}),
        },
        "play" => {
            if let Some(p) = shared.players.get_mut(&player_id) {
                p.mode = "play".to_string();
            }
            json!({})
        }
        "pause" => {
            if let Some(p) = shared.players.get_mut(&player_id) {
                let explicit = command.get(1).and_then(Value::as_i64);
                p.mode = match explicit {
                    Some(1) => "pause".to_string(),
                    Some(0) => "play".to_string(),
                    // Bare pause toggles.
                    _ => {
                        if p.mode == "play" {
                            "pause".to_string()
                        } else {
                            "play".to_string()
                        }
                    }
                };
            }
            json!({})
        }
        "stop" => {
            if let Some(p) = shared.players.get_mut(&player_id) {
                p.mode = "stop".to_string();
            }
            json!({})
        }
        "mixer" => {
            if let Some(p) = shared.players.get_mut(&player_id) {
                if let Some(vol) = command.get(2) {
                    if let Some(n) = vol.as_i64() {
                        p.volume = n.clamp(0, 100);
                    } else if let Some(s) = vol.as_str() {
                        if let Ok(delta) = s.parse::<i64>() {
                            p.volume = (p.volume + delta).clamp(0, 100);
                        }
                    }
                }
            }
            json!({})
        }
        "time" => {
            if let Some(p) = shared.players.get_mut(&player_id) {
                p.time = command.get(1).and_then(Value::as_f64).unwrap_or(0.0);
            }
            json!({})
        }
        _ => json!({}),
    };

    json!({ "id": 1, "result": result })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_players_query() {
        let server = MockLmsServer::start().await;
        server.add_player("aa:bb", "Kitchen").await;

        let client = reqwest::Client::new();
        let response: Value = client
            .post(format!("http://{}/jsonrpc.js", server.addr()))
            .json(&json!({
                "id": 1,
                "method": "slim.request",
                "params": ["", ["players", 0, 100]],
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let players = response["result"]["players_loop"].as_array().unwrap();
        assert_eq!(players.len(), 1);
        assert_eq!(players[0]["name"], "Kitchen");
        server.stop().await;
    }
}
