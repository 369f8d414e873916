#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Mock DSP controller speaking the TCP/XML protocol on an ephemeral port.
//!
//! Faithful to the two response shapes of the real server: list commands can
//! answer either as one document with inline children or as an opening
//! document, one item document per line, and a closing document. Set
//! commands mutate held state so Set -> State round-trips are observable,
//! and every received request line is recorded for wire-level assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockItem {
    pub index: u32,
    pub value: u32,
    pub name: String,
}

pub fn item(index: u32, value: u32, name: &str) -> MockItem {
    MockItem {
        index,
        value,
        name: name.to_string(),
    }
}

/// Mutable server state.
#[derive(Debug, Clone)]
pub struct MockDspState {
    /// 0=stopped, 1=paused, 2=playing.
    pub state: u8,
    pub mode_idx: u32,
    pub filter_idx: u32,
    pub filter1x_idx: u32,
    pub filter_nx_idx: u32,
    pub shaper_idx: u32,
    pub rate_idx: u32,
    pub volume_db: i32,
    pub active_mode_idx: u32,
    pub active_rate_hz: u32,
    pub position: u32,
    pub length: u32,
    pub matrix_profile: String,

    pub modes: Vec<MockItem>,
    pub filters: Vec<MockItem>,
    pub shapers: Vec<MockItem>,
    /// (index, rate_hz)
    pub rates: Vec<(u32, u32)>,
    pub profiles: Vec<&'static str>,

    /// Send list replies as open/items/close instead of one document.
    pub streaming_lists: bool,
    /// Inject a garbage line inside streamed lists.
    pub inject_noise: bool,
    /// Swallow requests without answering (for timeout tests).
    pub stall: bool,
}

impl Default for MockDspState {
    fn default() -> Self {
        Self {
            state: 0,
            mode_idx: 1,
            filter_idx: 0,
            filter1x_idx: 0,
            filter_nx_idx: 0,
            shaper_idx: 0,
            rate_idx: 2,
            volume_db: -20,
            active_mode_idx: 1,
            active_rate_hz: 352_800,
            position: 0,
            length: 0,
            matrix_profile: String::new(),
            // index and value intentionally disagree on some entries.
            modes: vec![item(0, 0, "[source]"), item(1, 3, "SDM"), item(2, 1, "PCM")],
            filters: vec![
                item(0, 0, "none"),
                item(1, 1, "IIR"),
                item(2, 57, "IIR2"),
                item(19, 15, "poly-sinc-ext"),
            ],
            shapers: vec![
                item(0, 0, "none"),
                item(1, 1, "TPDF"),
                item(2, 4, "ASDM7"),
            ],
            rates: vec![(0, 44_100), (1, 48_000), (2, 352_800), (3, 705_600)],
            profiles: vec!["Default", "Night"],
            streaming_lists: false,
            inject_noise: false,
            stall: false,
        }
    }
}

pub struct MockDspServer {
    addr: SocketAddr,
    state: Arc<RwLock<MockDspState>>,
    requests: Arc<RwLock<Vec<String>>>,
    accept_task: JoinHandle<()>,
    kill: broadcast::Sender<()>,
}

impl MockDspServer {
    pub async fn start() -> Self {
        Self::start_with(MockDspState::default()).await
    }

    pub async fn start_with(initial: MockDspState) -> Self {
        let state = Arc::new(RwLock::new(initial));
        let requests = Arc::new(RwLock::new(Vec::new()));
        let (kill, _) = broadcast::channel(4);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_state = state.clone();
        let accept_requests = requests.clone();
        let accept_kill = kill.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = accept_state.clone();
                        let requests = accept_requests.clone();
                        let kill = accept_kill.subscribe();
                        tokio::spawn(handle_connection(stream, state, requests, kill));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            addr,
            state,
            requests,
            accept_task,
            kill,
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

    /// Raw request lines received so far, in arrival order.
    pub async fn requests(&self) -> Vec<String> {
        self.requests.read().await.clone()
    }

    pub async fn clear_requests(&self) {
        self.requests.write().await.clear();
    }

    pub async fn update<F: FnOnce(&mut MockDspState)>(&self, mutate: F) {
        let mut state = self.state.write().await;
        mutate(&mut state);
    }

    pub async fn snapshot(&self) -> MockDspState {
        self.state.read().await.clone()
    }

    /// Drop every open client connection, keeping the listener alive.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    pub async fn stop(self) {
        let _ = self.kill.send(());
        self.accept_task.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<RwLock<MockDspState>>,
    requests: Arc<RwLock<Vec<String>>>,
    mut kill: broadcast::Receiver<()>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        tokio::select! {
            _ = kill.recv() => break,
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let request = line.trim().to_string();
                        if request.is_empty() {
                            continue;
                        }
                        requests.write().await.push(request.clone());

                        let stalled = { state.read().await.stall };
                        if stalled {
                            continue;
                        }

                        let response = respond(&request, &state).await;
                        if writer.write_all(response.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn command_name(request: &str) -> String {
    let rest = match request.find("?>") {
        Some(pos) => request[pos + 2..].trim_start(),
        None => request,
    };
    let rest = rest.trim_start_matches('<');
    rest.chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect()
}

fn attr(request: &str, key: &str) -> Option<String> {
    let pattern = format!("{key}=\"");
    let start = request.find(&pattern)? + pattern.len();
    let rest = &request[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn attr_u32(request: &str, key: &str) -> Option<u32> {
    attr(request, key).and_then(|s| s.parse().ok())
}

/// Render a list either as a single document or as a streamed sequence.
fn render_list(root: &str, rows: Vec<String>, streaming: bool, noise: bool) -> String {
    if streaming {
        let mut out = format!("<?xml version=\"1.0\"?>\n<{root}>\n");
        if noise {
            out.push_str("%% spurious diagnostics line %%\n");
        }
        for row in rows {
            out.push_str(&row);
            out.push('\n');
        }
        out.push_str(&format!("</{root}>\n"));
        out
    } else {
        let mut out = format!("<?xml version=\"1.0\"?><{root}>");
        for row in rows {
            out.push_str(&row);
        }
        out.push_str(&format!("</{root}>\n"));
        out
    }
}

async fn respond(request: &str, state: &Arc<RwLock<MockDspState>>) -> String {
    let command = command_name(request);

    // Mutations first, under a write lock.
    {
        let mut s = state.write().await;
        match command.as_str() {
            "SetMode" => {
                if let Some(v) = attr_u32(request, "value") {
                    s.mode_idx = v;
                }
                return ok();
            }
            "SetFilter" => {
                // A bare value targets the primary/1x filter; with value1x
                // present, value targets the Nx filter and value1x the 1x.
                match (attr_u32(request, "value"), attr_u32(request, "value1x")) {
                    (Some(v), None) => {
                        s.filter_idx = v;
                        s.filter1x_idx = v;
                    }
                    (Some(v), Some(v1x)) => {
                        s.filter_nx_idx = v;
                        s.filter1x_idx = v1x;
                        s.filter_idx = v;
                    }
                    _ => {}
                }
                return ok();
            }
            "SetShaping" => {
                if let Some(v) = attr_u32(request, "value") {
                    s.shaper_idx = v;
                }
                return ok();
            }
            "SetRate" => {
                if let Some(v) = attr_u32(request, "value") {
                    s.rate_idx = v;
                }
                return ok();
            }
            "Volume" => {
                if let Some(v) = attr(request, "value").and_then(|v| v.parse::<i32>().ok()) {
                    s.volume_db = v;
                }
                return ok();
            }
            "VolumeUp" => {
                s.volume_db += 1;
                return ok();
            }
            "VolumeDown" => {
                s.volume_db -= 1;
                return ok();
            }
            "VolumeMute" => return ok(),
            "Play" => {
                s.state = 2;
                return ok();
            }
            "Pause" => {
                s.state = 1;
                return ok();
            }
            "Stop" => {
                s.state = 0;
                return ok();
            }
            "Previous" | "Next" => return ok(),
            "Seek" => {
                if let Some(v) = attr_u32(request, "position") {
                    s.position = v;
                }
                return ok();
            }
            "MatrixSetProfile" => {
                if let Some(v) = attr(request, "value") {
                    s.matrix_profile = v;
                }
                return ok();
            }
            _ => {}
        }
    }

    let s = state.read().await.clone();
    match command.as_str() {
        "GetInfo" => "<?xml version=\"1.0\"?><GetInfo name=\"MockDSP\" product=\"HQPlayer Embedded\" version=\"5.0.0\" platform=\"mock\" engine=\"mock\"/>\n".to_string(),
        "State" => format!(
            "<?xml version=\"1.0\"?><State state=\"{}\" mode=\"{}\" filter=\"{}\" filter1x=\"{}\" filterNx=\"{}\" shaper=\"{}\" rate=\"{}\" volume=\"{}\" active_mode=\"{}\" active_rate=\"{}\" invert=\"0\" convolution=\"0\" repeat=\"0\" random=\"0\" adaptive=\"0\" filter_20k=\"0\" matrix_profile=\"{}\"/>\n",
            s.state,
            s.mode_idx,
            s.filter_idx,
            s.filter1x_idx,
            s.filter_nx_idx,
            s.shaper_idx,
            s.rate_idx,
            s.volume_db,
            s.active_mode_idx,
            s.active_rate_hz,
            s.matrix_profile,
        ),
        "Status" => format!(
            "<?xml version=\"1.0\"?><Status state=\"{}\" track=\"1\" track_id=\"t1\" position=\"{}\" length=\"{}\" volume=\"{}\" active_mode=\"display-only\" active_filter=\"{}\" active_shaper=\"{}\" active_rate=\"{}\" active_bits=\"24\" active_channels=\"2\"/>\n",
            s.state,
            s.position,
            s.length,
            s.volume_db,
            s.filters.iter().find(|f| f.index == s.filter1x_idx).map(|f| f.name.as_str()).unwrap_or(""),
            s.shapers.iter().find(|f| f.index == s.shaper_idx).map(|f| f.name.as_str()).unwrap_or(""),
            s.active_rate_hz,
        ),
        "VolumeRange" => "<?xml version=\"1.0\"?><VolumeRange min=\"-60\" max=\"0\" step=\"1\" enabled=\"1\" adaptive=\"0\"/>\n".to_string(),
        "GetModes" => render_list(
            "GetModes",
            s.modes
                .iter()
                .map(|m| format!(
                    "<ModesItem index=\"{}\" name=\"{}\" value=\"{}\"/>",
                    m.index, m.name, m.value
                ))
                .collect(),
            s.streaming_lists,
            s.inject_noise,
        ),
        "GetFilters" => render_list(
            "GetFilters",
            s.filters
                .iter()
                .map(|f| format!(
                    "<FiltersItem index=\"{}\" name=\"{}\" value=\"{}\" arg=\"0\"/>",
                    f.index, f.name, f.value
                ))
                .collect(),
            s.streaming_lists,
            s.inject_noise,
        ),
        "GetShapers" => render_list(
            "GetShapers",
            s.shapers
                .iter()
                .map(|f| format!(
                    "<ShapersItem index=\"{}\" name=\"{}\" value=\"{}\"/>",
                    f.index, f.name, f.value
                ))
                .collect(),
            s.streaming_lists,
            s.inject_noise,
        ),
        "GetRates" => render_list(
            "GetRates",
            s.rates
                .iter()
                .map(|(index, rate)| format!("<RatesItem index=\"{index}\" rate=\"{rate}\"/>"))
                .collect(),
            s.streaming_lists,
            s.inject_noise,
        ),
        "MatrixListProfiles" => render_list(
            "MatrixListProfiles",
            s.profiles
                .iter()
                .enumerate()
                .map(|(i, name)| format!("<MatrixProfile index=\"{i}\" name=\"{name}\"/>"))
                .collect(),
            s.streaming_lists,
            s.inject_noise,
        ),
        "MatrixGetProfile" => format!(
            "<?xml version=\"1.0\"?><MatrixGetProfile index=\"0\" value=\"{}\"/>\n",
            s.matrix_profile,
        ),
        _ => format!(
            "<?xml version=\"1.0\"?><Error message=\"unknown command {command}\"/>\n"
        ),
    }
}

fn ok() -> String {
    "<?xml version=\"1.0\"?><Ok/>\n".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn answers_getinfo() {
        let server = MockDspServer::start().await;

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"<?xml version=\"1.0\"?><GetInfo/>\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(response.contains("MockDSP"));

        assert_eq!(server.requests().await.len(), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn set_filter_round_trips_through_state() {
        let server = MockDspServer::start().await;

        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"<?xml version=\"1.0\"?><SetFilter value=\"19\"/>\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 256];
        let _ = stream.read(&mut buf).await.unwrap();

        let state = server.snapshot().await;
        assert_eq!(state.filter_idx, 19);
        assert_eq!(state.filter1x_idx, 19);
        server.stop().await;
    }
}
