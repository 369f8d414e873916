//! DSP control-protocol client (HQPlayer-style TCP/XML on port 4321).
//!
//! Transport model: one TCP connection per client, requests are single XML
//! documents terminated by `\n`, responses are newline-terminated documents.
//! A request yields either one document or a stream of item documents framed
//! by an opening and a closing document; both shapes are handled.
//!
//! Concurrency model: the socket is owned by an I/O task. Public calls send
//! `(request, oneshot)` pairs over a channel; the task keeps at most one
//! request in flight and serves the queue FIFO, which makes ordering and
//! timeout accounting trivial. Callers never touch the socket. While the
//! task is connecting, queued callers implicitly share that one attempt.
//!
//! Reconnection is lazy: a dropped socket fails the in-flight request and
//! drains the queue with `Disconnected`; the next request triggers one new
//! connect attempt. On every successful connect the enumeration caches are
//! refreshed (GetInfo, State, GetModes, GetFilters, GetShapers, GetRates,
//! VolumeRange - seven pipelined calls).
//!
//! INDEX vs VALUE: every list item except rates carries both a positional
//! `index` and an internal `value` identifier, and the two need not agree.
//! `State` reports indices, and Set commands take that same index in their
//! `value` attribute. The `value` field of an item is never sent on the
//! wire by this client; it only serves callers that cache lists across
//! restarts.

use quick_xml::events::{BytesStart, Event as XmlEvent};
use quick_xml::Writer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, SharedBus};
use crate::error::{BridgeError, Result};

pub const DEFAULT_PORT: u16 = 4321;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Depth of the request queue behind the in-flight slot.
const QUEUE_DEPTH: usize = 32;

pub type Attrs = HashMap<String, String>;

// =============================================================================
// Wire types
// =============================================================================

/// Identity as reported by `GetInfo`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DspInfo {
    pub name: String,
    pub product: String,
    pub version: String,
    pub platform: String,
    pub engine: String,
}

/// Full setting snapshot from `<State/>`.
///
/// Fields suffixed `_idx` are positions into the corresponding cached list;
/// `active_rate_hz` is Hz, not an index.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DspState {
    /// 0=stopped, 1=paused, 2=playing.
    pub state: u8,
    pub mode_idx: u32,
    pub filter_idx: u32,
    pub filter1x_idx: Option<u32>,
    pub filter_nx_idx: Option<u32>,
    pub shaper_idx: u32,
    pub rate_idx: u32,
    pub volume_db: i32,
    pub active_mode_idx: u32,
    pub active_rate_hz: u32,
    pub invert: bool,
    pub convolution: bool,
    pub random: bool,
    pub adaptive: bool,
    pub filter_20k: bool,
    /// 0=off, 1=track, 2=all.
    pub repeat: u8,
    pub matrix_profile: String,
}

/// Playback snapshot from `<Status subscribe="0"/>`.
///
/// The stringified `active_mode` here is display data only; the
/// authoritative active mode comes from [`DspState::active_mode_idx`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DspStatus {
    pub state: u8,
    pub track: u32,
    pub track_id: String,
    /// Seconds.
    pub position: u32,
    /// Seconds.
    pub length: u32,
    pub volume_db: i32,
    pub active_mode: String,
    pub active_filter: String,
    pub active_shaper: String,
    pub active_rate: u32,
    pub active_bits: u32,
    pub active_channels: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DspVolumeRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
    pub enabled: bool,
    pub adaptive: bool,
}

/// Enumerable item for modes/filters/shapers: a stable position `index` plus
/// a separate internal identifier `value` (non-contiguous, e.g. position 2
/// carrying value 57).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DspListItem {
    pub index: u32,
    pub value: u32,
    pub name: String,
}

/// Rates carry `(index, rate_hz)` only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DspRateItem {
    pub index: u32,
    pub rate: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatrixProfile {
    pub index: u32,
    pub name: String,
}

/// Per-connection enumeration caches, rebuilt on every (re)connect rather
/// than updated incrementally.
#[derive(Debug, Clone, Default)]
pub struct DspCaches {
    pub info: Option<DspInfo>,
    pub modes: Vec<DspListItem>,
    pub filters: Vec<DspListItem>,
    pub shapers: Vec<DspListItem>,
    pub rates: Vec<DspRateItem>,
    pub volume_range: Option<DspVolumeRange>,
    pub last_state: Option<DspState>,
}

// =============================================================================
// Request rendering and response parsing
// =============================================================================

/// Render `<?xml version="1.0"?><Name attr="escaped"/>`. The writer handles
/// attribute escaping.
fn render_request(name: &str, attrs: &[(&str, String)]) -> Result<String> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut elem = BytesStart::new(name);
    for (key, value) in attrs {
        elem.push_attribute((*key, value.as_str()));
    }
    writer
        .write_event(XmlEvent::Empty(elem))
        .map_err(|e| BridgeError::ProtocolMalformed(format!("render {name}: {e}")))?;

    let body = String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| BridgeError::ProtocolMalformed(format!("render {name}: {e}")))?;
    Ok(format!("<?xml version=\"1.0\"?>{body}"))
}

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq)]
enum WireLine {
    /// A bare XML declaration.
    Decl,
    /// Self-closing document: `<Name a="b"/>`.
    Empty { name: String, attrs: Attrs },
    /// Opening tag of a streamed list: `<Name>`.
    Open { name: String, attrs: Attrs },
    /// Closing tag of a streamed list: `</Name>`.
    Close { name: String },
    /// Single-line document with children:
    /// `<Name><Item .../><Item .../></Name>`.
    Full {
        name: String,
        attrs: Attrs,
        items: Vec<(String, Attrs)>,
    },
}

/// Find the end of a tag, honouring quoted attribute values.
fn find_tag_end(s: &str) -> Option<usize> {
    let mut in_quote = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '>' if !in_quote => return Some(i),
            _ => {}
        }
    }
    None
}

fn unescape_attr(raw: &str) -> String {
    quick_xml::escape::unescape(raw)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Parse `key="value"` pairs from a tag body.
fn parse_attrs(body: &str) -> Attrs {
    let mut attrs = Attrs::new();
    let mut rest = body.trim();
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        let Some(open) = after.find('"') else { break };
        let after_quote = &after[open + 1..];
        let Some(close) = after_quote.find('"') else { break };
        if !key.is_empty() {
            attrs.insert(key.to_string(), unescape_attr(&after_quote[..close]));
        }
        rest = after_quote[close + 1..].trim_start();
    }
    attrs
}

/// Parse one tag starting at `s[0] == '<'`. Returns the tag name, its
/// attributes, whether it was self-closing, and the remainder of the line.
fn parse_tag(s: &str) -> Result<(String, Attrs, bool, &str)> {
    let end = find_tag_end(s)
        .ok_or_else(|| BridgeError::ProtocolMalformed(format!("unterminated tag: {s}")))?;
    let body = &s[1..end];
    let (body, self_closing) = match body.strip_suffix('/') {
        Some(trimmed) => (trimmed, true),
        None => (body, false),
    };
    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let name = body[..name_end].to_string();
    if name.is_empty() {
        return Err(BridgeError::ProtocolMalformed(format!("empty tag: {s}")));
    }
    let attrs = parse_attrs(&body[name_end..]);
    Ok((name, attrs, self_closing, &s[end + 1..]))
}

/// Parse one newline-delimited protocol line into a [`WireLine`].
fn parse_line(line: &str) -> Result<WireLine> {
    let mut rest = line.trim();
    if rest.is_empty() {
        return Err(BridgeError::ProtocolMalformed("empty line".to_string()));
    }

    if let Some(after) = rest.strip_prefix("<?xml") {
        let end = after
            .find("?>")
            .ok_or_else(|| BridgeError::ProtocolMalformed("unterminated declaration".into()))?;
        rest = after[end + 2..].trim_start();
        if rest.is_empty() {
            return Ok(WireLine::Decl);
        }
    }

    if let Some(close) = rest.strip_prefix("</") {
        let name = close
            .strip_suffix('>')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| BridgeError::ProtocolMalformed(format!("bad closing tag: {rest}")))?;
        return Ok(WireLine::Close {
            name: name.to_string(),
        });
    }

    if !rest.starts_with('<') {
        return Err(BridgeError::ProtocolMalformed(format!(
            "expected element, got: {rest}"
        )));
    }

    let (name, attrs, self_closing, after) = parse_tag(rest)?;
    let mut rest = after.trim_start();

    if self_closing {
        if !rest.is_empty() {
            return Err(BridgeError::ProtocolMalformed(format!(
                "trailing data after document: {rest}"
            )));
        }
        return Ok(WireLine::Empty { name, attrs });
    }

    if rest.is_empty() {
        return Ok(WireLine::Open { name, attrs });
    }

    // Children inlined on the same line, terminated by the closing tag.
    let mut items = Vec::new();
    loop {
        if let Some(close) = rest.strip_prefix("</") {
            let close_name = close.strip_suffix('>').map(str::trim).ok_or_else(|| {
                BridgeError::ProtocolMalformed(format!("bad closing tag: {rest}"))
            })?;
            if close_name != name {
                return Err(BridgeError::ProtocolMalformed(format!(
                    "mismatched closing tag {close_name} for {name}"
                )));
            }
            return Ok(WireLine::Full { name, attrs, items });
        }
        if rest.is_empty() || !rest.starts_with('<') {
            return Err(BridgeError::ProtocolMalformed(format!(
                "unterminated document {name}"
            )));
        }
        let (child, child_attrs, child_self_closing, after) = parse_tag(rest)?;
        if !child_self_closing {
            return Err(BridgeError::ProtocolMalformed(format!(
                "nested non-empty element {child} in {name}"
            )));
        }
        items.push((child, child_attrs));
        rest = after.trim_start();
    }
}

/// A fully collected response: root attributes plus any child items.
#[derive(Debug, Clone, Default)]
pub struct DspResponse {
    pub attrs: Attrs,
    pub items: Vec<(String, Attrs)>,
}

impl DspResponse {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// Items filtered by the known child-element name of the command.
    pub fn items_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Attrs> {
        self.items
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, a)| a)
    }
}

fn attr_str(attrs: &Attrs, key: &str) -> String {
    attrs.get(key).cloned().unwrap_or_default()
}

fn attr_u32(attrs: &Attrs, key: &str) -> u32 {
    attrs.get(key).and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn attr_opt_u32(attrs: &Attrs, key: &str) -> Option<u32> {
    attrs.get(key).and_then(|s| s.parse().ok())
}

fn attr_i32(attrs: &Attrs, key: &str) -> i32 {
    attrs.get(key).and_then(|s| s.parse().ok()).unwrap_or(0)
}

fn attr_bool(attrs: &Attrs, key: &str) -> bool {
    attrs.get(key).map(|s| s == "1").unwrap_or(false)
}

impl DspState {
    fn from_attrs(attrs: &Attrs) -> Self {
        Self {
            state: attr_u32(attrs, "state") as u8,
            mode_idx: attr_u32(attrs, "mode"),
            filter_idx: attr_u32(attrs, "filter"),
            filter1x_idx: attr_opt_u32(attrs, "filter1x"),
            filter_nx_idx: attr_opt_u32(attrs, "filterNx"),
            shaper_idx: attr_u32(attrs, "shaper"),
            rate_idx: attr_u32(attrs, "rate"),
            volume_db: attr_i32(attrs, "volume"),
            active_mode_idx: attr_u32(attrs, "active_mode"),
            active_rate_hz: attr_u32(attrs, "active_rate"),
            invert: attr_bool(attrs, "invert"),
            convolution: attr_bool(attrs, "convolution"),
            random: attr_bool(attrs, "random"),
            adaptive: attr_bool(attrs, "adaptive"),
            filter_20k: attr_bool(attrs, "filter_20k"),
            repeat: attr_u32(attrs, "repeat") as u8,
            matrix_profile: attr_str(attrs, "matrix_profile"),
        }
    }
}

impl DspStatus {
    fn from_attrs(attrs: &Attrs) -> Self {
        Self {
            state: attr_u32(attrs, "state") as u8,
            track: attr_u32(attrs, "track"),
            track_id: attr_str(attrs, "track_id"),
            position: attr_u32(attrs, "position"),
            length: attr_u32(attrs, "length"),
            volume_db: attr_i32(attrs, "volume"),
            active_mode: attr_str(attrs, "active_mode"),
            active_filter: attr_str(attrs, "active_filter"),
            active_shaper: attr_str(attrs, "active_shaper"),
            active_rate: attr_u32(attrs, "active_rate"),
            active_bits: attr_u32(attrs, "active_bits"),
            active_channels: attr_u32(attrs, "active_channels"),
        }
    }
}

impl DspVolumeRange {
    fn from_attrs(attrs: &Attrs) -> Self {
        Self {
            min: attr_i32(attrs, "min"),
            max: attr_i32(attrs, "max"),
            step: attr_i32(attrs, "step").max(1),
            enabled: attr_bool(attrs, "enabled"),
            adaptive: attr_bool(attrs, "adaptive"),
        }
    }
}

fn list_items(resp: &DspResponse, child: &str) -> Vec<DspListItem> {
    resp.items_named(child)
        .map(|a| DspListItem {
            index: attr_u32(a, "index"),
            value: attr_u32(a, "value"),
            name: attr_str(a, "name"),
        })
        .collect()
}

fn rate_items(resp: &DspResponse) -> Vec<DspRateItem> {
    resp.items_named("RatesItem")
        .map(|a| DspRateItem {
            index: attr_u32(a, "index"),
            rate: attr_u32(a, "rate"),
        })
        .collect()
}

// =============================================================================
// I/O task
// =============================================================================

enum ClientCmd {
    Request {
        name: &'static str,
        attrs: Vec<(&'static str, String)>,
        reply: oneshot::Sender<Result<DspResponse>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct Conn {
    writer: tokio::net::tcp::OwnedWriteHalf,
    lines: mpsc::Receiver<String>,
    reader: tokio::task::JoinHandle<()>,
}

/// Connection lifecycle of the I/O task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Idle,
    Connected,
    /// Sink state after a failed connect; cleared by the next attempt.
    Failed,
}

struct IoTask {
    host: String,
    port: u16,
    bus: SharedBus,
    caches: Arc<RwLock<DspCaches>>,
    conn: Option<Conn>,
    phase: ConnPhase,
}

impl IoTask {
    async fn run(mut self, mut rx: mpsc::Receiver<ClientCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                ClientCmd::Shutdown { done } => {
                    self.teardown("stopped").await;
                    let _ = done.send(());
                    break;
                }
                ClientCmd::Request { name, attrs, reply } => {
                    let result = self.serve(name, &attrs).await;
                    let disconnected = matches!(result, Err(BridgeError::Disconnected(_)));
                    let _ = reply.send(result);
                    if disconnected {
                        // Draining: the queue behind the failed request gets
                        // the same error; the next caller reconnects lazily.
                        self.drain_queue(&mut rx).await;
                    }
                }
            }
        }
        self.teardown("client dropped").await;
    }

    async fn serve(
        &mut self,
        name: &'static str,
        attrs: &[(&'static str, String)],
    ) -> Result<DspResponse> {
        if self.conn.is_none() {
            self.connect().await?;
        }
        let result = self.perform(name, attrs).await;
        if matches!(result, Err(BridgeError::Disconnected(_))) {
            self.teardown("transport error").await;
        }
        result
    }

    async fn connect(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!(%addr, "dsp connecting");

        let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Err(_) => {
                self.phase = ConnPhase::Failed;
                return Err(BridgeError::Timeout(CONNECT_TIMEOUT));
            }
            Ok(Err(e)) => {
                self.phase = ConnPhase::Failed;
                return Err(BridgeError::Io(e));
            }
            Ok(Ok(stream)) => stream,
        };

        let (read_half, writer) = stream.into_split();
        let (line_tx, line_rx) = mpsc::channel(64);
        let reader = tokio::spawn(read_lines(read_half, line_tx));

        self.conn = Some(Conn {
            writer,
            lines: line_rx,
            reader,
        });
        self.phase = ConnPhase::Connected;

        self.bus.publish(Event::AdapterConnected {
            adapter: "hqp".to_string(),
            details: Some(self.host.clone()),
        });

        if let Err(e) = self.refresh_caches().await {
            warn!("dsp cache refresh failed: {e}");
            self.teardown("cache refresh failed").await;
            return Err(e);
        }

        info!(host = %self.host, "dsp connected");
        Ok(())
    }

    /// Rebuild every enumeration cache. Seven pipelined calls, FIFO on the
    /// fresh connection.
    async fn refresh_caches(&mut self) -> Result<()> {
        let info = self.perform("GetInfo", &[]).await?;
        let state = self.perform("State", &[]).await?;
        let modes = self.perform("GetModes", &[]).await?;
        let filters = self.perform("GetFilters", &[]).await?;
        let shapers = self.perform("GetShapers", &[]).await?;
        let rates = self.perform("GetRates", &[]).await?;
        let volume = self.perform("VolumeRange", &[]).await?;

        let mut caches = self.caches.write().await;
        caches.info = Some(DspInfo {
            name: attr_str(&info.attrs, "name"),
            product: attr_str(&info.attrs, "product"),
            version: attr_str(&info.attrs, "version"),
            platform: attr_str(&info.attrs, "platform"),
            engine: attr_str(&info.attrs, "engine"),
        });
        caches.last_state = Some(DspState::from_attrs(&state.attrs));
        caches.modes = list_items(&modes, "ModesItem");
        caches.filters = list_items(&filters, "FiltersItem");
        caches.shapers = list_items(&shapers, "ShapersItem");
        caches.rates = rate_items(&rates);
        caches.volume_range = Some(DspVolumeRange::from_attrs(&volume.attrs));
        Ok(())
    }

    async fn perform(
        &mut self,
        name: &'static str,
        attrs: &[(&'static str, String)],
    ) -> Result<DspResponse> {
        let conn = self.conn.as_mut().ok_or(BridgeError::NotConnected)?;

        let request = render_request(name, attrs)?;
        let write = async {
            conn.writer.write_all(request.as_bytes()).await?;
            conn.writer.write_all(b"\n").await?;
            conn.writer.flush().await?;
            std::io::Result::Ok(())
        };
        write
            .await
            .map_err(|e| BridgeError::Disconnected(e.to_string()))?;

        match timeout(RESPONSE_TIMEOUT, collect_response(&mut conn.lines, name)).await {
            Ok(result) => result,
            // Request-level timeout: fail this request, keep the connection,
            // dispatch the next queued one.
            Err(_) => Err(BridgeError::Timeout(RESPONSE_TIMEOUT)),
        }
    }

    async fn drain_queue(&mut self, rx: &mut mpsc::Receiver<ClientCmd>) {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                ClientCmd::Request { reply, .. } => {
                    let _ = reply.send(Err(BridgeError::Disconnected(
                        "connection lost".to_string(),
                    )));
                }
                ClientCmd::Shutdown { done } => {
                    let _ = done.send(());
                }
            }
        }
    }

    async fn teardown(&mut self, reason: &str) {
        if let Some(conn) = self.conn.take() {
            conn.reader.abort();
            drop(conn.writer);
            self.bus.publish(Event::AdapterDisconnected {
                adapter: "hqp".to_string(),
                reason: Some(reason.to_string()),
            });
            debug!(host = %self.host, reason, "dsp disconnected");
        }
        if self.phase == ConnPhase::Connected {
            self.phase = ConnPhase::Idle;
        }
    }
}

/// Reader task: socket lines out, one string per newline-terminated document.
async fn read_lines(
    read_half: tokio::net::tcp::OwnedReadHalf,
    tx: mpsc::Sender<String>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line.trim_end().to_string()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("dsp socket read error: {e}");
                break;
            }
        }
    }
    // Dropping tx closes the line channel; the I/O task sees Disconnected.
}

/// Assemble one response for the in-flight request. With a single request
/// outstanding the expected root element is always known.
async fn collect_response(
    lines: &mut mpsc::Receiver<String>,
    root: &str,
) -> Result<DspResponse> {
    let mut collecting: Option<DspResponse> = None;

    loop {
        let Some(line) = lines.recv().await else {
            return Err(BridgeError::Disconnected("connection closed".to_string()));
        };
        if line.trim().is_empty() {
            continue;
        }

        let parsed = match parse_line(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Noise can interleave with a streaming list; drop the line,
                // keep the connection.
                error!(line, "discarding malformed protocol line: {e}");
                continue;
            }
        };

        match parsed {
            WireLine::Decl => {}
            WireLine::Empty { name, attrs } => match collecting.as_mut() {
                None if name == root => {
                    return Ok(DspResponse {
                        attrs,
                        items: Vec::new(),
                    })
                }
                None => error!(element = %name, "unexpected response element, discarding"),
                Some(resp) => resp.items.push((name, attrs)),
            },
            WireLine::Full { name, attrs, items } if collecting.is_none() && name == root => {
                return Ok(DspResponse { attrs, items });
            }
            WireLine::Open { name, attrs } if collecting.is_none() && name == root => {
                collecting = Some(DspResponse {
                    attrs,
                    items: Vec::new(),
                });
            }
            WireLine::Close { name } if name == root => {
                if let Some(resp) = collecting.take() {
                    return Ok(resp);
                }
                error!(element = %name, "closing tag without opening, discarding");
            }
            other => {
                error!(?other, "unexpected protocol element, discarding");
            }
        }
    }
}

// =============================================================================
// Public client
// =============================================================================

/// Handle to one DSP instance's control connection.
///
/// Cheap to clone; all clones share the I/O task, the FIFO queue and the
/// per-connection caches.
#[derive(Clone)]
pub struct HqpClient {
    host: String,
    tx: mpsc::Sender<ClientCmd>,
    caches: Arc<RwLock<DspCaches>>,
}

impl HqpClient {
    pub fn new(host: impl Into<String>, port: u16, bus: SharedBus) -> Self {
        let host = host.into();
        let caches = Arc::new(RwLock::new(DspCaches::default()));
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);

        let task = IoTask {
            host: host.clone(),
            port,
            bus,
            caches: caches.clone(),
            conn: None,
            phase: ConnPhase::Idle,
        };
        tokio::spawn(task.run(rx));

        Self { host, tx, caches }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    async fn request(
        &self,
        name: &'static str,
        attrs: Vec<(&'static str, String)>,
    ) -> Result<DspResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ClientCmd::Request { name, attrs, reply })
            .await
            .map_err(|_| BridgeError::NotConnected)?;
        rx.await
            .map_err(|_| BridgeError::Disconnected("client stopped".to_string()))?
    }

    /// Close the connection and stop the I/O task. Pending requests drain
    /// with `Disconnected`.
    pub async fn stop(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(ClientCmd::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Force a (re)connect and cache refresh by issuing a cheap request.
    pub async fn ensure_connected(&self) -> Result<()> {
        self.request("GetInfo", Vec::new()).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_info(&self) -> Result<DspInfo> {
        let resp = self.request("GetInfo", Vec::new()).await?;
        Ok(DspInfo {
            name: attr_str(&resp.attrs, "name"),
            product: attr_str(&resp.attrs, "product"),
            version: attr_str(&resp.attrs, "version"),
            platform: attr_str(&resp.attrs, "platform"),
            engine: attr_str(&resp.attrs, "engine"),
        })
    }

    pub async fn get_state(&self) -> Result<DspState> {
        let resp = self.request("State", Vec::new()).await?;
        let state = DspState::from_attrs(&resp.attrs);
        self.caches.write().await.last_state = Some(state.clone());
        Ok(state)
    }

    pub async fn get_status(&self) -> Result<DspStatus> {
        let resp = self
            .request("Status", vec![("subscribe", "0".to_string())])
            .await?;
        Ok(DspStatus::from_attrs(&resp.attrs))
    }

    pub async fn get_volume_range(&self) -> Result<DspVolumeRange> {
        let resp = self.request("VolumeRange", Vec::new()).await?;
        Ok(DspVolumeRange::from_attrs(&resp.attrs))
    }

    /// Cached enumerations, valid for the life of the current connection.
    pub async fn caches(&self) -> DspCaches {
        self.caches.read().await.clone()
    }

    pub async fn cached_info(&self) -> Option<DspInfo> {
        self.caches.read().await.info.clone()
    }

    // ------------------------------------------------------------------
    // Setting mutation. The `value` attribute carries the State index.
    // ------------------------------------------------------------------

    pub async fn set_mode(&self, index: u32) -> Result<()> {
        self.request("SetMode", vec![("value", index.to_string())])
            .await
            .map(|_| ())
    }

    /// `value` sets the Nx filter; `value1x`, when given, the 1x filter.
    pub async fn set_filter(&self, index: u32, index_1x: Option<u32>) -> Result<()> {
        let mut attrs = vec![("value", index.to_string())];
        if let Some(idx) = index_1x {
            attrs.push(("value1x", idx.to_string()));
        }
        self.request("SetFilter", attrs).await.map(|_| ())
    }

    pub async fn set_shaping(&self, index: u32) -> Result<()> {
        self.request("SetShaping", vec![("value", index.to_string())])
            .await
            .map(|_| ())
    }

    pub async fn set_rate(&self, index: u32) -> Result<()> {
        self.request("SetRate", vec![("value", index.to_string())])
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Volume and transport
    // ------------------------------------------------------------------

    pub async fn set_volume(&self, db: i32) -> Result<()> {
        self.request("Volume", vec![("value", db.to_string())])
            .await
            .map(|_| ())
    }

    pub async fn volume_up(&self) -> Result<()> {
        self.request("VolumeUp", Vec::new()).await.map(|_| ())
    }

    pub async fn volume_down(&self) -> Result<()> {
        self.request("VolumeDown", Vec::new()).await.map(|_| ())
    }

    pub async fn volume_mute(&self) -> Result<()> {
        self.request("VolumeMute", Vec::new()).await.map(|_| ())
    }

    pub async fn play(&self) -> Result<()> {
        self.request("Play", vec![("last", "0".to_string())])
            .await
            .map(|_| ())
    }

    pub async fn pause(&self) -> Result<()> {
        self.request("Pause", Vec::new()).await.map(|_| ())
    }

    pub async fn stop_playback(&self) -> Result<()> {
        self.request("Stop", Vec::new()).await.map(|_| ())
    }

    pub async fn previous(&self) -> Result<()> {
        self.request("Previous", Vec::new()).await.map(|_| ())
    }

    pub async fn next(&self) -> Result<()> {
        self.request("Next", Vec::new()).await.map(|_| ())
    }

    pub async fn seek(&self, position_secs: u32) -> Result<()> {
        self.request("Seek", vec![("position", position_secs.to_string())])
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Matrix profiles
    // ------------------------------------------------------------------

    pub async fn matrix_profiles(&self) -> Result<Vec<MatrixProfile>> {
        let resp = self.request("MatrixListProfiles", Vec::new()).await?;
        Ok(resp
            .items_named("MatrixProfile")
            .map(|a| MatrixProfile {
                index: attr_u32(a, "index"),
                name: attr_str(a, "name"),
            })
            .collect())
    }

    pub async fn matrix_profile(&self) -> Result<Option<MatrixProfile>> {
        let resp = self.request("MatrixGetProfile", Vec::new()).await?;
        let index = attr_u32(&resp.attrs, "index");
        let name = resp
            .attr("value")
            .or_else(|| resp.attr("name"))
            .unwrap_or_default()
            .to_string();
        Ok((!name.is_empty()).then_some(MatrixProfile { index, name }))
    }

    pub async fn set_matrix_profile(&self, name: &str) -> Result<()> {
        self.request("MatrixSetProfile", vec![("value", name.to_string())])
            .await
            .map(|_| ())
    }
}
