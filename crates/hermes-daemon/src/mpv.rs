/// mpv IPC driver with separated reader/writer tasks, and the `AudioBackend`
/// built on top of it.
///
/// Architecture:
///
/// ```text
///   PlaybackEngine ──open/pause/stop──► MpvBackend ──PlayerRequest──► player actor
///                                                                      │
///   MpvDriver::spawn_and_connect()  ◄──────────────────────────────────┘
///         │
///         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
///         └── reader_task   ← reads JSON lines from socket
///                                ├── response (has request_id) → matched oneshot::Sender
///                                └── event / property-change   → actor → StreamEventSink
/// ```
///
/// The actor owns the mpv process.  Only the most recently opened stream is
/// "active"; mpv events are translated for it and everything else is dropped.
/// Requests carrying an older token are ignored, so a stale `stop()` can
/// never cut off the song that replaced it.
///
/// Platform notes:
/// - Unix:   Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use hermes_proto::error::StreamError;

use crate::engine::OpToken;
use crate::stream::{AudioBackend, AudioStream, StreamEventKind, StreamEventSink};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

/// Fixed observe_property IDs.  We match on these in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_TIME_POS: u64 = 2;
pub const OBS_DURATION: u64 = 3;
pub const OBS_CACHE: u64 = 4;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(tokio::time::Duration::from_secs(5), reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn load_stream(&self, url: &str, volume: u8) -> anyhow::Result<()> {
        // mpv keeps `pause` across loads
        let _ = self.set_pause(false).await;
        self.send(json!(["loadfile", url, "replace"])).await?;
        let _ = self.set_volume(volume).await;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: u8) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", volume.min(100)]))
            .await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    /// Register observe_property for everything the actor translates.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
            (OBS_CACHE, "cache-buffering-state"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: hermes_proto::platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self, volume: u8) -> anyhow::Result<()> {
        info!("mpv: spawning new process");
        let mpv_binary = hermes_proto::platform::find_mpv_binary()
            .ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--no-terminal")
            .arg(hermes_proto::platform::mpv_socket_arg())
            .arg(format!("--volume={}", volume.min(100)))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    // ── spawn / connect ───────────────────────────────────────────────────────

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: u8,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        // Kill stale process
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process(volume)?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(BufReader::new(read_half), write_half, event_tx))
    }

    // ── Windows ───────────────────────────────────────────────────────────────

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: u8,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        self.spawn_process(volume)?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            match ClientOptions::new().open(&pipe_path) {
                Ok(client) => {
                    info!("mpv: connected to named pipe");
                    let (read_half, write_half) = tokio::io::split(client);
                    return Ok(start_io_tasks(
                        BufReader::new(read_half),
                        write_half,
                        event_tx,
                    ));
                }
                Err(_) => continue,
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

fn start_io_tasks<R, W>(
    reader: BufReader<R>,
    writer: W,
    event_tx: mpsc::Sender<MpvEvent>,
) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(writer, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── AudioBackend ──────────────────────────────────────────────────────────────

#[derive(Debug)]
enum PlayerRequest {
    Open {
        url: String,
        volume: u8,
        sink: StreamEventSink,
    },
    Pause(OpToken),
    Resume(OpToken),
    Stop(OpToken),
    Volume(OpToken, u8),
}

/// `AudioBackend` that plays through a single mpv process.
pub struct MpvBackend {
    tx: mpsc::UnboundedSender<PlayerRequest>,
}

impl MpvBackend {
    /// Start the player actor.  mpv itself is spawned lazily on first open.
    pub fn spawn(initial_volume: u8) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(PlayerActor::new(initial_volume).run(rx));
        Self { tx }
    }
}

impl AudioBackend for MpvBackend {
    fn open(&self, url: &str, volume: u8, sink: StreamEventSink) -> Box<dyn AudioStream> {
        let token = sink.token();
        let request = PlayerRequest::Open {
            url: url.to_string(),
            volume,
            sink: sink.clone(),
        };
        if self.tx.send(request).is_err() {
            sink.emit(StreamEventKind::Failed(StreamError::Unreachable(
                "player is not running".into(),
            )));
        }
        Box::new(MpvStream {
            token,
            tx: self.tx.clone(),
            stopped: false,
        })
    }
}

struct MpvStream {
    token: OpToken,
    tx: mpsc::UnboundedSender<PlayerRequest>,
    stopped: bool,
}

impl AudioStream for MpvStream {
    fn pause(&mut self) {
        let _ = self.tx.send(PlayerRequest::Pause(self.token));
    }

    fn resume(&mut self) {
        let _ = self.tx.send(PlayerRequest::Resume(self.token));
    }

    fn stop(&mut self) {
        if !std::mem::replace(&mut self.stopped, true) {
            let _ = self.tx.send(PlayerRequest::Stop(self.token));
        }
    }

    fn set_volume(&mut self, volume: u8) {
        let _ = self.tx.send(PlayerRequest::Volume(self.token, volume));
    }
}

impl Drop for MpvStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The stream mpv is currently playing for us.
struct ActiveStream {
    sink: StreamEventSink,
    /// mpv has started the file we loaded; events before that belong to
    /// whatever it was playing previously.
    started: bool,
    opened: bool,
    duration: Option<f64>,
    /// Whole second of the last progress report.
    last_second: Option<u64>,
    done: bool,
}

impl ActiveStream {
    fn new(sink: StreamEventSink) -> Self {
        Self {
            sink,
            started: false,
            opened: false,
            duration: None,
            last_second: None,
            done: false,
        }
    }
}

struct PlayerActor {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    event_tx: mpsc::Sender<MpvEvent>,
    event_rx: mpsc::Receiver<MpvEvent>,
    active: Option<ActiveStream>,
    volume: u8,
}

impl PlayerActor {
    fn new(volume: u8) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            driver: MpvDriver::new(),
            handle: None,
            event_tx,
            event_rx,
            active: None,
            volume,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PlayerRequest>) {
        let mut heartbeat = tokio::time::interval(tokio::time::Duration::from_secs(10));
        loop {
            tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => self.on_request(req).await,
                    None => break,
                },
                Some(event) = self.event_rx.recv() => self.on_mpv_event(&event),
                _ = heartbeat.tick() => self.check_alive(),
            }
        }
        info!("mpv: player actor exiting");
        self.driver.kill().await;
    }

    fn is_active(&self, token: OpToken) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.sink.token() == token)
    }

    async fn ensure_connected(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = &self.handle {
            if self.driver.process_alive() {
                return Ok(handle.clone());
            }
            warn!("mpv: process is gone, respawning");
        }
        self.handle = None;
        let handle = self
            .driver
            .spawn_and_connect(self.volume, self.event_tx.clone())
            .await?;
        handle.observe_all_properties().await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn on_request(&mut self, req: PlayerRequest) {
        match req {
            PlayerRequest::Open { url, volume, sink } => {
                self.volume = volume;
                let handle = match self.ensure_connected().await {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!("mpv: cannot start player: {}", e);
                        sink.emit(StreamEventKind::Failed(StreamError::Unreachable(format!(
                            "player unavailable: {}",
                            e
                        ))));
                        return;
                    }
                };
                info!("mpv: loading {} ({})", url, sink.token());
                self.active = Some(ActiveStream::new(sink.clone()));
                if let Err(e) = handle.load_stream(&url, volume).await {
                    warn!("mpv: loadfile failed: {}", e);
                    self.active = None;
                    sink.emit(StreamEventKind::Failed(StreamError::Unreachable(
                        e.to_string(),
                    )));
                }
            }
            PlayerRequest::Pause(token) => self.set_pause(token, true).await,
            PlayerRequest::Resume(token) => self.set_pause(token, false).await,
            PlayerRequest::Stop(token) => {
                if !self.is_active(token) {
                    return;
                }
                self.active = None;
                if let Some(handle) = &self.handle {
                    if let Err(e) = handle.stop().await {
                        debug!("mpv: stop failed: {}", e);
                    }
                }
            }
            PlayerRequest::Volume(token, volume) => {
                self.volume = volume;
                if !self.is_active(token) {
                    return;
                }
                if let Some(handle) = &self.handle {
                    if let Err(e) = handle.set_volume(volume).await {
                        warn!("mpv: set volume failed: {}", e);
                    }
                }
            }
        }
    }

    async fn set_pause(&mut self, token: OpToken, paused: bool) {
        if !self.is_active(token) {
            return;
        }
        if let Some(handle) = &self.handle {
            if let Err(e) = handle.set_pause(paused).await {
                warn!("mpv: set pause={} failed: {}", paused, e);
            }
        }
    }

    fn check_alive(&mut self) {
        if self.handle.is_none() || self.driver.process_alive() {
            return;
        }
        warn!("mpv: process exited unexpectedly");
        self.handle = None;
        if let Some(active) = self.active.take() {
            if !active.done {
                active.sink.emit(StreamEventKind::Failed(StreamError::Unreachable(
                    "player exited".into(),
                )));
            }
        }
    }

    fn on_mpv_event(&mut self, event: &MpvEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.done {
            return;
        }
        if let Some(kind) = translate(active, event) {
            if matches!(kind, StreamEventKind::Finished | StreamEventKind::Failed(_)) {
                active.done = true;
            }
            active.sink.emit(kind);
        }
    }
}

/// Map one mpv event onto the active stream.  Updates `active` as a side
/// effect (start/open/duration tracking).
fn translate(active: &mut ActiveStream, event: &MpvEvent) -> Option<StreamEventKind> {
    match event.event_name()? {
        "start-file" => {
            active.started = true;
            None
        }
        "end-file" if active.started => {
            let reason = event.raw.get("reason").and_then(Value::as_str)?;
            match reason {
                "eof" => Some(StreamEventKind::Finished),
                "error" => {
                    let detail = event
                        .raw
                        .get("file_error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    Some(StreamEventKind::Failed(classify_file_error(detail)))
                }
                _ => None,
            }
        }
        "property-change" if active.started => {
            let (id, data) = event.as_property_change()?;
            match id {
                OBS_CORE_IDLE => {
                    if data.as_bool() == Some(false) && !active.opened {
                        active.opened = true;
                        Some(StreamEventKind::Opened)
                    } else {
                        None
                    }
                }
                OBS_DURATION => {
                    active.duration = data.as_f64().filter(|d| *d > 0.0);
                    None
                }
                OBS_TIME_POS => {
                    let elapsed = data.as_f64()?;
                    let second = elapsed.max(0.0) as u64;
                    if active.last_second == Some(second) {
                        return None;
                    }
                    active.last_second = Some(second);
                    Some(StreamEventKind::Progress {
                        elapsed,
                        total: active.duration,
                    })
                }
                OBS_CACHE => Some(StreamEventKind::Buffering(
                    data.as_f64().map(|pct| (pct / 100.0).clamp(0.0, 1.0) as f32),
                )),
                _ => None,
            }
        }
        _ => None,
    }
}

/// mpv only gives a short `file_error` string; sort it into our taxonomy.
pub fn classify_file_error(detail: &str) -> StreamError {
    let lower = detail.to_ascii_lowercase();
    if ["401", "403", "forbidden", "unauthorized"]
        .iter()
        .any(|k| lower.contains(k))
    {
        StreamError::AuthExpired
    } else if ["format", "demux", "decod", "no audio"]
        .iter()
        .any(|k| lower.contains(k))
    {
        StreamError::DecodeError(detail.to_string())
    } else {
        StreamError::Unreachable(detail.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineInput, OpKind, PendingOps};
    use crate::stream::StreamEvent;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    fn active() -> (ActiveStream, mpsc::UnboundedReceiver<EngineInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = PendingOps::new().issue(OpKind::Stream);
        (ActiveStream::new(StreamEventSink::new(token, tx)), rx)
    }

    #[test]
    fn test_property_change_parsing() {
        let evt = event(json!({"event": "property-change", "id": 2, "name": "time-pos", "data": 12.5}));
        let (id, data) = evt.as_property_change().unwrap();
        assert_eq!(id, OBS_TIME_POS);
        assert_eq!(data.as_f64(), Some(12.5));
        assert!(event(json!({"event": "start-file"})).as_property_change().is_none());
    }

    #[test]
    fn test_events_before_start_file_are_ignored() {
        let (mut stream, _rx) = active();
        let old_end = event(json!({"event": "end-file", "reason": "stop"}));
        let old_eof = event(json!({"event": "end-file", "reason": "eof"}));
        assert_eq!(translate(&mut stream, &old_end), None);
        assert_eq!(translate(&mut stream, &old_eof), None);

        translate(&mut stream, &event(json!({"event": "start-file"})));
        assert!(stream.started);
        assert_eq!(
            translate(&mut stream, &old_eof),
            Some(StreamEventKind::Finished)
        );
    }

    #[test]
    fn test_core_idle_false_opens_once() {
        let (mut stream, _rx) = active();
        translate(&mut stream, &event(json!({"event": "start-file"})));
        let busy = event(json!({"event": "property-change", "id": 1, "data": false}));
        assert_eq!(translate(&mut stream, &busy), Some(StreamEventKind::Opened));
        assert_eq!(translate(&mut stream, &busy), None);
    }

    #[test]
    fn test_progress_carries_duration() {
        let (mut stream, _rx) = active();
        translate(&mut stream, &event(json!({"event": "start-file"})));
        translate(
            &mut stream,
            &event(json!({"event": "property-change", "id": 3, "data": 241.0})),
        );
        let tick = event(json!({"event": "property-change", "id": 2, "data": 30.0}));
        assert_eq!(
            translate(&mut stream, &tick),
            Some(StreamEventKind::Progress {
                elapsed: 30.0,
                total: Some(241.0)
            })
        );
        let same_second = event(json!({"event": "property-change", "id": 2, "data": 30.4}));
        assert_eq!(translate(&mut stream, &same_second), None);
    }

    #[test]
    fn test_error_end_file_is_classified() {
        let (mut stream, _rx) = active();
        translate(&mut stream, &event(json!({"event": "start-file"})));
        let failed = event(json!({
            "event": "end-file",
            "reason": "error",
            "file_error": "unrecognized file format"
        }));
        assert_eq!(
            translate(&mut stream, &failed),
            Some(StreamEventKind::Failed(StreamError::DecodeError(
                "unrecognized file format".into()
            )))
        );
    }

    #[test]
    fn test_classify_file_error() {
        assert_eq!(
            classify_file_error("HTTP error 403 Forbidden"),
            StreamError::AuthExpired
        );
        assert_eq!(
            classify_file_error("loading failed"),
            StreamError::Unreachable("loading failed".into())
        );
        assert!(matches!(
            classify_file_error("no audio or video data played"),
            StreamError::DecodeError(_)
        ));
    }

    #[test]
    fn test_actor_forwards_only_to_active_stream() {
        let (stream, mut rx) = active();
        let token = stream.sink.token();
        let mut actor = PlayerActor::new(50);
        actor.active = Some(stream);

        actor.on_mpv_event(&event(json!({"event": "start-file"})));
        actor.on_mpv_event(&event(json!({"event": "end-file", "reason": "eof"})));
        actor.on_mpv_event(&event(json!({"event": "end-file", "reason": "eof"})));

        match rx.try_recv() {
            Ok(EngineInput::Stream(StreamEvent { token: t, kind })) => {
                assert_eq!(t, token);
                assert_eq!(kind, StreamEventKind::Finished);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "finished streams stay quiet");
    }
}
