/// mpv as the audio output device.
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task   ← MpvRequest via mpsc, serialised → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── response (request_id) → matching oneshot
///                                └── event                 → event channel
/// ```
///
/// `MpvOutput` wraps the driver behind `AudioOutput`: it (re)spawns mpv on
/// demand, loads sources paused, and confirms a start by waiting for mpv to
/// report the file loaded or failed.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::error::{Result, ThemeError};
use crate::playback::AudioOutput;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

const IPC_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `start()` waits for mpv to confirm the file loaded.  The core
/// loop is blocked meanwhile, so keep it short.
const START_TIMEOUT: Duration = Duration::from_secs(3);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, '\n' included
    reply: oneshot::Sender<Result<Value>>,
}

/// An unsolicited mpv event (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// e.g. "start-file", "file-loaded", "end-file"
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// For `end-file`: mpv's error text when the file could not be played.
    pub fn end_file_error(&self) -> Option<String> {
        if self.event_name()? != "end-file" || self.raw.get("reason")?.as_str()? != "error" {
            return None;
        }
        Some(
            self.raw
                .get("file_error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = msg.to_string();
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ThemeError::playback("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| ThemeError::playback(format!("mpv IPC timeout for req={}", req_id)))?
            .map_err(|_| ThemeError::playback(format!("mpv reply dropped req={}", req_id)))?
    }

    pub async fn load_paused(&self, source: &str) -> Result<()> {
        self.set_pause(true).await?;
        self.send(json!(["loadfile", source, "replace"])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        let vol_pct = (volume * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn seek_to(&self, secs: f64) -> Result<()> {
        self.send(json!(["seek", secs, "absolute"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl Default for MpvDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: theme_proto::platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> Result<()> {
        let mpv_binary = theme_proto::platform::find_mpv_binary()
            .ok_or_else(|| ThemeError::playback("mpv binary not found"))?;

        info!("mpv: spawning {:?}", mpv_binary);
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--loop-file=inf")
            .arg("--quiet")
            .arg(theme_proto::platform::mpv_socket_arg())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Result<MpvHandle> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process()?;

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            return Err(ThemeError::playback("mpv IPC socket did not appear"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path).await?;
        info!("mpv: connected to IPC socket");
        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Result<MpvHandle> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        Err(ThemeError::playback("mpv named pipe did not appear"))
    }
}

fn start_io_tasks<R, W>(read_half: R, write_half: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    // req_id → reply channel, shared by writer (inserts) and reader (resolves)
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read_half), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(ThemeError::playback(reason.to_string())));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
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

                match val.get("request_id").and_then(Value::as_u64) {
                    Some(req_id) => {
                        let Some(tx) = pending.lock().await.remove(&req_id) else {
                            debug!("mpv reader: response for unknown req={}", req_id);
                            continue;
                        };
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            Err(ThemeError::playback(format!("mpv error: {}", err)))
                        };
                        let _ = tx.send(result);
                    }
                    None => {
                        debug!("mpv reader: event {}", trimmed);
                        let _ = event_tx.send(MpvEvent { raw: val }).await;
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(ThemeError::playback(format!("mpv write error: {}", e))));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── AudioOutput ───────────────────────────────────────────────────────────────

pub struct MpvOutput {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    /// False when connected to an mpv we did not spawn.
    owns_process: bool,
    event_tx: mpsc::Sender<MpvEvent>,
    event_rx: mpsc::Receiver<MpvEvent>,
}

impl Default for MpvOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl MpvOutput {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            driver: MpvDriver::new(),
            handle: None,
            owns_process: true,
            event_tx,
            event_rx,
        }
    }

    /// Drive an mpv instance that is already connected.  `event_rx` must be
    /// the receiving side of the channel `handle`'s reader publishes to; the
    /// output never spawns or kills a process in this mode.
    pub fn attached(
        handle: MpvHandle,
        event_tx: mpsc::Sender<MpvEvent>,
        event_rx: mpsc::Receiver<MpvEvent>,
    ) -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: Some(handle),
            owns_process: false,
            event_tx,
            event_rx,
        }
    }

    fn process_alive(&mut self) -> bool {
        !self.owns_process || self.driver.process_alive()
    }

    /// Live handle, spawning mpv if it is not running.
    async fn connected(&mut self) -> Result<MpvHandle> {
        let alive = self.process_alive();
        if let Some(handle) = &self.handle {
            if alive {
                return Ok(handle.clone());
            }
            warn!("mpv: process died, respawning");
        }
        let handle = self.driver.spawn_and_connect(self.event_tx.clone()).await?;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    /// Handle only if mpv is already up; stopping never spawns a process.
    fn existing(&mut self) -> Option<MpvHandle> {
        self.drain_events();
        let alive = self.process_alive();
        match &self.handle {
            Some(handle) if alive => Some(handle.clone()),
            _ => None,
        }
    }

    /// Keeps the event channel from filling and stalling the reader task.
    fn drain_events(&mut self) {
        while self.event_rx.try_recv().is_ok() {}
    }
}

#[async_trait]
impl AudioOutput for MpvOutput {
    async fn attach(&mut self, source: &str) -> Result<()> {
        // Anything queued belongs to the previous source.
        self.drain_events();
        let handle = self.connected().await?;
        handle.load_paused(source).await
    }

    async fn set_volume(&mut self, volume: f32) -> Result<()> {
        self.connected().await?.set_volume(volume).await
    }

    async fn start(&mut self) -> Result<()> {
        let handle = self.connected().await?;
        handle.set_pause(false).await?;

        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.event_rx.recv())
                .await
                .map_err(|_| ThemeError::playback("mpv did not confirm playback in time"))?
                .ok_or_else(|| ThemeError::playback("mpv event channel closed"))?;
            if let Some(err) = event.end_file_error() {
                return Err(ThemeError::playback(err));
            }
            if matches!(event.event_name(), Some("file-loaded" | "playback-restart")) {
                return Ok(());
            }
        }
    }

    async fn pause(&mut self) -> Result<()> {
        match self.existing() {
            Some(handle) => handle.set_pause(true).await,
            None => Ok(()),
        }
    }

    async fn rewind(&mut self) -> Result<()> {
        match self.existing() {
            Some(handle) => handle.seek_to(0.0).await,
            None => Ok(()),
        }
    }

    async fn detach(&mut self) -> Result<()> {
        match self.existing() {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    async fn close(&mut self) {
        self.handle = None;
        self.driver.kill().await;
    }
}
