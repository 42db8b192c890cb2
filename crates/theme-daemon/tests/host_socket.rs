//! Host bridge protocol over a real TCP connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use theme_daemon::backend::MusicBackend;
use theme_daemon::core::{CoreEvent, CoreHandle, CoreSettings, ThemeCore};
use theme_daemon::error::{Result, ThemeError};
use theme_daemon::focus::{FocusHub, HostView};
use theme_daemon::playback::AudioOutput;
use theme_daemon::resolver::SourceResolver;
use theme_daemon::socket::{self, HostContext};
use theme_proto::protocol::{
    encode_frame, Broadcast, Command, ElementNode, FocusTarget, Message, PlaybackStatus,
    PROTOCOL_VERSION, RECOMMENDED_QUALITY,
};
use theme_proto::store::{IdentifierCacheEntry, IdentifierStore, MemoryStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

struct StubBackend {
    quality_changes: AtomicUsize,
    installed: bool,
}

#[async_trait]
impl MusicBackend for StubBackend {
    async fn resolve_music_path(&self, video_id: &str) -> Result<Option<String>> {
        Ok(Some(format!("/music/{}.webm", video_id)))
    }

    async fn converted_files_exist(&self) -> Result<bool> {
        Ok(true)
    }

    async fn change_convert_quality(&self, _quality: &str) -> Result<()> {
        self.quality_changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_converted_files(&self) -> Result<()> {
        Ok(())
    }

    async fn install_check(&self) -> Result<bool> {
        if self.installed {
            Ok(true)
        } else {
            Err(ThemeError::backend("backend not reachable"))
        }
    }
}

struct NullOutput;

#[async_trait]
impl AudioOutput for NullOutput {
    async fn attach(&mut self, _source: &str) -> Result<()> {
        Ok(())
    }

    async fn set_volume(&mut self, _volume: f32) -> Result<()> {
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rewind(&mut self) -> Result<()> {
        Ok(())
    }

    async fn detach(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Bridge {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Bridge {
    async fn send(&mut self, cmd: Command) {
        let encoded = Message::Command(cmd).encode().unwrap();
        self.stream.write_all(&encoded).await.unwrap();
    }

    async fn send_raw(&mut self, value: serde_json::Value) {
        let encoded = encode_frame(&value).unwrap();
        self.stream.write_all(&encoded).await.unwrap();
    }

    async fn next(&mut self) -> Broadcast {
        let mut tmp = [0u8; 4096];
        loop {
            if let Ok((msg, consumed)) = Message::decode(&self.buf) {
                self.buf.drain(..consumed);
                match msg {
                    Message::Broadcast(b) => return b,
                    Message::Command(c) => panic!("daemon sent a command: {:?}", c),
                }
            }
            let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut tmp))
                .await
                .expect("daemon went quiet")
                .unwrap();
            assert!(n > 0, "daemon closed the connection");
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    /// Skip broadcasts until one matches.
    async fn expect<F>(&mut self, pred: F) -> Broadcast
    where
        F: Fn(&Broadcast) -> bool,
    {
        for _ in 0..50 {
            let b = self.next().await;
            if pred(&b) {
                return b;
            }
        }
        panic!("expected broadcast never arrived");
    }
}

async fn start_daemon(installed: bool) -> (Bridge, Arc<StubBackend>, CoreHandle) {
    let store = Arc::new(MemoryStore::new());
    store
        .set("1145360", IdentifierCacheEntry::new("hades"))
        .await
        .unwrap();
    let backend = Arc::new(StubBackend {
        quality_changes: AtomicUsize::new(0),
        installed,
    });
    let resolver = Arc::new(SourceResolver::new(
        store,
        backend.clone(),
        Duration::from_secs(5),
    ));
    let host = Arc::new(HostView::new("data-id"));
    let hub = FocusHub::new();

    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);
    let (broadcast_tx, _) = broadcast::channel(100);
    let core = ThemeCore::new(
        CoreSettings::default(),
        host.clone(),
        hub.clone(),
        resolver,
        Box::new(NullOutput),
        event_tx.clone(),
        broadcast_tx.clone(),
    )
    .await;
    tokio::spawn(core.run(event_rx));

    let handle = CoreHandle::new(event_tx);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ctx = HostContext {
        core: handle.clone(),
        hub,
        host,
        backend: backend.clone(),
    };
    tokio::spawn(socket::serve(listener, ctx, broadcast_tx));

    let stream = TcpStream::connect(addr).await.unwrap();
    let bridge = Bridge {
        stream,
        buf: Vec::new(),
    };
    (bridge, backend, handle)
}

#[tokio::test]
async fn test_hello_on_connect() {
    let (mut bridge, _, _) = start_daemon(true).await;
    match bridge.next().await {
        Broadcast::Hello {
            protocol_version,
            status,
        } => {
            assert_eq!(protocol_version, PROTOCOL_VERSION);
            assert!(status.enabled);
            assert_eq!(status.playback, PlaybackStatus::Idle);
        }
        other => panic!("expected Hello, got {:?}", other),
    }
}

#[tokio::test]
async fn test_focus_over_the_wire_plays() {
    let (mut bridge, _, _) = start_daemon(true).await;
    bridge.next().await;

    bridge
        .send(Command::Navigate {
            location: "https://steamloopback.host/routes/library/home".into(),
        })
        .await;
    bridge
        .send(Command::FocusIn {
            target: FocusTarget::new(vec![
                ElementNode::with_attribute("img", "class", "poster"),
                ElementNode::with_attribute("div", "data-id", "1145360"),
            ]),
        })
        .await;

    let playing = bridge
        .expect(|b| matches!(b, Broadcast::Status { data } if data.playback == PlaybackStatus::Playing))
        .await;
    if let Broadcast::Status { data } = playing {
        assert_eq!(data.current_game_id.as_deref(), Some("1145360"));
        assert_eq!(data.source.as_deref(), Some("/music/hades.webm"));
    }

    bridge
        .send(Command::Navigate {
            location: "https://steamloopback.host/routes/library/app/1145360".into(),
        })
        .await;
    bridge
        .expect(|b| matches!(b, Broadcast::Status { data } if !data.at_home && data.playback == PlaybackStatus::Idle))
        .await;
}

#[tokio::test]
async fn test_enable_toggle_and_status() {
    let (mut bridge, _, _) = start_daemon(true).await;
    bridge.next().await;

    bridge.send(Command::SetEnabled { enabled: false }).await;
    bridge
        .expect(|b| matches!(b, Broadcast::Status { data } if !data.enabled))
        .await;

    bridge.send(Command::ToggleEnabled).await;
    bridge
        .expect(|b| matches!(b, Broadcast::Status { data } if data.enabled))
        .await;

    bridge.send(Command::GetStatus).await;
    bridge
        .expect(|b| matches!(b, Broadcast::Status { data } if data.enabled))
        .await;
}

#[tokio::test]
async fn test_settings_commands() {
    let (mut bridge, backend, _) = start_daemon(true).await;
    bridge.next().await;

    bridge.send(Command::GetConvertedCount).await;
    bridge
        .expect(|b| matches!(b, Broadcast::ConvertedFiles { any: true }))
        .await;

    bridge.send(Command::InstallCheck).await;
    bridge
        .expect(|b| matches!(b, Broadcast::Installed { installed: true }))
        .await;

    bridge
        .send(Command::ChangeConvertQuality {
            quality: "96k".into(),
        })
        .await;
    bridge
        .expect(|b| matches!(b, Broadcast::Error { message } if message.contains("96k") && message.contains(RECOMMENDED_QUALITY)))
        .await;

    bridge
        .send(Command::ChangeConvertQuality {
            quality: "32k".into(),
        })
        .await;
    for _ in 0..100 {
        if backend.quality_changes.load(Ordering::SeqCst) == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("quality change never reached the backend");
}

#[tokio::test]
async fn test_backend_errors_are_reported() {
    let (mut bridge, _, _) = start_daemon(false).await;
    bridge.next().await;

    bridge.send(Command::InstallCheck).await;
    bridge
        .expect(|b| matches!(b, Broadcast::Error { message } if message.contains("not reachable")))
        .await;
}

#[tokio::test]
async fn test_core_stops_on_shutdown() {
    let (mut bridge, _, handle) = start_daemon(true).await;
    bridge.next().await;

    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.status().await.is_none());
}

#[tokio::test]
async fn test_unreadable_frames_do_not_wedge_the_connection() {
    let (mut bridge, _, _) = start_daemon(true).await;
    bridge.next().await;

    bridge
        .send_raw(serde_json::json!({ "cmd": "SomeFutureCommand" }))
        .await;
    bridge
        .send_raw(serde_json::json!({
            "cmd": "FocusIn",
            "target": { "ancestors": [{ "tag": "div", "attributes": { "data-id": 7 } }] }
        }))
        .await;
    bridge.send(Command::GetStatus).await;

    let mut errors = 0;
    loop {
        match bridge.next().await {
            Broadcast::Error { message } => {
                assert!(message.contains("unreadable"));
                errors += 1;
            }
            Broadcast::Status { .. } => break,
            _ => {}
        }
    }
    assert_eq!(errors, 2);

    // The focus path still works afterwards.
    bridge
        .send(Command::Navigate {
            location: "https://steamloopback.host/routes/library/home".into(),
        })
        .await;
    bridge
        .send(Command::FocusIn {
            target: FocusTarget::new(vec![ElementNode::with_attribute(
                "div", "data-id", "1145360",
            )]),
        })
        .await;
    bridge
        .expect(|b| matches!(b, Broadcast::Status { data } if data.playback == PlaybackStatus::Playing))
        .await;
}
