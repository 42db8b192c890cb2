//! Host bridge socket.
//!
//! Bridges connect over TCP and speak length-prefixed JSON `Message`s.  Focus
//! and navigation commands feed the focus hub and host view; controls go to
//! the core; settings commands go straight to the backend.  Every bridge gets
//! a `Hello` on connect and then each `Status`/`Log` broadcast.

use std::sync::Arc;

use theme_proto::protocol::{
    frame_len, Broadcast, Command, Message, CONVERT_QUALITIES, PROTOCOL_VERSION,
    RECOMMENDED_QUALITY,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::backend::MusicBackend;
use crate::core::CoreHandle;
use crate::focus::{FocusHub, HostView};
use crate::BroadcastMessage;

/// Everything a client connection dispatches into.
#[derive(Clone)]
pub struct HostContext {
    pub core: CoreHandle,
    pub hub: FocusHub,
    pub host: Arc<HostView>,
    pub backend: Arc<dyn MusicBackend>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    ctx: HostContext,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };
        info!("Host socket listening at {}", addr);
        serve(listener, ctx, broadcast_tx).await;
    })
}

/// Accept loop over an already bound listener.
pub async fn serve(
    listener: TcpListener,
    ctx: HostContext,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Host bridge {} connected from {}", id, peer);

                let ctx = ctx.clone();
                let bcast_rx = broadcast_tx.subscribe();
                tokio::spawn(async move {
                    handle_client(stream, ctx, id, bcast_rx).await;
                    info!("Host bridge {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    ctx: HostContext,
    client_id: usize,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let Some(status) = ctx.core.status().await else {
        warn!("Host bridge {}: core is not running", client_id);
        return;
    };
    let hello = Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        status,
    };
    if send(&mut write_half, hello).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        debug!("Host bridge {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while let Some(len) = frame_len(&read_buf) {
                            let frame: Vec<u8> = read_buf.drain(..len).collect();
                            let reply = match Message::decode(&frame) {
                                Ok((Message::Command(cmd), _)) => {
                                    debug!("Host bridge {} sent command: {:?}", client_id, cmd);
                                    dispatch(&ctx, cmd).await
                                }
                                Ok(_) => None,
                                // A complete frame we cannot parse is dropped on its own.
                                Err(e) => {
                                    warn!("Host bridge {} sent an unreadable frame: {}", client_id, e);
                                    Some(Broadcast::Error {
                                        message: format!("unreadable message: {}", e),
                                    })
                                }
                            };
                            if let Some(reply) = reply {
                                if send(&mut write_half, reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from host bridge {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let outgoing = match msg {
                    Ok(BroadcastMessage::Status(data)) => Broadcast::Status { data },
                    Ok(BroadcastMessage::Log(message)) => Broadcast::Log { message },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Host bridge {} missed {} broadcast messages", client_id, n);
                        match ctx.core.status().await {
                            Some(data) => Broadcast::Status { data },
                            None => break,
                        }
                    }
                    Err(_) => break,
                };
                if send(&mut write_half, outgoing).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Apply one command.  Returns the direct reply, if the command has one;
/// state changes reach the bridge as `Status` broadcasts instead.
async fn dispatch(ctx: &HostContext, cmd: Command) -> Option<Broadcast> {
    match cmd {
        Command::FocusIn { target } => {
            if ctx.hub.notify(target).await == 0 {
                debug!("focus notification had no subscriber");
            }
            None
        }
        Command::Navigate { location } => {
            ctx.host.set_location(&location);
            ctx.core.location_changed().await;
            None
        }
        Command::SetEnabled { enabled } => {
            ctx.core.set_enabled(enabled).await;
            None
        }
        Command::ToggleEnabled => {
            ctx.core.toggle_enabled().await;
            None
        }
        Command::ForceStop => {
            ctx.core.force_stop().await;
            None
        }
        Command::GetStatus => ctx
            .core
            .status()
            .await
            .map(|data| Broadcast::Status { data }),
        Command::GetConvertedCount => Some(match ctx.backend.converted_files_exist().await {
            Ok(any) => Broadcast::ConvertedFiles { any },
            Err(e) => Broadcast::Error {
                message: e.to_string(),
            },
        }),
        Command::InstallCheck => Some(match ctx.backend.install_check().await {
            Ok(installed) => Broadcast::Installed { installed },
            Err(e) => Broadcast::Error {
                message: e.to_string(),
            },
        }),
        Command::ChangeConvertQuality { quality } => {
            if !CONVERT_QUALITIES.contains(&quality.as_str()) {
                return Some(Broadcast::Error {
                    message: format!(
                        "unknown convert quality {:?} (try {})",
                        quality, RECOMMENDED_QUALITY
                    ),
                });
            }
            let backend = Arc::clone(&ctx.backend);
            tokio::spawn(async move {
                match backend.change_convert_quality(&quality).await {
                    Ok(()) => info!("Convert quality set to {}", quality),
                    Err(e) => warn!("Failed to change convert quality: {}", e),
                }
            });
            None
        }
        Command::DeleteConvertedFiles => {
            let backend = Arc::clone(&ctx.backend);
            tokio::spawn(async move {
                match backend.delete_converted_files().await {
                    Ok(()) => info!("Converted files deleted"),
                    Err(e) => warn!("Failed to delete converted files: {}", e),
                }
            });
            None
        }
    }
}

async fn send(write_half: &mut OwnedWriteHalf, broadcast: Broadcast) -> anyhow::Result<()> {
    let encoded = Message::Broadcast(broadcast).encode()?;
    write_half.write_all(&encoded).await?;
    Ok(())
}
