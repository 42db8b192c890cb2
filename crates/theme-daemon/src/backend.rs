/// Client side of the conversion backend.
///
/// The backend owns the music directory and the converted-file cache; the
/// daemon only asks it questions.  Every call opens a fresh TCP connection,
/// writes one `BackendRequest` frame and reads one `BackendReply` frame.
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use theme_proto::protocol::{decode_frame, encode_frame, BackendReply, BackendRequest};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{Result, ThemeError};

/// Operations the core and the settings surface consume from the backend.
#[async_trait]
pub trait MusicBackend: Send + Sync {
    /// Playable source URI for a music-track identifier, if the backend has one.
    async fn resolve_music_path(&self, video_id: &str) -> Result<Option<String>>;

    /// Whether any converted files exist.
    async fn converted_files_exist(&self) -> Result<bool>;

    async fn change_convert_quality(&self, quality: &str) -> Result<()>;

    async fn delete_converted_files(&self) -> Result<()>;

    /// Whether the theme-music downloader the backend depends on is installed.
    async fn install_check(&self) -> Result<bool>;
}

pub struct BackendClient {
    address: String,
    command_timeout: Duration,
}

impl BackendClient {
    pub fn new(address: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            command_timeout,
        }
    }

    /// One request/response exchange with no deadline of its own.
    pub async fn call(&self, request: &BackendRequest) -> Result<Value> {
        let mut stream = TcpStream::connect(&self.address).await?;
        let encoded =
            encode_frame(request).map_err(|e| ThemeError::protocol(e.to_string()))?;
        stream.write_all(&encoded).await?;
        debug!("backend: sent {:?}", request);

        let mut tmp = [0u8; 4096];
        let mut read_buf: Vec<u8> = Vec::new();
        loop {
            let n = stream.read(&mut tmp).await?;
            if n == 0 {
                return Err(ThemeError::protocol("backend closed connection before replying"));
            }
            read_buf.extend_from_slice(&tmp[..n]);
            if read_buf.len() < 4 {
                continue;
            }
            let len = u32::from_be_bytes([read_buf[0], read_buf[1], read_buf[2], read_buf[3]])
                as usize;
            if read_buf.len() < 4 + len {
                continue;
            }
            let (reply, _) = decode_frame::<BackendReply>(&read_buf)
                .map_err(|e| ThemeError::protocol(e.to_string()))?;
            return match reply.error {
                Some(message) => Err(ThemeError::Backend(message)),
                None => Ok(reply.result),
            };
        }
    }

    async fn call_bounded(&self, request: BackendRequest) -> Result<Value> {
        tokio::time::timeout(self.command_timeout, self.call(&request))
            .await
            .map_err(|_| ThemeError::BackendTimeout(self.command_timeout))?
    }
}

fn expect_bool(value: Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| ThemeError::protocol(format!("expected bool, got {}", value)))
}

#[async_trait]
impl MusicBackend for BackendClient {
    // The resolver bounds this one itself; conversion can be slow.
    async fn resolve_music_path(&self, video_id: &str) -> Result<Option<String>> {
        let request = BackendRequest::ResolveMusicPath {
            video_id: video_id.to_string(),
        };
        match self.call(&request).await? {
            Value::Null => Ok(None),
            Value::String(path) if path.is_empty() => Ok(None),
            Value::String(path) => Ok(Some(path)),
            other => Err(ThemeError::protocol(format!(
                "expected path or null, got {}",
                other
            ))),
        }
    }

    async fn converted_files_exist(&self) -> Result<bool> {
        expect_bool(self.call_bounded(BackendRequest::GetConvertedCount).await?)
    }

    async fn change_convert_quality(&self, quality: &str) -> Result<()> {
        self.call_bounded(BackendRequest::ChangeConvertQuality {
            quality: quality.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn delete_converted_files(&self) -> Result<()> {
        self.call_bounded(BackendRequest::DeleteConvertedAudio).await?;
        Ok(())
    }

    async fn install_check(&self) -> Result<bool> {
        expect_bool(
            self.call_bounded(BackendRequest::GameThemeMusicInstallCheck)
                .await?,
        )
    }
}
