use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Host bridges check this on connect and can refuse to talk to
/// an incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Quality tags the settings surface offers for backend conversion.
pub const CONVERT_QUALITIES: [&str; 3] = ["24k", "32k", "64k"];

/// Recommended balance between audio quality and file size.
pub const RECOMMENDED_QUALITY: &str = "32k";

// ── host → daemon ─────────────────────────────────────────────────────────────

/// Messages sent from the host UI bridge to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// A focus-change notification for the element described by `target`.
    FocusIn { target: FocusTarget },
    /// The active navigation location changed.
    Navigate { location: String },
    SetEnabled { enabled: bool },
    ToggleEnabled,
    ForceStop,
    GetStatus,
    ChangeConvertQuality { quality: String },
    DeleteConvertedFiles,
    GetConvertedCount,
    InstallCheck,
}

/// One node of the focused element's ancestor chain.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ElementNode {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ElementNode {
    pub fn with_attribute(tag: &str, name: &str, value: &str) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(name.to_string(), value.to_string());
        Self {
            tag: tag.to_string(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// The element that received focus, as seen by the host.
///
/// `ancestors[0]` is the focused element itself, followed by its parent, and
/// so on up to the subscription root.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FocusTarget {
    #[serde(default)]
    pub ancestors: Vec<ElementNode>,
}

impl FocusTarget {
    pub fn new(ancestors: Vec<ElementNode>) -> Self {
        Self { ancestors }
    }

    /// Nearest node (self included) that carries `attribute`, like
    /// `Element.closest("[attr]")`.
    pub fn closest(&self, attribute: &str) -> Option<&ElementNode> {
        self.ancestors
            .iter()
            .find(|node| node.attributes.contains_key(attribute))
    }
}

// ── daemon → host ─────────────────────────────────────────────────────────────

/// Messages sent from the daemon to host bridges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full status snapshot.
    Hello {
        protocol_version: u32,
        status: StatusSnapshot,
    },
    Status {
        data: StatusSnapshot,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
    ConvertedFiles {
        any: bool,
    },
    Installed {
        installed: bool,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Playing,
}

/// Observable state of the core.  `rev` increments on every change so
/// clients can tell whether they missed an update.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StatusSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub enabled: bool,
    pub playback: PlaybackStatus,
    pub current_game_id: Option<String>,
    pub source: Option<String>,
    pub at_home: bool,
    pub cached_sources: usize,
}

/// Wrapper for host socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        encode_frame(self)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        decode_frame(data)
    }
}

// ── daemon → backend ──────────────────────────────────────────────────────────

/// Calls understood by the conversion backend.  One request per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum BackendRequest {
    ResolveMusicPath { video_id: String },
    GetConvertedCount,
    ChangeConvertQuality { quality: String },
    DeleteConvertedAudio,
    GameThemeMusicInstallCheck,
}

/// Backend answer.  `error` set means the call failed; otherwise `result`
/// carries the method's return value (`null` for commands).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackendReply {
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl BackendReply {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            result,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            result: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

// ── framing ───────────────────────────────────────────────────────────────────

/// Length-prefixed JSON: 4-byte big-endian length, then the document.
pub fn encode_frame<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let len = json.len() as u32;
    let mut result = Vec::with_capacity(4 + json.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&json);
    Ok(result)
}

/// Total size (header included) of the frame at the front of `data`, once
/// all of it has arrived.
pub fn frame_len(data: &[u8]) -> Option<usize> {
    let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let len = 4 + u32::from_be_bytes(header) as usize;
    (data.len() >= len).then_some(len)
}

/// Decode one frame from the front of `data`, returning the value and the
/// number of bytes consumed.  Fails when the frame is incomplete.
pub fn decode_frame<T: DeserializeOwned>(data: &[u8]) -> anyhow::Result<(T, usize)> {
    if data.len() < 4 {
        anyhow::bail!("Insufficient data for length header");
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < 4 + len {
        anyhow::bail!("Insufficient data for message");
    }
    let value: T = serde_json::from_slice(&data[4..4 + len])?;
    Ok((value, 4 + len))
}
