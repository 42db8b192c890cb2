//! PlaybackController — owns the single audio output.
//!
//! Two states, `Idle` and `Playing(game)`.  Switching tracks is always
//! stop-then-play, so the device never holds two sources.  Nothing here
//! returns an error to the caller: device failures are logged and leave the
//! controller `Idle`.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::Result;

/// The audio device as the controller sees it.
#[async_trait]
pub trait AudioOutput: Send {
    /// Load `source` paused.  Replaces nothing: the controller detaches first.
    async fn attach(&mut self, source: &str) -> Result<()>;

    /// 0.0–1.0
    async fn set_volume(&mut self, volume: f32) -> Result<()>;

    /// Begin audible playback of the attached source.
    async fn start(&mut self) -> Result<()>;

    async fn pause(&mut self) -> Result<()>;

    /// Seek back to the start of the attached source.
    async fn rewind(&mut self) -> Result<()>;

    async fn detach(&mut self) -> Result<()>;

    /// Release the device for good.
    async fn close(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Playing { game_id: String, source: String },
}

pub struct PlaybackController {
    output: Box<dyn AudioOutput>,
    state: PlaybackState,
}

impl PlaybackController {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            state: PlaybackState::Idle,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, PlaybackState::Playing { .. })
    }

    pub fn current_game_id(&self) -> Option<&str> {
        match &self.state {
            PlaybackState::Playing { game_id, .. } => Some(game_id),
            PlaybackState::Idle => None,
        }
    }

    pub fn current_source(&self) -> Option<&str> {
        match &self.state {
            PlaybackState::Playing { source, .. } => Some(source),
            PlaybackState::Idle => None,
        }
    }

    /// Stop whatever is playing, then play `source` for `game_id`.
    /// Returns whether playback actually started.
    pub async fn play(&mut self, game_id: &str, source: &str, volume: f32) -> bool {
        if self.is_playing() {
            self.stop().await;
        }

        if let Err(e) = self.output.attach(source).await {
            warn!("playback: device rejected source for game {}: {}", game_id, e);
            self.release().await;
            return false;
        }
        if let Err(e) = self.output.set_volume(volume.clamp(0.0, 1.0)).await {
            warn!("playback: could not set volume {}: {}", volume, e);
        }
        if let Err(e) = self.output.start().await {
            warn!("playback: start failed for game {}: {}", game_id, e);
            self.release().await;
            return false;
        }

        self.state = PlaybackState::Playing {
            game_id: game_id.to_string(),
            source: source.to_string(),
        };
        info!("playback: playing theme for game {}", game_id);
        true
    }

    /// Idempotent.  Pause, rewind, detach, forget the game.
    pub async fn stop(&mut self) {
        let was_playing = self.is_playing();
        if was_playing {
            if let Err(e) = self.output.pause().await {
                warn!("playback: pause failed: {}", e);
            }
        }
        self.release().await;
        self.state = PlaybackState::Idle;
        if was_playing {
            info!("playback: audio stopped");
        } else {
            debug!("playback: stop while idle");
        }
    }

    /// Stop and release the device.
    pub async fn close(&mut self) {
        self.stop().await;
        self.output.close().await;
    }

    async fn release(&mut self) {
        // Nothing may be loaded; the device complaining about that is expected.
        if let Err(e) = self.output.rewind().await {
            debug!("playback: rewind: {}", e);
        }
        if let Err(e) = self.output.detach().await {
            debug!("playback: detach: {}", e);
        }
    }
}
