/// ThemeCore — single-owner event loop for all pipeline state.
///
/// The core owns the playback controller, the enablement gate and the
/// resolution generation counter; no other task touches them.  Inputs arrive
/// on two channels: the focus subscription (from `FocusHub`) and `CoreEvent`s
/// (host controls, resolution results, status queries).
///
/// Resolution runs in spawned tasks so a slow backend never delays a stop.
/// Each task carries the generation that was current when it was issued; a
/// result is applied only if nothing newer has happened since.  Leaving home,
/// closing the gate and force-stop all bump the generation too.
use std::sync::Arc;

use theme_proto::config::Config;
use theme_proto::protocol::{FocusTarget, PlaybackStatus, StatusSnapshot};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::focus::{FocusHub, FocusSubscription, HostUi};
use crate::gate::EnablementGate;
use crate::playback::{AudioOutput, PlaybackController};
use crate::resolver::{Resolution, SourceResolver};
use crate::BroadcastMessage;

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// Everything except focus notifications that flows into the core loop.
#[derive(Debug)]
pub enum CoreEvent {
    SetEnabled(bool),
    ToggleEnabled,
    ForceStop,
    /// The host reported a new location; leaving home stops playback at once.
    LocationChanged,
    /// A spawned resolution finished.
    Resolved {
        generation: u64,
        game_id: String,
        outcome: Option<Resolution>,
    },
    GetStatus(oneshot::Sender<StatusSnapshot>),
    Shutdown,
}

/// Cloneable front door to a running core.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::Sender<CoreEvent>,
}

impl CoreHandle {
    pub fn new(tx: mpsc::Sender<CoreEvent>) -> Self {
        Self { tx }
    }

    async fn send(&self, event: CoreEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub async fn set_enabled(&self, enabled: bool) -> bool {
        self.send(CoreEvent::SetEnabled(enabled)).await
    }

    pub async fn toggle_enabled(&self) -> bool {
        self.send(CoreEvent::ToggleEnabled).await
    }

    pub async fn force_stop(&self) -> bool {
        self.send(CoreEvent::ForceStop).await
    }

    pub async fn location_changed(&self) -> bool {
        self.send(CoreEvent::LocationChanged).await
    }

    pub async fn shutdown(&self) -> bool {
        self.send(CoreEvent::Shutdown).await
    }

    /// `None` when the core has stopped.
    pub async fn status(&self) -> Option<StatusSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.send(CoreEvent::GetStatus(tx)).await {
            return None;
        }
        rx.await.ok()
    }
}

// ── settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoreSettings {
    /// Substring of the location that marks the home screen.
    pub home_location: String,
    pub enabled_on_start: bool,
    pub default_volume: f32,
}

impl CoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            home_location: config.ui.home_location.clone(),
            enabled_on_start: config.playback.enabled_on_start,
            default_volume: config.playback.default_volume,
        }
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ── ThemeCore ─────────────────────────────────────────────────────────────────

pub struct ThemeCore {
    settings: CoreSettings,
    host: Arc<dyn HostUi>,
    hub: FocusHub,
    focus: Option<FocusSubscription>,
    resolver: Arc<SourceResolver>,
    playback: PlaybackController,
    gate: EnablementGate,
    /// Incremented on every new focus target and every invalidation.
    generation: u64,
    /// Game whose resolution the router is waiting on, if any.
    pending: Option<String>,
    /// Resolution tasks post their results back through this.
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    rev: u64,
}

impl ThemeCore {
    /// Subscribes to `hub` immediately, so focus notifications sent after
    /// `new` returns are never lost.
    pub async fn new(
        settings: CoreSettings,
        host: Arc<dyn HostUi>,
        hub: FocusHub,
        resolver: Arc<SourceResolver>,
        output: Box<dyn AudioOutput>,
        event_tx: mpsc::Sender<CoreEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let focus = hub.subscribe().await;
        let gate = EnablementGate::new(settings.enabled_on_start);
        Self {
            settings,
            host,
            hub,
            focus: Some(focus),
            resolver,
            playback: PlaybackController::new(output),
            gate,
            generation: 0,
            pending: None,
            event_tx,
            broadcast_tx,
            rev: 0,
        }
    }

    /// Run until `Shutdown`, then tear down: unsubscribe, stop, clear cache.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        let mut focus = self
            .focus
            .take()
            .ok_or_else(|| anyhow::anyhow!("focus subscription already taken"))?;
        info!("ThemeCore: starting event loop");
        self.publish_status().await;

        loop {
            tokio::select! {
                // Focus first: a notification sent before a query is seen first.
                biased;

                target = focus.recv() => match target {
                    Some(target) => self.on_focus(target).await,
                    None => {
                        warn!("ThemeCore: focus subscription closed");
                        break;
                    }
                },

                evt = event_rx.recv() => match evt {
                    None => {
                        info!("ThemeCore: event channel closed, shutting down");
                        break;
                    }
                    Some(CoreEvent::Shutdown) => {
                        info!("ThemeCore: shutdown requested");
                        break;
                    }
                    Some(evt) => self.handle_event(evt).await,
                },
            }
        }

        self.teardown(focus.id()).await;
        Ok(())
    }

    async fn handle_event(&mut self, evt: CoreEvent) {
        match evt {
            CoreEvent::SetEnabled(enabled) => {
                if self.gate.set(enabled) {
                    self.on_gate_changed().await;
                }
            }
            CoreEvent::ToggleEnabled => {
                self.gate.toggle();
                self.on_gate_changed().await;
            }
            CoreEvent::ForceStop => {
                info!("ThemeCore: force stop");
                self.invalidate();
                self.playback.stop().await;
                self.publish_status().await;
            }
            CoreEvent::LocationChanged => {
                let location = self.host.active_location();
                if !self.is_home(&location) {
                    self.leave_home(&location).await;
                } else {
                    self.publish_status().await;
                }
            }
            CoreEvent::Resolved {
                generation,
                game_id,
                outcome,
            } => self.on_resolved(generation, game_id, outcome).await,
            CoreEvent::GetStatus(reply) => {
                let cached = self.cached_sources().await;
                let _ = reply.send(self.snapshot(cached));
            }
            CoreEvent::Shutdown => {}
        }
    }

    // ── router ────────────────────────────────────────────────────────────────

    async fn on_focus(&mut self, target: FocusTarget) {
        let location = self.host.active_location();
        if !self.is_home(&location) {
            self.leave_home(&location).await;
            return;
        }

        if !self.gate.is_open() {
            debug!("ThemeCore: gate closed, ignoring focus");
            return;
        }

        let Some(game_id) = self.host.find_game_tile_id(&target) else {
            debug!("ThemeCore: no game tile under focused element");
            return;
        };
        info!("ThemeCore: focused tile with game id {}", game_id);

        if self.pending.as_deref() == Some(game_id.as_str()) {
            debug!("ThemeCore: game {} is already being resolved", game_id);
            return;
        }
        if self.playback.current_game_id() == Some(game_id.as_str()) {
            // Back on the playing tile: whatever was in flight is now stale.
            if self.pending.is_some() {
                self.invalidate();
            }
            debug!("ThemeCore: game {} is already playing", game_id);
            return;
        }

        self.begin_resolution(game_id);
    }

    fn begin_resolution(&mut self, game_id: String) {
        self.generation += 1;
        let generation = self.generation;
        self.pending = Some(game_id.clone());

        let resolver = Arc::clone(&self.resolver);
        let tx = self.event_tx.clone();
        let playing = self.playback.current_game_id().map(str::to_owned);
        tokio::spawn(async move {
            let outcome = resolver.resolve(&game_id, playing.as_deref()).await;
            let _ = tx
                .send(CoreEvent::Resolved {
                    generation,
                    game_id,
                    outcome,
                })
                .await;
        });
    }

    async fn on_resolved(&mut self, generation: u64, game_id: String, outcome: Option<Resolution>) {
        if generation != self.generation {
            debug!(
                "ThemeCore: discarding stale resolution for {} (gen {} != {})",
                game_id, generation, self.generation
            );
            return;
        }
        self.pending = None;

        if !self.gate.is_open() {
            debug!("ThemeCore: gate closed, dropping resolution for {}", game_id);
            return;
        }

        match outcome {
            Some(resolution) => {
                // Runs inline: stop/gate/navigation events queue behind it,
                // bounded by the output's spawn and start-confirmation waits.
                let volume = resolution.volume.unwrap_or(self.settings.default_volume);
                self.playback
                    .play(&game_id, &resolution.source, volume)
                    .await;
            }
            None if self.playback.current_game_id() == Some(game_id.as_str()) => {}
            None => {
                info!("ThemeCore: no theme music for game {}", game_id);
                self.playback.stop().await;
            }
        }
        self.publish_status().await;
    }

    /// Outside home nothing may play, and cached sources may be about to go
    /// stale (the user could be changing a game's theme).
    async fn leave_home(&mut self, location: &str) {
        debug!("ThemeCore: not home ({}), stopping and clearing cache", location);
        self.invalidate();
        self.playback.stop().await;
        self.resolver.clear_cache().await;
        self.publish_status().await;
    }

    async fn on_gate_changed(&mut self) {
        if self.gate.is_open() {
            info!("ThemeCore: home playback enabled");
        } else {
            info!("ThemeCore: home playback disabled");
            self.invalidate();
            self.playback.stop().await;
        }
        self.publish_status().await;
    }

    /// Make every in-flight resolution stale.
    fn invalidate(&mut self) {
        self.generation += 1;
        self.pending = None;
    }

    fn is_home(&self, location: &str) -> bool {
        location.contains(&self.settings.home_location)
    }

    async fn teardown(&mut self, subscription_id: u64) {
        self.hub.unsubscribe(subscription_id).await;
        self.invalidate();
        self.playback.close().await;
        self.resolver.clear_cache().await;
        info!("ThemeCore: torn down, focus listener removed and cache cleared");
    }

    // ── status ────────────────────────────────────────────────────────────────

    async fn cached_sources(&mut self) -> usize {
        let resolver = Arc::clone(&self.resolver);
        resolver.cache().len().await
    }

    fn snapshot(&self, cached_sources: usize) -> StatusSnapshot {
        StatusSnapshot {
            rev: self.rev,
            enabled: self.gate.is_open(),
            playback: if self.playback.is_playing() {
                PlaybackStatus::Playing
            } else {
                PlaybackStatus::Idle
            },
            current_game_id: self.playback.current_game_id().map(str::to_owned),
            source: self.playback.current_source().map(str::to_owned),
            at_home: self.is_home(&self.host.active_location()),
            cached_sources,
        }
    }

    async fn publish_status(&mut self) {
        self.rev += 1;
        let cached = self.cached_sources().await;
        let snapshot = self.snapshot(cached);
        // No receivers is fine
        let _ = self.broadcast_tx.send(BroadcastMessage::Status(snapshot));
    }
}
