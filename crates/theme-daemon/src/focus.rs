//! Focus notifications and the host-UI capability.
//!
//! `FocusHub` is the subscribe/unsubscribe surface: the host socket pushes
//! every `FocusIn` into it, and the core holds one subscription for its
//! lifetime.  `HostUi` answers the two questions the router asks of the host:
//! where are we, and which game tile owns the focused element.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use theme_proto::protocol::FocusTarget;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<FocusTarget>>,
}

/// Fan-out of focus notifications to subscribers.  Cheap to clone.
#[derive(Clone, Default)]
pub struct FocusHub {
    inner: Arc<Mutex<HubInner>>,
}

pub struct FocusSubscription {
    id: u64,
    rx: mpsc::Receiver<FocusTarget>,
}

impl FocusSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<FocusTarget> {
        self.rx.recv().await
    }
}

impl FocusHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self) -> FocusSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = inner.next_id;
        inner.subscribers.insert(id, tx);
        debug!("focus: subscriber {} attached", id);
        FocusSubscription { id, rx }
    }

    pub async fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.inner.lock().await.subscribers.remove(&id).is_some();
        if removed {
            debug!("focus: subscriber {} detached", id);
        }
        removed
    }

    /// Deliver to every subscriber; returns how many took it.  A subscriber
    /// that has fallen behind loses the notification rather than blocking
    /// the host connection.
    pub async fn notify(&self, target: FocusTarget) -> usize {
        let inner = self.inner.lock().await;
        let mut delivered = 0;
        for (id, tx) in &inner.subscribers {
            match tx.try_send(target.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("focus: subscriber {} is full, dropping notification", id)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("focus: subscriber {} is gone", id)
                }
            }
        }
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

/// What the router needs from the host UI.
pub trait HostUi: Send + Sync {
    /// Active navigation location (the host's current URL or route).
    fn active_location(&self) -> String;

    /// Game identifier of the tile owning `target`, if any.
    fn find_game_tile_id(&self, target: &FocusTarget) -> Option<String>;
}

/// `HostUi` fed by the host socket: the bridge reports location changes and
/// sends each focused element's ancestor chain.
pub struct HostView {
    location: RwLock<String>,
    tile_attribute: String,
}

impl HostView {
    pub fn new(tile_attribute: impl Into<String>) -> Self {
        Self {
            location: RwLock::new(String::new()),
            tile_attribute: tile_attribute.into(),
        }
    }

    pub fn set_location(&self, location: &str) {
        match self.location.write() {
            Ok(mut guard) => *guard = location.to_string(),
            Err(poisoned) => *poisoned.into_inner() = location.to_string(),
        }
    }
}

impl HostUi for HostView {
    fn active_location(&self) -> String {
        match self.location.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn find_game_tile_id(&self, target: &FocusTarget) -> Option<String> {
        let tile = target.closest(&self.tile_attribute)?;
        match tile.attribute(&self.tile_attribute) {
            Some(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
            _ => {
                debug!("focus: tile <{}> has an empty {}", tile.tag, self.tile_attribute);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use theme_proto::protocol::ElementNode;

    #[tokio::test]
    async fn test_subscribe_notify_unsubscribe() {
        let hub = FocusHub::new();
        let mut sub = hub.subscribe().await;
        assert_eq!(hub.subscriber_count().await, 1);

        let target = FocusTarget::new(vec![ElementNode::with_attribute("div", "data-id", "7")]);
        assert_eq!(hub.notify(target.clone()).await, 1);
        assert_eq!(sub.recv().await, Some(target.clone()));

        assert!(hub.unsubscribe(sub.id()).await);
        assert!(!hub.unsubscribe(sub.id()).await);
        assert_eq!(hub.notify(target).await, 0);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_full_subscriber_drops() {
        let hub = FocusHub::new();
        let _sub = hub.subscribe().await;
        for _ in 0..SUBSCRIPTION_BUFFER {
            assert_eq!(hub.notify(FocusTarget::default()).await, 1);
        }
        assert_eq!(hub.notify(FocusTarget::default()).await, 0);
    }

    #[test]
    fn test_tile_lookup_walks_ancestors() {
        let view = HostView::new("data-id");
        let target = FocusTarget::new(vec![
            ElementNode::with_attribute("img", "class", "poster"),
            ElementNode::with_attribute("div", "data-id", "1145360"),
            ElementNode::with_attribute("div", "data-id", "shelf"),
        ]);
        assert_eq!(view.find_game_tile_id(&target).as_deref(), Some("1145360"));
    }

    #[test]
    fn test_tile_without_id() {
        let view = HostView::new("data-id");
        let no_tile = FocusTarget::new(vec![ElementNode::with_attribute("button", "class", "x")]);
        assert!(view.find_game_tile_id(&no_tile).is_none());

        let empty = FocusTarget::new(vec![ElementNode::with_attribute("div", "data-id", "")]);
        assert!(view.find_game_tile_id(&empty).is_none());
    }

    #[test]
    fn test_location_updates() {
        let view = HostView::new("data-id");
        assert_eq!(view.active_location(), "");
        view.set_location("https://steamloopback.host/routes/library/home");
        assert!(view.active_location().ends_with("/library/home"));
    }
}
