pub mod backend;
pub mod core;
pub mod error;
pub mod focus;
pub mod gate;
pub mod logging;
pub mod mpv;
pub mod playback;
pub mod resolver;
pub mod socket;

use theme_proto::protocol::StatusSnapshot;

/// Fan-out from the core (and the log layer) to every connected host bridge.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    Status(StatusSnapshot),
    Log(String),
}
