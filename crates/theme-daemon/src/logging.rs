use std::path::{Path, PathBuf};

use tokio::sync::broadcast;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::BroadcastMessage;

pub const LOG_FILE_NAME: &str = "daemon.log";
const DEFAULT_FILTER: &str = "info,theme_daemon=debug";

/// Forwards WARN and ERROR events to host bridges as `Log` broadcasts.
pub struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    pub fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }
        let _ = self.sender.send(BroadcastMessage::Log(format_event(event)));
    }
}

fn format_event(event: &tracing::Event<'_>) -> String {
    let now = chrono::Local::now();
    let mut message = format!("{} [{}] ", now.format("%H:%M:%S"), event.metadata().level());
    let mut visitor = MessageVisitor(&mut message);
    event.record(&mut visitor);
    message
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

/// File logging under `data_dir` plus the broadcast layer.  `RUST_LOG`
/// overrides the default filter.  Returns the log file path.
pub fn init(data_dir: &Path, broadcast_tx: broadcast::Sender<BroadcastMessage>) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(data_dir)?;
    let log_path = data_dir.join(LOG_FILE_NAME);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER)),
        )
        .try_init()?;

    Ok(log_path)
}
