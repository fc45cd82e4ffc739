//! Runtime configuration.
//!
//! [`CoreConfig`] carries the tunables for the channel and delivery layers.
//! Defaults are compiled in; an optional TOML file overrides individual
//! fields. A missing file is not an error — the defaults simply apply.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// The file contents are not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Resolved configuration for the client core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Upper bound on a channel handshake.
    pub connect_timeout: Duration,
    /// Capacity of the channel-event queue between manager and coordinator.
    pub event_buffer: usize,
    /// Capacity of the inbound-message queue to the consumer.
    pub message_buffer: usize,
    /// Capacity of the call-signal queue to the consumer.
    pub call_buffer: usize,
    /// Maximum queued messages per unreachable peer; the oldest is evicted
    /// at the cap.
    pub max_pending_per_peer: usize,
    /// Maximum message ids tracked for duplicate suppression.
    pub max_duplicate_tracking: usize,
    /// Interval between inbox polls when the poller is running.
    pub inbox_poll_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            event_buffer: 64,
            message_buffer: 64,
            call_buffer: 16,
            max_pending_per_peer: 1000,
            max_duplicate_tracking: 10_000,
            inbox_poll_interval: Duration::from_secs(2),
        }
    }
}

impl CoreConfig {
    /// Loads configuration, layering file overrides over the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file exists but cannot be read or
    /// parsed. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)?;
        let overlay: ConfigFile = toml::from_str(&raw)?;
        config.apply(overlay);
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    fn apply(&mut self, overlay: ConfigFile) {
        if let Some(channel) = overlay.channel {
            if let Some(ms) = channel.connect_timeout_ms {
                self.connect_timeout = Duration::from_millis(ms);
            }
            if let Some(n) = channel.event_buffer {
                self.event_buffer = n;
            }
        }
        if let Some(delivery) = overlay.delivery {
            if let Some(n) = delivery.message_buffer {
                self.message_buffer = n;
            }
            if let Some(n) = delivery.call_buffer {
                self.call_buffer = n;
            }
            if let Some(n) = delivery.max_pending_per_peer {
                self.max_pending_per_peer = n;
            }
            if let Some(n) = delivery.max_duplicate_tracking {
                self.max_duplicate_tracking = n;
            }
            if let Some(ms) = delivery.inbox_poll_interval_ms {
                self.inbox_poll_interval = Duration::from_millis(ms);
            }
        }
    }
}

/// On-disk schema: every field optional so a file can override just one
/// knob.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    channel: Option<ChannelSection>,
    delivery: Option<DeliverySection>,
}

#[derive(Debug, Default, Deserialize)]
struct ChannelSection {
    connect_timeout_ms: Option<u64>,
    event_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DeliverySection {
    message_buffer: Option<usize>,
    call_buffer: Option<usize>,
    max_pending_per_peer: Option<usize>,
    max_duplicate_tracking: Option<usize>,
    inbox_poll_interval_ms: Option<u64>,
}

/// Installs the global tracing subscriber, honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
