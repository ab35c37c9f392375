use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Catalog;

pub const ISOC_MAX_PAYLOAD_TRANSFER_SIZE: u32 = 1024;
pub const BULK_MAX_PAYLOAD_TRANSFER_SIZE: u32 = 16 * 1024;

pub const ENV_BULK: &str = "UVC_GADGET_BULK";
pub const ENV_BUFFERS: &str = "UVC_GADGET_BUFFERS";

#[derive(Debug, Clone)]
pub struct UvcConfig {
    pub bulk: bool,
    pub buffer_count: u32,
    pub event_timeout: Duration,
    /// How long the buffer side and the producer yield while not streaming.
    pub idle_backoff: Duration,
    pub catalog: Arc<Catalog>,
}

impl Default for UvcConfig {
    fn default() -> Self {
        UvcConfig {
            bulk: false,
            buffer_count: 3,
            event_timeout: Duration::from_secs(1),
            idle_backoff: Duration::from_millis(100),
            catalog: Arc::new(Catalog::default()),
        }
    }
}

impl UvcConfig {
    /// Defaults overlaid with `UVC_GADGET_BULK` and `UVC_GADGET_BUFFERS`.
    pub fn from_env() -> UvcConfig {
        UvcConfig::default().apply_env(|key| std::env::var(key).ok())
    }

    fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> UvcConfig {
        if let Some(value) = lookup(ENV_BULK) {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.bulk = true,
                "0" | "false" | "no" | "off" | "" => self.bulk = false,
                other => warn!("ignoring {}={}", ENV_BULK, other),
            }
        }
        if let Some(value) = lookup(ENV_BUFFERS) {
            match value.trim().parse::<u32>() {
                Ok(count) if count > 0 => self.buffer_count = count,
                _ => warn!("ignoring {}={}", ENV_BUFFERS, value),
            }
        }
        self
    }

    pub fn max_payload_transfer_size(&self) -> u32 {
        if self.bulk {
            BULK_MAX_PAYLOAD_TRANSFER_SIZE
        } else {
            ISOC_MAX_PAYLOAD_TRANSFER_SIZE
        }
    }

    pub fn with_bulk(mut self, bulk: bool) -> UvcConfig {
        self.bulk = bulk;
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: u32) -> UvcConfig {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_event_timeout(mut self, timeout: Duration) -> UvcConfig {
        self.event_timeout = timeout;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> UvcConfig {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> UvcConfig {
        self.catalog = Arc::new(catalog);
        self
    }
}
