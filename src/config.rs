//! Session configuration.
//!
//! ```rust,ignore
//! let config = SessionConfig::default()
//!     .with_name("inbox")
//!     .with_delivery_buffer_capacity(256);
//!
//! let config = SessionConfig::from_json_str(r#"{ "name": "inbox", "lazy_notifier": false }"#)?;
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default capacity of the writer request channel.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1024;

/// Default capacity of the notifier request channel.
pub const DEFAULT_NOTIFIER_QUEUE_CAPACITY: usize = 1024;

/// Default number of undelivered events a subscription may hold.
///
/// A subscriber that falls further behind is cancelled with
/// [`Error::InsufficientBuffer`].
pub const DEFAULT_DELIVERY_BUFFER_CAPACITY: usize = 64;

/// Configuration for a [`Session`](crate::Session).
///
/// Every field is optional when loading from JSON; missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Used in thread names and log spans.
    pub name: String,

    /// Bounded capacity of the writer's request channel.
    pub write_queue_capacity: usize,

    /// Bounded capacity of the notifier's request channel.
    pub notifier_queue_capacity: usize,

    /// Per-subscription delivery buffer.
    pub delivery_buffer_capacity: usize,

    /// Start the notifier on first subscription instead of on open.
    pub lazy_notifier: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            notifier_queue_capacity: DEFAULT_NOTIFIER_QUEUE_CAPACITY,
            delivery_buffer_capacity: DEFAULT_DELIVERY_BUFFER_CAPACITY,
            lazy_notifier: true,
        }
    }
}

impl SessionConfig {
    /// Parses a configuration from JSON and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects zero capacities and an empty name.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_state("session name must not be empty"));
        }
        for (field, value) in [
            ("write_queue_capacity", self.write_queue_capacity),
            ("notifier_queue_capacity", self.notifier_queue_capacity),
            ("delivery_buffer_capacity", self.delivery_buffer_capacity),
        ] {
            if value == 0 {
                return Err(Error::invalid_state(format!("{field} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_write_queue_capacity(mut self, capacity: usize) -> Self {
        self.write_queue_capacity = capacity;
        self
    }

    pub fn with_notifier_queue_capacity(mut self, capacity: usize) -> Self {
        self.notifier_queue_capacity = capacity;
        self
    }

    pub fn with_delivery_buffer_capacity(mut self, capacity: usize) -> Self {
        self.delivery_buffer_capacity = capacity;
        self
    }

    pub fn with_lazy_notifier(mut self, lazy: bool) -> Self {
        self.lazy_notifier = lazy;
        self
    }
}
