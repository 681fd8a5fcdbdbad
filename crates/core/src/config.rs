//! Configuration for the volume populator controller.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::result::Result;

/// Name reported by the controller on emitted events.
pub const DEFAULT_CONTROLLER_NAME: &str = "volsync-volume-populator";

/// Prefix of shadow claim names (`<prefix>-<claim uid>`).
pub const DEFAULT_SHADOW_PREFIX: &str = "vs-prime";

/// Configuration for the populator controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulatorConfig {
    /// Controller name used as the event source component.
    #[serde(default = "default_controller_name")]
    pub controller_name: String,

    /// Prefix of shadow claim names.
    #[serde(default = "default_shadow_prefix")]
    pub shadow_prefix: String,

    /// Maximum number of claims reconciled at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciles: usize,

    /// First retry delay after a failed reconcile.
    #[serde(with = "duration_secs", default = "default_base_backoff")]
    pub base_backoff: Duration,

    /// Upper bound of the retry delay.
    #[serde(with = "duration_secs", default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Ignore claims whose storage class uses an unmigrated in-tree provisioner.
    #[serde(default)]
    pub reject_in_tree_provisioners: bool,

    /// Restrict claim and destination watches to one namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl Default for PopulatorConfig {
    fn default() -> Self {
        Self {
            controller_name: default_controller_name(),
            shadow_prefix: default_shadow_prefix(),
            max_concurrent_reconciles: default_max_concurrent(),
            base_backoff: default_base_backoff(),
            max_backoff: default_max_backoff(),
            reject_in_tree_provisioners: false,
            namespace: None,
        }
    }
}

impl PopulatorConfig {
    /// Set the shadow claim prefix.
    #[must_use]
    pub fn shadow_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shadow_prefix = prefix.into();
        self
    }

    /// Set the concurrency ceiling.
    #[must_use]
    pub const fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_reconciles = max;
        self
    }

    /// Restrict the watches to a namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Load configuration from a file.
    ///
    /// `.json` files are parsed as JSON, everything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content).map_err(|e| Error::json_parse_failed(e.to_string()))
        } else {
            toml::from_str(&content).map_err(|e| Error::toml_parse_failed(e.to_string()))
        }
    }

    /// Apply `VOLPOP_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric or boolean variable does not parse.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric or boolean value does not parse.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("VOLPOP_SHADOW_PREFIX") {
            self.shadow_prefix = prefix;
        }

        if let Some(max) = lookup("VOLPOP_MAX_CONCURRENT") {
            self.max_concurrent_reconciles = max
                .parse()
                .map_err(|_| Error::invalid_config("VOLPOP_MAX_CONCURRENT", max.clone()))?;
        }

        if let Some(namespace) = lookup("VOLPOP_NAMESPACE") {
            self.namespace = Some(namespace).filter(|ns| !ns.is_empty());
        }

        if let Some(reject) = lookup("VOLPOP_REJECT_IN_TREE") {
            self.reject_in_tree_provisioners = match reject.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => return Err(Error::invalid_config("VOLPOP_REJECT_IN_TREE", reject)),
            };
        }

        Ok(self)
    }

    /// Check the configuration for values the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        if self.shadow_prefix.trim().is_empty() {
            return Err(Error::invalid_config("shadow_prefix", "must not be empty"));
        }
        if self.controller_name.trim().is_empty() {
            return Err(Error::invalid_config("controller_name", "must not be empty"));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(Error::invalid_config(
                "max_concurrent_reconciles",
                "must be at least 1",
            ));
        }
        if self.base_backoff > self.max_backoff {
            return Err(Error::invalid_config(
                "base_backoff",
                format!(
                    "{}s exceeds max_backoff {}s",
                    self.base_backoff.as_secs(),
                    self.max_backoff.as_secs()
                ),
            ));
        }
        Ok(())
    }
}

fn default_controller_name() -> String {
    DEFAULT_CONTROLLER_NAME.to_string()
}

fn default_shadow_prefix() -> String {
    DEFAULT_SHADOW_PREFIX.to_string()
}

const fn default_max_concurrent() -> usize {
    100
}

const fn default_base_backoff() -> Duration {
    Duration::from_secs(5)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

/// Serialization helper for Duration as seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
