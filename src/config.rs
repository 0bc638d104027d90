//! Store configuration.
//!
//! Applied once when a store is opened; performance pragmas are not part of
//! the hard logic and never change an attached store's behavior.

use crate::activation::ActivationMode;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// SQLite performance posture, applied at connection time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Optimization {
    /// WAL journaling, synchronous writes. Crash-safe.
    Safety,
    /// No journaling, no synchronous waits, exclusive locking. Fast, but a
    /// crash mid-transaction can corrupt the file.
    Performance,
}

/// Settings for the activation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationConfig {
    /// Which activation model ranks nodes.
    pub mode: ActivationMode,
    /// Decay exponent `d` for the base-level model.
    pub decay_rate: f64,
    /// Edge budget: a node with more augmentations than this does not get
    /// its activation copied onto its edges on access.
    pub threshold: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            mode: ActivationMode::Recency,
            decay_rate: 0.5,
            threshold: 100,
        }
    }
}

/// Configuration for opening a [`SemanticStore`](crate::SemanticStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// One long-lived transaction per attach, committed at checkpoints.
    /// When false, every mutating operation commits eagerly.
    pub lazy_commit: bool,

    /// Keep existing contents when attaching to a file store. When false,
    /// the store is erased and recreated (tabula rasa).
    pub append: bool,

    /// SQLite page size in bytes; power of two between 1 KiB and 64 KiB.
    pub page_size: u32,

    /// SQLite cache size in pages.
    pub cache_size: i64,

    /// Durability/performance pragma posture.
    pub optimization: Optimization,

    /// First id handed out by the node allocator.
    pub initial_lti_id: u64,

    /// Activation engine settings.
    pub activation: ActivationConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lazy_commit: true,
            append: true,
            page_size: 8192,
            cache_size: 10_000,
            optimization: Optimization::Safety,
            initial_lti_id: 1,
            activation: ActivationConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Load a configuration from JSON text. Missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Eager-commit variant of the default configuration.
    pub fn eager() -> Self {
        Self {
            lazy_commit: false,
            ..Self::default()
        }
    }

    /// Set the activation model.
    pub fn with_activation_mode(mut self, mode: ActivationMode) -> Self {
        self.activation.mode = mode;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(1024..=65_536).contains(&self.page_size) {
            return Err(Error::Config(format!(
                "page_size must be a power of two between 1024 and 65536, got {}",
                self.page_size
            )));
        }
        if self.cache_size <= 0 {
            return Err(Error::Config("cache_size must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.activation.decay_rate) {
            return Err(Error::Config(format!(
                "decay_rate must be in [0, 1), got {}",
                self.activation.decay_rate
            )));
        }
        if self.initial_lti_id == 0 {
            return Err(Error::Config("initial_lti_id must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        StoreConfig::default().validate().unwrap();
    }

    #[test]
    fn from_json_partial() {
        let config = StoreConfig::from_json(r#"{"lazy_commit": false, "page_size": 4096}"#).unwrap();
        assert!(!config.lazy_commit);
        assert_eq!(config.page_size, 4096);
        assert_eq!(config.cache_size, 10_000);
    }

    #[test]
    fn bad_page_size_rejected() {
        assert!(StoreConfig::from_json(r#"{"page_size": 3000}"#).is_err());
        assert!(StoreConfig::from_json(r#"{"page_size": 131072}"#).is_err());
    }

    #[test]
    fn bad_decay_rejected() {
        let mut config = StoreConfig::default();
        config.activation.decay_rate = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn activation_mode_roundtrips_through_json() {
        let config =
            StoreConfig::default().with_activation_mode(crate::activation::ActivationMode::BaseLevel);
        let text = serde_json::to_string(&config).unwrap();
        let back = StoreConfig::from_json(&text).unwrap();
        assert_eq!(back.activation.mode, crate::activation::ActivationMode::BaseLevel);
    }
}
