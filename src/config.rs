// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bus configuration.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file from `CACHEBUS_CONFIG_PATH`
//! 3. Environment variables (`CACHEBUS_*` prefixed)
//!
//! Both values may be re-applied at runtime through [`Configurable`];
//! in-flight sends use the value current at send time.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Durability selector applied per published envelope.
///
/// Persistent delivery keeps slow or briefly disconnected peers from
/// missing events; non-persistent trades that for throughput.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// Configuration for the cache message manager.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BusConfig {
    /// Largest pair-set a bulk relation event may carry. Bulk mutations
    /// above this size are collapsed into a relation reset so peers refresh
    /// from the authoritative store instead of replaying the payload.
    ///
    /// Default: 10000
    #[serde(default = "default_maximum_relation_size")]
    #[validate(range(min = 1))]
    pub maximum_relation_size: usize,

    /// Delivery mode for outbound envelopes. Default: persistent
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            maximum_relation_size: default_maximum_relation_size(),
            delivery_mode: DeliveryMode::default(),
        }
    }
}

fn default_maximum_relation_size() -> usize {
    10000
}

impl BusConfig {
    /// Create a figment with all configuration sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var("CACHEBUS_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(BusConfig::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("CACHEBUS_"))
    }

    /// Load configuration from the default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Implemented by components that re-read configuration when the host
/// application reloads it.
pub trait Configurable: Send + Sync {
    fn configure(&self, config: &BusConfig);
}
