//! Configuration module for quote-to-cash-service.

use secrecy::{ExposeSecret, Secret};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

use crate::services::LifecycleSettings;

/// `DATABASE_URL` value that selects the in-process ledger store.
pub const MEMORY_DATABASE_URL: &str = "memory://";

#[derive(Debug, Clone)]
pub struct QuoteToCashConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub collaborators: CollaboratorConfig,
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.expose_secret().starts_with(MEMORY_DATABASE_URL)
    }
}

#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    /// Empty means notifications are only logged.
    pub notification_service_url: String,
    /// Empty means documents go out without a PDF.
    pub renderer_service_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub share_link_days: i64,
    pub public_base_url: String,
}

impl QuoteToCashConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "quote-to-cash-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map(Secret::new).map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
            },
            collaborators: CollaboratorConfig {
                notification_service_url: env::var("NOTIFICATION_SERVICE_URL").unwrap_or_default(),
                renderer_service_url: env::var("RENDERER_SERVICE_URL").unwrap_or_default(),
                timeout_secs: env::var("DOWNSTREAM_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(20),
            },
            lifecycle: LifecycleConfig {
                share_link_days: env::var("SHARE_LINK_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|days| *days > 0)
                    .unwrap_or(30),
                public_base_url: env::var("PUBLIC_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
        })
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            share_link_days: self.lifecycle.share_link_days,
            public_base_url: self.lifecycle.public_base_url.clone(),
            downstream_timeout: Duration::from_secs(self.collaborators.timeout_secs),
        }
    }
}
