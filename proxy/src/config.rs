use crate::auth::ApiKeyConfig;
use crate::director::{DEFAULT_CONTEXT_HEADER, DEFAULT_USER_HEADER, DirectorOptions};
use crate::route::{PluginRoutes, RouteError};
use crate::settings::SettingsEntry;
use http::HeaderName;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,
    #[error("Duplicate plugin id: {0}")]
    DuplicatePlugin(String),
    #[error("Empty plugin id")]
    EmptyPluginId,
    #[error("Plugin {plugin_id}: {source}")]
    InvalidRoute {
        plugin_id: String,
        source: RouteError,
    },
    #[error("Invalid header name for {0}")]
    InvalidHeaderName(&'static str),
    #[error("secret_key must not be empty")]
    EmptySecretKey,
    #[error("upstream_timeout_secs must be greater than 0")]
    InvalidTimeout,
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Which headers carry the caller identity to plugin backends.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct IdentityHeaders {
    #[serde(default)]
    pub send_user_header: bool,
    #[serde(default = "default_context_header")]
    pub context_header: String,
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        IdentityHeaders {
            send_user_header: false,
            context_header: default_context_header(),
            user_header: default_user_header(),
        }
    }
}

fn default_context_header() -> String {
    DEFAULT_CONTEXT_HEADER.to_string()
}

fn default_user_header() -> String {
    DEFAULT_USER_HEADER.to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Plugin proxy configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for plugin proxy requests
    pub listener: Listener,
    /// Admin listener for health and readiness
    pub admin_listener: Listener,
    #[serde(default)]
    pub identity: IdentityHeaders,
    /// Deadline for directing and forwarding one request, response body included
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Key the secure plugin settings are encrypted with
    pub secret_key: String,
    /// Bearer tokens accepted by the proxy listener
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    /// Routes declared by each plugin
    pub plugins: Vec<PluginRoutes>,
    /// Per organization plugin settings
    #[serde(default)]
    pub settings: Vec<SettingsEntry>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.secret_key.is_empty() {
            return Err(ValidationError::EmptySecretKey);
        }
        if self.upstream_timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }

        self.director_options()?;

        let mut plugin_ids = HashSet::new();
        for plugin in &self.plugins {
            if plugin.id.is_empty() {
                return Err(ValidationError::EmptyPluginId);
            }
            if !plugin_ids.insert(&plugin.id) {
                return Err(ValidationError::DuplicatePlugin(plugin.id.clone()));
            }
            for route in &plugin.routes {
                route
                    .validate()
                    .map_err(|source| ValidationError::InvalidRoute {
                        plugin_id: plugin.id.clone(),
                        source,
                    })?;
            }
        }

        for entry in &self.settings {
            if !plugin_ids.contains(&entry.plugin_id) {
                tracing::warn!(
                    plugin_id = %entry.plugin_id,
                    org_id = entry.org_id,
                    "settings configured for a plugin without routes"
                );
            }
        }

        Ok(())
    }

    pub fn director_options(&self) -> Result<DirectorOptions, ValidationError> {
        let context_header = HeaderName::from_bytes(self.identity.context_header.as_bytes())
            .map_err(|_| ValidationError::InvalidHeaderName("identity.context_header"))?;
        let user_header = HeaderName::from_bytes(self.identity.user_header.as_bytes())
            .map_err(|_| ValidationError::InvalidHeaderName("identity.user_header"))?;

        Ok(DirectorOptions {
            send_user_header: self.identity.send_user_header,
            context_header,
            user_header,
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
