pub mod auth;
pub mod config;
pub mod crypto;
pub mod director;
pub mod errors;
pub mod identity;
pub mod metrics_defs;
mod proxy_service;
pub mod route;
pub mod settings;
pub mod template;
mod utils;

use auth::ApiKeys;
use crypto::AesGcmDecryptor;
use director::Director;
use route::RouteTable;
use secrecy::SecretString;
use settings::StaticSettingsStore;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

pub use errors::{DirectorError, ProxyError};
pub use proxy_service::{ForwardOptions, PluginProxyService};

/// Builds the proxy service described by `config`: routes, settings store, decryptor and api
/// key authentication.
pub fn build_service(config: &config::Config) -> Result<PluginProxyService, ProxyError> {
    config.validate()?;

    let store: StaticSettingsStore = config.settings.iter().cloned().collect();
    let decryptor = AesGcmDecryptor::new(&SecretString::from(config.secret_key.clone()));
    let director = Director::new(
        Arc::new(store),
        Arc::new(decryptor),
        config.director_options()?,
    );

    PluginProxyService::new(
        RouteTable::new(config.plugins.clone()),
        director,
        Arc::new(ApiKeys::new(config.api_keys.clone())),
        ForwardOptions {
            upstream_timeout: config.upstream_timeout(),
            max_body_bytes: config.max_body_bytes,
        },
    )
}

pub async fn run(config: config::Config) -> Result<(), ProxyError> {
    let service = build_service(&config)?;
    tracing::info!(
        plugins = config.plugins.len(),
        settings = config.settings.len(),
        "plugin proxy configured"
    );

    let proxy_task = run_http_service(&config.listener.host, config.listener.port, service);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, ProxyError>::new(|| true),
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}
