use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub type OrgId = i64;

/// Per organization configuration of one plugin, as stored. Secure values are still encrypted.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PluginSettings {
    #[serde(default)]
    pub json_data: Map<String, Value>,
    #[serde(default)]
    pub secure_json_data: HashMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("no settings for plugin {plugin_id} in org {org_id}")]
    NotFound { org_id: OrgId, plugin_id: String },
    /// The store behind a resolver failed, for resolvers backed by a database or a remote
    /// service. Carries a description of the failure, never settings values.
    #[error("settings backend error: {0}")]
    Backend(String),
}

/// Looks up the settings of a plugin for an organization. Implementations block the caller for
/// the duration of the lookup; any caching is theirs to do.
pub trait ConfigurationResolver: Send + Sync {
    fn lookup(&self, org_id: OrgId, plugin_id: &str) -> Result<PluginSettings, ResolveError>;
}

/// In-memory settings keyed by `(org_id, plugin_id)`, typically loaded from the config file.
#[derive(Clone, Debug, Default)]
pub struct StaticSettingsStore {
    settings: HashMap<(OrgId, String), PluginSettings>,
}

/// One `settings:` entry of the configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SettingsEntry {
    pub org_id: OrgId,
    pub plugin_id: String,
    #[serde(flatten)]
    pub settings: PluginSettings,
}

impl StaticSettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, org_id: OrgId, plugin_id: impl Into<String>, settings: PluginSettings) {
        self.settings.insert((org_id, plugin_id.into()), settings);
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

impl FromIterator<SettingsEntry> for StaticSettingsStore {
    fn from_iter<I: IntoIterator<Item = SettingsEntry>>(iter: I) -> Self {
        let mut store = StaticSettingsStore::new();
        for entry in iter {
            store.insert(entry.org_id, entry.plugin_id, entry.settings);
        }
        store
    }
}

impl ConfigurationResolver for StaticSettingsStore {
    fn lookup(&self, org_id: OrgId, plugin_id: &str) -> Result<PluginSettings, ResolveError> {
        self.settings
            .get(&(org_id, plugin_id.to_string()))
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                org_id,
                plugin_id: plugin_id.to_string(),
            })
    }
}
