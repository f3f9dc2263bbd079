use serde::{Deserialize, Serialize};

use crate::settings::OrgId;

/// Organization role of a caller. Ordered from least to most privileged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrgRole {
    #[default]
    Viewer,
    Editor,
    Admin,
}

/// The authenticated principal a proxied request is made for. Serialized verbatim into the
/// trusted context header, so the field names are part of the upstream contract.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    pub user_id: i64,
    pub org_id: OrgId,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub org_role: OrgRole,
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub is_grafana_admin: bool,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub teams: Vec<i64>,
}

impl CallerIdentity {
    /// Returns true if the caller may use a route that requires `required`.
    pub fn has_role(&self, required: OrgRole) -> bool {
        self.is_grafana_admin || self.org_role >= required
    }
}
