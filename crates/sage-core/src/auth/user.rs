use serde::{Deserialize, Serialize};

/// Grants every permission
const WILDCARD: &str = "*";

fn default_true() -> bool {
    true
}

/// Cached profile of the logged-in user, as returned by login and `/auth/me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub is_superuser: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub last_login: Option<String>,
}

impl UserProfile {
    /// Check a permission such as `patients.update`.
    ///
    /// Superusers and `*` match everything, `patients.*` matches every
    /// `patients.<action>`.
    pub fn has_permission(&self, permission: &str) -> bool {
        if self.is_superuser {
            return true;
        }

        let resource = permission.split('.').next().unwrap_or(permission);
        let resource_wildcard = format!("{}.*", resource);

        self.permissions
            .iter()
            .any(|p| p == WILDCARD || p == permission || *p == resource_wildcard)
    }

    /// Name to show in prompts and status lines
    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

#[cfg(test)]
pub(crate) fn sample_user() -> UserProfile {
    UserProfile {
        id: 2,
        username: "dr.martinez".to_string(),
        email: "martinez@sage.test".to_string(),
        full_name: Some("Dra. Martinez".to_string()),
        roles: vec!["medico".to_string()],
        permissions: vec!["patients.*".to_string(), "alerts.read".to_string()],
        is_superuser: false,
        is_active: true,
        last_login: None,
    }
}
