//! The authenticated identity attached to a request context.

use serde::{Deserialize, Serialize};

use crate::permission::{Permissions, Role};

/// Identity resolved by the auth layer. Built once per request, never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub workspace_id: String,
    /// The project this request runs under, when scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Explicit allow-list of additional project ids.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_projects: Vec<String>,
    /// Bypass flag for operator tooling.
    #[serde(default)]
    pub admin_override: bool,
    /// Derived from role at construction.
    #[serde(skip, default = "Permissions::empty")]
    pub permissions: Permissions,
}

impl Principal {
    /// Build a principal with permissions derived from the role.
    pub fn new(
        user_id: impl Into<String>,
        email: impl Into<String>,
        role: Role,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            role,
            workspace_id: workspace_id.into(),
            project_id: None,
            allowed_projects: Vec::new(),
            admin_override: false,
            permissions: role.permissions(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_allowed_projects(mut self, projects: Vec<String>) -> Self {
        self.allowed_projects = projects;
        self
    }

    pub fn with_admin_override(mut self) -> Self {
        self.admin_override = true;
        self
    }

    /// Whether the principal holds every bit of `required`.
    pub fn can(&self, required: Permissions) -> bool {
        self.admin_override || self.permissions.has(required)
    }

    /// Project-scope enforcement: the principal's own project, anything on
    /// the allow-list, or an admin/override identity.
    pub fn can_access_project(&self, project_id: &str) -> bool {
        if self.admin_override || matches!(self.role, Role::Admin | Role::System) {
            return true;
        }
        if self.project_id.as_deref() == Some(project_id) {
            return true;
        }
        self.allowed_projects.iter().any(|p| p == project_id)
    }
}
