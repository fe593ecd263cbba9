//! Capability bitmask and role mapping.
//!
//! Capabilities are grouped by resource (project, api-key, provider,
//! control-room, usage, system) and fit in a single machine word so a
//! permission check is one AND.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// The fixed capability set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u64 {
        const PROJECT_READ    = 1 << 0;
        const PROJECT_WRITE   = 1 << 1;
        const PROJECT_DELETE  = 1 << 2;

        const KEY_READ        = 1 << 3;
        const KEY_WRITE       = 1 << 4;
        const KEY_DELETE      = 1 << 5;

        const PROVIDER_READ   = 1 << 6;
        const PROVIDER_WRITE  = 1 << 7;
        const PROVIDER_DELETE = 1 << 8;

        const CONTROL_READ    = 1 << 9;
        const CONTROL_WRITE   = 1 << 10;

        const USAGE_READ      = 1 << 11;
        const USAGE_EXPORT    = 1 << 12;

        const SYSTEM_ADMIN    = 1 << 13;
        const SYSTEM_CONFIG   = 1 << 14;
    }
}

impl Permissions {
    /// Every read capability across resource groups.
    pub fn all_read() -> Self {
        Self::PROJECT_READ | Self::KEY_READ | Self::PROVIDER_READ | Self::CONTROL_READ | Self::USAGE_READ
    }

    /// Every write capability (no deletes, no system bits).
    pub fn all_write() -> Self {
        Self::PROJECT_WRITE | Self::KEY_WRITE | Self::PROVIDER_WRITE | Self::CONTROL_WRITE | Self::USAGE_EXPORT
    }

    /// `true` when every bit of `required` is granted.
    pub fn has(self, required: Self) -> bool {
        self.contains(required)
    }

    /// `true` when at least one bit of `required` is granted.
    pub fn has_any(self, required: Self) -> bool {
        self.intersects(required)
    }

    pub fn grant(&mut self, extra: Self) {
        self.insert(extra);
    }

    pub fn revoke(&mut self, removed: Self) {
        self.remove(removed);
    }
}

/// The roles a principal can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Developer,
    Viewer,
    System,
}

impl Role {
    /// The bitmask derived from a role.
    pub fn permissions(&self) -> Permissions {
        match self {
            Role::Admin | Role::System => Permissions::all(),
            Role::Developer => Permissions::all_read() | Permissions::all_write(),
            Role::Viewer => Permissions::all_read(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Developer => "developer",
            Role::Viewer => "viewer",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "developer" => Some(Role::Developer),
            "viewer" => Some(Role::Viewer),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_and_system_hold_every_bit() {
        assert_eq!(Role::Admin.permissions(), Permissions::all());
        assert_eq!(Role::System.permissions(), Permissions::all());
    }

    #[test]
    fn developer_lacks_delete_and_system() {
        let perms = Role::Developer.permissions();
        assert!(perms.has(Permissions::PROJECT_READ | Permissions::PROJECT_WRITE));
        assert!(perms.has(Permissions::KEY_WRITE));
        assert!(!perms.has(Permissions::PROJECT_DELETE));
        assert!(!perms.has(Permissions::KEY_DELETE));
        assert!(!perms.has(Permissions::SYSTEM_ADMIN));
    }

    #[test]
    fn viewer_is_read_only() {
        let perms = Role::Viewer.permissions();
        assert!(perms.has(Permissions::USAGE_READ));
        assert!(!perms.has_any(Permissions::all_write()));
        assert!(!perms.has(Permissions::PROJECT_DELETE));
    }

    #[test]
    fn grant_and_revoke_roundtrip() {
        let mut perms = Role::Viewer.permissions();
        assert!(!perms.has(Permissions::KEY_WRITE));
        perms.grant(Permissions::KEY_WRITE);
        assert!(perms.has(Permissions::KEY_WRITE));
        perms.revoke(Permissions::KEY_WRITE);
        assert!(!perms.has(Permissions::KEY_WRITE));
    }

    #[test]
    fn has_any_matches_partial_sets() {
        let perms = Permissions::PROJECT_READ;
        assert!(perms.has_any(Permissions::PROJECT_READ | Permissions::SYSTEM_ADMIN));
        assert!(!perms.has(Permissions::PROJECT_READ | Permissions::SYSTEM_ADMIN));
    }

    #[test]
    fn role_parse_roundtrip() {
        for role in [Role::Admin, Role::Developer, Role::Viewer, Role::System] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("owner"), None);
    }
}
