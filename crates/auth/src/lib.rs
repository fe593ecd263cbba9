//! Authentication and authorization for ModelRelay.
//!
//! Two layers gate every request:
//! - API keys for the model endpoints: extraction priority chain,
//!   key-map verification, logical key name into the request context.
//! - JWT + RBAC for the operator/admin surfaces: HS256 access/refresh
//!   tokens, role-derived permission bitmask, project-scope enforcement.

pub mod apikey;
pub mod jwt;
pub mod password;
pub mod permission;
pub mod principal;

pub use apikey::{ApiKeyStore, extract_credential};
pub use jwt::{Claims, TokenConfig, TokenError, TokenService};
pub use password::{hash_password, verify_password};
pub use permission::{Permissions, Role};
pub use principal::Principal;
