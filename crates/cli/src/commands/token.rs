//! `modelrelay token` — mint an operator JWT for the admin surface.

use anyhow::{Result, bail};

use modelrelay_auth::jwt::{TokenConfig, TokenService};
use modelrelay_auth::{Principal, Role};
use modelrelay_config::AppConfig;

pub fn run(
    config: &AppConfig,
    role: &str,
    user: &str,
    email: &str,
    workspace: &str,
    project: Option<&str>,
) -> Result<()> {
    let Some(role) = Role::parse(role) else {
        bail!("unknown role '{role}' (expected admin, developer, viewer, or system)");
    };
    let (Some(access_secret), Some(refresh_secret)) =
        (&config.auth.access_secret, &config.auth.refresh_secret)
    else {
        bail!("JWT secrets are not configured; set them in [auth] or MODELRELAY_JWT_*_SECRET");
    };

    let mut token_config = TokenConfig::new(&config.auth.issuer, access_secret, refresh_secret);
    token_config.access_ttl = std::time::Duration::from_secs(config.auth.access_ttl_minutes * 60);
    token_config.refresh_ttl =
        std::time::Duration::from_secs(config.auth.refresh_ttl_days * 24 * 60 * 60);
    let service = TokenService::new(token_config)?;

    let mut principal = Principal::new(user, email, role, workspace);
    if let Some(project) = project {
        principal = principal.with_project(project);
    }

    let access = service.issue_access(&principal)?;
    let refresh = service.issue_refresh(&principal)?;
    println!(
        "{}",
        serde_json::json!({
            "access_token": access,
            "refresh_token": refresh,
            "role": role.to_string(),
            "expires_in_minutes": config.auth.access_ttl_minutes,
        })
    );
    Ok(())
}
