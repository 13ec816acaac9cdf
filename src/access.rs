//
// Access policies: per-resource predicate checks evaluated after
// authentication. Failing a policy is always a 403; authentication problems
// never reach this layer.
//
use once_cell::sync::Lazy;

use crate::{
    auth::AuthorizedUser,
    error::Error,
    extensions::{ExtensionRegistry, BASE_EXTENSION},
};

/// The well-known security properties consulted by the policies.
pub mod properties {
    pub const NORMAL_USER: &str = "NormalUser";
    pub const JOB_ADMINISTRATOR: &str = "JobAdministrator";
    pub const JOB_SHARING: &str = "JobSharing";
    pub const GENERIC_PILOT: &str = "GenericPilot";
    pub const SERVICE_ADMINISTRATOR: &str = "ServiceAdministrator";
    pub const PROXY_MANAGEMENT: &str = "ProxyManagement";
}

/// Everything a policy may be asked to authorize.
pub enum PolicyAction<'a> {
    JobSearch,
    JobSubmit,
    JobRead {
        owner: &'a str,
        owner_group: &'a str,
    },
    SandboxAccess,
    PilotRegister,
    PilotSearch,
    ConfigRead,
}

impl PolicyAction<'_> {
    /// The registry key an extension overrides to replace this policy.
    pub fn policy_name(&self) -> &'static str {
        match self {
            PolicyAction::JobSearch | PolicyAction::JobSubmit | PolicyAction::JobRead {
                ..
            } => "jobs",
            PolicyAction::SandboxAccess => "sandboxes",
            PolicyAction::PilotRegister | PolicyAction::PilotSearch => "pilots",
            PolicyAction::ConfigRead => "config",
        }
    }
}

pub type PolicyFn = fn(&AuthorizedUser, &PolicyAction<'_>) -> Result<(), Error>;

static POLICIES: Lazy<ExtensionRegistry<PolicyFn>> = Lazy::new(|| {
    let registry = ExtensionRegistry::new();
    registry.register(BASE_EXTENSION, "jobs", job_policy as PolicyFn);
    registry.register(BASE_EXTENSION, "sandboxes", sandbox_policy as PolicyFn);
    registry.register(BASE_EXTENSION, "pilots", pilot_policy as PolicyFn);
    registry.register(BASE_EXTENSION, "config", config_policy as PolicyFn);
    registry
});

/// The single entry point handlers call after authentication.
pub fn check_permissions(user: &AuthorizedUser, action: &PolicyAction<'_>) -> Result<(), Error> {
    match POLICIES.resolve(action.policy_name()) {
        Some(policy) => policy(user, action),
        None => err_code!("No policy registered for this resource", 500),
    }
}

fn forbid(reason: &str) -> Result<(), Error> {
    Err(Error::new(reason, "").with_code(403))
}

fn job_policy(user: &AuthorizedUser, action: &PolicyAction<'_>) -> Result<(), Error> {
    match action {
        PolicyAction::JobSearch | PolicyAction::JobSubmit => {
            if user.has_property(properties::NORMAL_USER) || user.has_property(properties::JOB_ADMINISTRATOR) {
                Ok(())
            } else {
                forbid("Job access requires the NormalUser property")
            }
        }
        PolicyAction::JobRead {
            owner,
            owner_group,
        } => {
            if user.has_property(properties::JOB_ADMINISTRATOR) {
                return Ok(());
            }
            if !user.has_property(properties::NORMAL_USER) {
                return forbid("Job access requires the NormalUser property");
            }
            if *owner == user.preferred_username && *owner_group == user.dirac_group {
                return Ok(());
            }
            // Group-wide read access for groups with job sharing
            if user.has_property(properties::JOB_SHARING) && *owner_group == user.dirac_group {
                return Ok(());
            }
            forbid("Not the owner of this job")
        }
        _ => forbid("Wrong policy for this action"),
    }
}

fn sandbox_policy(user: &AuthorizedUser, action: &PolicyAction<'_>) -> Result<(), Error> {
    match action {
        PolicyAction::SandboxAccess => {
            if user.has_property(properties::NORMAL_USER) || user.has_property(properties::JOB_ADMINISTRATOR) {
                Ok(())
            } else {
                forbid("Sandbox access requires the NormalUser property")
            }
        }
        _ => forbid("Wrong policy for this action"),
    }
}

fn pilot_policy(user: &AuthorizedUser, action: &PolicyAction<'_>) -> Result<(), Error> {
    match action {
        PolicyAction::PilotRegister => {
            if user.has_property(properties::SERVICE_ADMINISTRATOR) {
                Ok(())
            } else {
                forbid("Pilot registration requires the ServiceAdministrator property")
            }
        }
        PolicyAction::PilotSearch => {
            if user.has_property(properties::NORMAL_USER) || user.has_property(properties::SERVICE_ADMINISTRATOR) {
                Ok(())
            } else {
                forbid("Pilot search requires the NormalUser property")
            }
        }
        _ => forbid("Wrong policy for this action"),
    }
}

fn config_policy(_user: &AuthorizedUser, action: &PolicyAction<'_>) -> Result<(), Error> {
    match action {
        // Any authenticated principal may read the rendered configuration
        PolicyAction::ConfigRead => Ok(()),
        _ => forbid("Wrong policy for this action"),
    }
}

//
// Launch-time open-endpoint assertion
//

/// Routes that are genuinely public; everything else must be classified as
/// protected by the module that mounts it.
pub const PUBLIC_ROUTES: &[&str] = &[
    "openid_configuration",
    "installation_metadata",
    "jwks",
    "health_live",
    "health_ready",
    "health_startup",
    "initiate_device_flow",
    "complete_device_flow",
    "finish_device_flow",
    "initiate_authorization_flow",
    "complete_authorization_flow",
    "token",
    "revoke",
    "legacy_exchange",
    "pilot_login",
    "pilot_refresh_token",
];

/// Routes whose handlers run a policy check (or an equivalent explicit
/// ownership check) after authentication.
pub const PROTECTED_ROUTES: &[&str] = &[
    "userinfo",
    "get_config",
    "submit_jobs",
    "get_job",
    "search_jobs",
    "summary_jobs",
    "initiate_sandbox_upload",
    "get_sandbox_download",
    "assign_job_sandbox",
    "register_pilots",
    "get_pilot",
    "search_pilots",
];

/// Serving an endpoint nobody classified would silently create an open or
/// unreviewed route; in development builds that is a startup crash.
pub fn assert_route_policies<P: rocket::Phase>(rocket: &rocket::Rocket<P>) {
    if !cfg!(debug_assertions) {
        return;
    }
    for route in rocket.routes() {
        let Some(name) = route.name.as_deref() else {
            panic!("Route {} has no name, cannot verify its access policy", route.uri);
        };
        if !PUBLIC_ROUTES.contains(&name) && !PROTECTED_ROUTES.contains(&name) {
            panic!("Route {name} ({}) is neither public nor policy-checked", route.uri);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn user(properties: &[&str], group: &str) -> AuthorizedUser {
        AuthorizedUser {
            sub: "lhcb:42".into(),
            vo: "lhcb".into(),
            preferred_username: "chaen".into(),
            dirac_group: group.into(),
            properties: properties.iter().map(|p| p.to_string()).collect::<BTreeSet<_>>(),
            bearer_token: String::new(),
            token_id: "jti".into(),
        }
    }

    #[test]
    fn job_read_ownership_rules() {
        let owner_action = PolicyAction::JobRead {
            owner: "chaen",
            owner_group: "lhcb_user",
        };
        let foreign_action = PolicyAction::JobRead {
            owner: "other",
            owner_group: "lhcb_user",
        };
        let foreign_group = PolicyAction::JobRead {
            owner: "other",
            owner_group: "lhcb_prmgr",
        };

        let plain = user(&[properties::NORMAL_USER], "lhcb_user");
        assert!(check_permissions(&plain, &owner_action).is_ok());
        assert_eq!(check_permissions(&plain, &foreign_action).unwrap_err().status_code(), 403);

        let sharer = user(&[properties::NORMAL_USER, properties::JOB_SHARING], "lhcb_user");
        assert!(check_permissions(&sharer, &foreign_action).is_ok());
        assert!(check_permissions(&sharer, &foreign_group).is_err());

        let admin = user(&[properties::JOB_ADMINISTRATOR], "lhcb_admin");
        assert!(check_permissions(&admin, &foreign_group).is_ok());
    }

    #[test]
    fn property_gates() {
        let nobody = user(&[], "lhcb_user");
        assert!(check_permissions(&nobody, &PolicyAction::JobSearch).is_err());
        assert!(check_permissions(&nobody, &PolicyAction::SandboxAccess).is_err());
        assert!(check_permissions(&nobody, &PolicyAction::PilotRegister).is_err());
        // Config stays readable for any authenticated principal
        assert!(check_permissions(&nobody, &PolicyAction::ConfigRead).is_ok());

        let admin = user(&[properties::SERVICE_ADMINISTRATOR], "ops");
        assert!(check_permissions(&admin, &PolicyAction::PilotRegister).is_ok());
        assert!(check_permissions(&admin, &PolicyAction::PilotSearch).is_ok());
    }
}
