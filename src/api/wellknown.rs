use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{api::JsonResult, auth, registry::RegistrySnapshot, CONFIG};

pub fn routes() -> Vec<Route> {
    routes![openid_configuration, installation_metadata, jwks]
}

#[get("/.well-known/openid-configuration")]
fn openid_configuration() -> Json<Value> {
    let issuer = CONFIG.issuer();
    Json(json!({
        "issuer": issuer,
        "token_endpoint": format!("{issuer}/api/auth/token"),
        "authorization_endpoint": format!("{issuer}/api/auth/authorize"),
        "device_authorization_endpoint": format!("{issuer}/api/auth/device"),
        "userinfo_endpoint": format!("{issuer}/api/auth/userinfo"),
        "revocation_endpoint": format!("{issuer}/api/auth/revoke"),
        "jwks_uri": format!("{issuer}/.well-known/jwks.json"),
        "grant_types_supported": [
            "authorization_code",
            "urn:ietf:params:oauth:grant-type:device_code",
            "refresh_token",
        ],
        "response_types_supported": ["code"],
        "scopes_supported": ["openid", "profile"],
        "token_endpoint_auth_signing_alg_values_supported": ["RS256"],
        "token_endpoint_auth_methods_supported": ["none"],
        "code_challenge_methods_supported": ["S256"],
    }))
}

/// Enumerates the VOs and their groups for clients configuring themselves.
#[get("/.well-known/dirac-metadata")]
fn installation_metadata(registry: RegistrySnapshot) -> JsonResult {
    let mut virtual_organizations = serde_json::Map::new();
    for (vo_name, vo) in &registry.0.registry {
        let groups: serde_json::Map<String, Value> = vo
            .groups
            .iter()
            .map(|(name, group)| {
                (name.clone(), json!({"properties": group.properties.iter().collect::<Vec<_>>()}))
            })
            .collect();
        virtual_organizations.insert(
            vo_name.clone(),
            json!({
                "groups": groups,
                "default_group": vo.default_group,
                "support": {
                    "message": vo.support.message,
                    "webpage": vo.support.webpage,
                    "email": vo.support.email,
                },
            }),
        );
    }

    Ok(Json(json!({
        "virtual_organizations": virtual_organizations,
        "version": crate::VERSION,
    })))
}

#[get("/.well-known/jwks.json")]
fn jwks() -> Json<Value> {
    Json(auth::jwks())
}
