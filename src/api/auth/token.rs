//
// The token endpoint: every grant ends here, and every token pair leaves
// from here.
//
use rocket::form::{Form, FromForm};
use rocket::serde::json::Json;
use serde_json::Value;

use crate::{
    api::JsonResult,
    auth::{self, ClientIp},
    db::{
        models::{AuthorizationFlow, CodeRedeem, DeviceFlow, DeviceFlowPoll, RefreshToken, RefreshUse},
        DbConn,
    },
    idp_client::IdpIdentity,
    ratelimit,
    registry::{ConfigSnapshot, RegistrySnapshot},
    CONFIG,
};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Default, FromForm)]
pub struct ConnectData {
    grant_type: String,

    // Needed for grant_type="urn:ietf:params:oauth:grant-type:device_code"
    device_code: Option<String>,

    // Needed for grant_type="authorization_code"
    code: Option<String>,
    code_verifier: Option<String>,

    // Needed for grant_type="refresh_token"
    refresh_token: Option<String>,
}

#[post("/token", data = "<data>")]
pub async fn token(data: Form<ConnectData>, ip: ClientIp, registry: RegistrySnapshot, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_token(&ip.ip)?;

    let data = data.into_inner();
    match data.grant_type.as_str() {
        DEVICE_CODE_GRANT => {
            let Some(device_code) = data.device_code else {
                err_oauth!("invalid_request", "device_code is required")
            };
            device_code_grant(&device_code, &registry.0, &conn).await
        }
        "authorization_code" => {
            let Some(code) = data.code else {
                err_oauth!("invalid_request", "code is required")
            };
            let Some(code_verifier) = data.code_verifier else {
                err_oauth!("invalid_request", "code_verifier is required")
            };
            authorization_code_grant(&code, &code_verifier, &registry.0, &conn).await
        }
        "refresh_token" => {
            let Some(refresh_token) = data.refresh_token else {
                err_oauth!("invalid_request", "refresh_token is required")
            };
            refresh_token_grant(&refresh_token, &registry.0, &conn).await
        }
        t => err_oauth!("unsupported_grant_type", t),
    }
}

/// The polling half of the device flow. The READY -> DONE transition inside
/// `poll` guarantees a single winner under concurrent polling.
async fn device_code_grant(device_code: &str, snapshot: &ConfigSnapshot, conn: &DbConn) -> JsonResult {
    match DeviceFlow::poll(device_code, CONFIG.device_flow_expiration_seconds(), conn).await? {
        DeviceFlowPoll::Pending => err_oauth!("authorization_pending"),
        DeviceFlowPoll::Expired => err_oauth!("expired_token"),
        DeviceFlowPoll::Failed => err_oauth!("access_denied", "The identity provider leg failed"),
        DeviceFlowPoll::AlreadyUsed => err_oauth!("access_denied", "Token already retrieved for this flow"),
        DeviceFlowPoll::Unknown => err_oauth!("invalid_grant"),
        DeviceFlowPoll::Ready(flow) => {
            let Some(id_token) = flow.id_token() else {
                err_oauth!("invalid_grant", "Flow carries no identity")
            };
            mint_from_identity(snapshot, &id_token, &flow.scope, conn).await
        }
    }
}

async fn authorization_code_grant(code: &str, code_verifier: &str, snapshot: &ConfigSnapshot, conn: &DbConn) -> JsonResult {
    match AuthorizationFlow::redeem(code, code_verifier, CONFIG.authorization_flow_expiration_seconds(), conn).await? {
        CodeRedeem::Invalid => err_oauth!("invalid_grant"),
        CodeRedeem::Redeemed(flow) => {
            let Some(id_token) = flow.id_token() else {
                err_oauth!("invalid_grant", "Flow carries no identity")
            };
            mint_from_identity(snapshot, &id_token, &flow.scope, conn).await
        }
    }
}

async fn refresh_token_grant(refresh_token: &str, snapshot: &ConfigSnapshot, conn: &DbConn) -> JsonResult {
    // Signature, issuer and expiry checks; an expired or forged token never
    // reaches the database.
    let Ok(claims) = auth::decode_refresh_token(refresh_token) else {
        err_oauth!("invalid_grant")
    };

    match RefreshToken::use_token(&claims.jti, conn).await? {
        RefreshUse::Unknown => err_oauth!("invalid_grant"),
        RefreshUse::Replayed => {
            warn!("Refresh token replay detected for {}; lineage revoked", claims.sub);
            err_oauth!("invalid_grant")
        }
        RefreshUse::Rotated(old) => {
            let Some((_, subject)) = old.sub.split_once(':') else {
                err_oauth!("invalid_grant", "Malformed subject")
            };
            match super::mint_user_token_pair(snapshot, subject, &old.scope, old.legacy_exchange, conn).await {
                Ok(body) => Ok(Json(body)),
                Err(e) => {
                    debug!("Refused to rotate refresh token: {e:#?}");
                    err_oauth!("invalid_grant")
                }
            }
        }
    }
}

/// From a stored IdP identity to a minted token pair, re-validating scope and
/// group membership against the current registry.
async fn mint_from_identity(snapshot: &ConfigSnapshot, id_token: &Value, scope: &str, conn: &DbConn) -> JsonResult {
    let Ok(identity) = serde_json::from_value::<IdpIdentity>(id_token.clone()) else {
        err_oauth!("invalid_grant", "Unreadable identity")
    };
    match super::mint_user_token_pair(snapshot, &identity.sub, scope, false, conn).await {
        Ok(body) => Ok(Json(body)),
        Err(e) => {
            debug!("Refused to mint tokens: {e:#?}");
            err_oauth!("invalid_grant")
        }
    }
}

#[derive(Debug, FromForm)]
pub struct RevokeData {
    token: String,
    #[field(name = "token_type_hint")]
    _token_type_hint: Option<String>,
}

/// RFC 7009: revocation always answers 200, unknown tokens included.
#[post("/revoke", data = "<data>")]
pub async fn revoke(data: Form<RevokeData>, conn: DbConn) -> JsonResult {
    if let Ok(claims) = auth::decode_for_revocation(&data.token) {
        RefreshToken::revoke(&claims.jti, &conn).await?;
    }
    Ok(Json(serde_json::json!({})))
}
