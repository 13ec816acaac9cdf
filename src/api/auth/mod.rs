mod authorize;
mod device;
mod pilot;
mod token;

use data_encoding::BASE64URL;
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    api::{ApiResult, JsonResult},
    auth::{self, AuthorizedUser},
    crypto,
    db::{models::RefreshToken, DbConn},
    registry::{ConfigSnapshot, RegistrySnapshot},
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![
        device::initiate_device_flow,
        device::complete_device_flow,
        device::finish_device_flow,
        authorize::initiate_authorization_flow,
        authorize::complete_authorization_flow,
        token::token,
        token::revoke,
        pilot::pilot_login,
        pilot::pilot_refresh_token,
        userinfo,
        legacy_exchange,
    ]
}

/// Issues the access+refresh pair for a registered VO member. Shared by every
/// user-facing grant; the caller decides how a failure maps onto its wire
/// format.
pub async fn mint_user_token_pair(
    snapshot: &ConfigSnapshot,
    subject: &str,
    scope: &str,
    legacy_exchange: bool,
    conn: &DbConn,
) -> ApiResult<Value> {
    let parsed = auth::parse_and_validate_scope(scope, snapshot)?;
    let vo = snapshot.vo(&parsed.vo)?;
    let Some(user) = vo.user(subject) else {
        err_silent!("User is not registered in this VO")
    };
    let Some(group) = vo.group(&parsed.group) else {
        err_silent!("Group no longer exists")
    };
    if !group.users.contains(subject) {
        err_silent!("User is not a member of the requested group")
    }

    let sub = format!("{}:{subject}", parsed.vo);
    let scope_string = parsed.as_scope_string();
    let refresh_row = RefreshToken::mint(&sub, &user.preferred_username, &scope_string, legacy_exchange, conn).await?;
    let refresh_token =
        auth::make_refresh_token(&refresh_row.jti, &sub, &user.preferred_username, &scope_string, legacy_exchange);
    let (access_token, expires_in) =
        auth::make_user_access_token(&sub, &parsed.vo, &user.preferred_username, &parsed.group, parsed.properties);

    Ok(serde_json::json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_in": expires_in,
        "token_type": "Bearer",
    }))
}

/// The authenticated principal as the CLI displays it.
#[get("/userinfo")]
fn userinfo(user: AuthorizedUser) -> Json<Value> {
    Json(serde_json::json!({
        "sub": user.sub,
        "vo": user.vo,
        "preferred_username": user.preferred_username,
        "dirac_group": user.dirac_group,
        "properties": user.properties.iter().collect::<Vec<_>>(),
    }))
}

/// Trades a long-lived static bearer for internal credentials. Explicitly
/// gated by installation policy: without the hashed key configured the
/// endpoint is simply unavailable.
#[get("/legacy-exchange?<preferred_username>&<scope>")]
async fn legacy_exchange(
    preferred_username: &str,
    scope: &str,
    authorization: LegacyAuthorization,
    registry: RegistrySnapshot,
    conn: DbConn,
) -> JsonResult {
    // Availability first: without the installation key the endpoint is down,
    // whatever credentials were presented.
    let Some(expected_hash) = CONFIG.legacy_exchange_hashed_api_key() else {
        err_code!("Legacy exchange is disabled", 503)
    };

    let Some(secret) = authorization.secret else {
        err!("Invalid authorization header")
    };
    let presented_hash = crypto::sha256_hex(&secret);
    if !crypto::ct_eq(presented_hash, expected_hash.to_lowercase()) {
        err_code!("Invalid credentials", 401)
    }

    // The username must resolve to exactly one registered user of the VO
    let parsed = auth::parse_and_validate_scope(scope, &registry.0)?;
    let vo = registry.0.vo(&parsed.vo)?;
    let subject = vo.subject_of_username(preferred_username).map_err(|e| e.with_msg("Invalid request"))?.to_string();

    let body = mint_user_token_pair(&registry.0, &subject, scope, true, &conn).await?;
    Ok(Json(body))
}

/// `Bearer gridgate:legacy:<base64 secret>` with the secret extracted. An
/// unreadable header yields `None` so the handler can rank the availability
/// check above the credential check.
pub struct LegacyAuthorization {
    secret: Option<Vec<u8>>,
}

#[rocket::async_trait]
impl<'r> rocket::request::FromRequest<'r> for LegacyAuthorization {
    type Error = ();

    async fn from_request(request: &'r rocket::Request<'_>) -> rocket::request::Outcome<Self, Self::Error> {
        use rocket::request::Outcome;

        let header = request.headers().get_one("Authorization").unwrap_or_default();
        let secret = header
            .strip_prefix("Bearer gridgate:legacy:")
            .and_then(|encoded| BASE64URL.decode(encoded.as_bytes()).ok());
        Outcome::Success(LegacyAuthorization {
            secret,
        })
    }
}
