//
// Pilot credentials: registered pilots authenticate with a one-time-issued
// shared secret and receive their own token shape.
//
use rocket::form::{Form, FromForm};
use rocket::serde::json::Json;
use serde::Deserialize;

use crate::{
    api::JsonResult,
    auth::{self, ClientIp},
    db::{
        models::{Pilot, RefreshToken, RefreshUse},
        DbConn,
    },
    ratelimit,
};

/// Failed logins are indistinguishable on purpose: no caller learns whether
/// the reference exists.
const LOGIN_FAILED: &str = "Pilot login failed";

#[derive(Debug, Deserialize)]
pub struct PilotLoginRequest {
    pilot_job_reference: String,
    pilot_secret: String,
}

#[post("/pilot-login", data = "<data>")]
pub async fn pilot_login(data: Json<PilotLoginRequest>, ip: ClientIp, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_token(&ip.ip)?;

    let data = data.into_inner();
    let Some(pilot) = Pilot::find_by_reference(&data.pilot_job_reference, &conn).await else {
        err_code!(LOGIN_FAILED, 401)
    };
    if !pilot.secret_matches(&data.pilot_secret, &auth::pilot_hmac_key()) {
        err_code!(LOGIN_FAILED, 401)
    }

    mint_pilot_token_pair(&pilot, &conn).await
}

#[derive(Debug, Default, FromForm)]
pub struct PilotRefreshData {
    refresh_token: String,
}

/// Pilot refresh follows the exact same rotation and replay rules as user
/// refresh; only the minted access token differs.
#[post("/pilot-refresh-token", data = "<data>")]
pub async fn pilot_refresh_token(data: Form<PilotRefreshData>, ip: ClientIp, conn: DbConn) -> JsonResult {
    ratelimit::check_limit_token(&ip.ip)?;

    let Ok(claims) = auth::decode_refresh_token(&data.refresh_token) else {
        err_oauth!("invalid_grant")
    };

    match RefreshToken::use_token(&claims.jti, &conn).await? {
        RefreshUse::Unknown | RefreshUse::Replayed => err_oauth!("invalid_grant"),
        RefreshUse::Rotated(old) => {
            let Some(pilot) = Pilot::find_by_reference(&old.preferred_username, &conn).await else {
                err_oauth!("invalid_grant")
            };
            mint_pilot_token_pair(&pilot, &conn).await
        }
    }
}

async fn mint_pilot_token_pair(pilot: &Pilot, conn: &DbConn) -> JsonResult {
    let sub = format!("{}:{}", pilot.vo, pilot.pilot_job_reference);
    let scope = format!("vo:{}", pilot.vo);

    let refresh_row = RefreshToken::mint(&sub, &pilot.pilot_job_reference, &scope, false, conn).await?;
    let refresh_token = auth::make_refresh_token(&refresh_row.jti, &sub, &pilot.pilot_job_reference, &scope, false);
    let (access_token, expires_in) =
        auth::make_pilot_access_token(&sub, &pilot.vo, &pilot.pilot_job_reference, &pilot.pilot_stamp);

    Ok(Json(serde_json::json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
        "expires_in": expires_in,
        "token_type": "Bearer",
    })))
}
