//
// The device flow: a CLI asks for a user code, the user finishes the
// browser leg against the VO identity provider, the CLI polls the token
// endpoint. The server brokers the IdP identity into the flow record.
//
use rocket::response::content::RawHtml;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    api::{ApiResult, JsonResult},
    auth,
    db::{models::DeviceFlow, DbConn},
    idp_client::{callback_uri, FlowKind, FlowState, IdpClient},
    registry::RegistrySnapshot,
    CONFIG,
};

#[derive(Debug, Deserialize)]
pub struct DeviceFlowRequest {
    client_id: String,
    scope: String,
}

/// RFC 8628 device authorization endpoint.
#[post("/device", data = "<data>")]
pub async fn initiate_device_flow(
    data: Json<DeviceFlowRequest>,
    registry: RegistrySnapshot,
    conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();
    if data.client_id != CONFIG.client_id() {
        err!("Unrecognised client_id")
    }
    // Fail early on scopes the installation can never satisfy
    auth::parse_and_validate_scope(&data.scope, &registry.0)?;

    let flow = DeviceFlow::start(&data.client_id, &data.scope, &conn).await?;

    Ok(Json(serde_json::json!({
        "user_code": flow.user_code,
        "device_code": flow.device_code,
        "verification_uri": CONFIG.device_verification_uri(),
        "verification_uri_complete": format!("{}?user_code={}", CONFIG.device_verification_uri(), flow.user_code),
        "expires_in": CONFIG.device_flow_expiration_seconds(),
        "interval": CONFIG.device_flow_poll_interval(),
    })))
}

/// Browser leg, step one: turn the user code into an IdP authorization
/// redirect for the flow's VO.
#[get("/device/complete?<user_code>")]
pub async fn complete_device_flow(
    user_code: &str,
    registry: RegistrySnapshot,
    conn: DbConn,
) -> ApiResult<Redirect> {
    let flow = DeviceFlow::validate_user_code(user_code, CONFIG.device_flow_expiration_seconds(), &conn).await?;
    let scope = auth::parse_and_validate_scope(&flow.scope, &registry.0)?;
    let vo = registry.0.vo(&scope.vo)?;

    let client = IdpClient::for_vo(&scope.vo, &vo.idp).await?;
    let url = client.authorize_url(FlowKind::Device, &flow.user_code, None)?;

    Ok(Redirect::to(url.to_string()))
}

/// Browser leg, step two: the IdP redirected back; verify the identity and
/// move the flow to READY so the polling CLI can collect its tokens.
#[get("/device/complete/finished?<code>&<state>&<error>")]
pub async fn finish_device_flow(
    code: Option<String>,
    state: String,
    error: Option<String>,
    registry: RegistrySnapshot,
    conn: DbConn,
) -> ApiResult<RawHtml<&'static str>> {
    let flow_state = FlowState::decode(&state)?;
    if flow_state.flow != FlowKind::Device {
        err!("State does not belong to a device flow")
    }

    if let Some(error) = error {
        DeviceFlow::mark_error(&flow_state.id, &conn).await?;
        err!("The identity provider denied the request", error)
    }
    let Some(code) = code else {
        err!("Missing authorization code")
    };

    let Some(flow) = DeviceFlow::find_by_user_code(&flow_state.id, &conn).await else {
        err_code!("Unknown user code", 404)
    };
    let scope = auth::parse_and_validate_scope(&flow.scope, &registry.0)?;
    let vo = registry.0.vo(&scope.vo)?;

    let client = IdpClient::for_vo(&scope.vo, &vo.idp).await?;
    let identity = match client
        .exchange_code(code, flow_state.pkce_verifier, flow_state.nonce, callback_uri(FlowKind::Device))
        .await
    {
        Ok(identity) => identity,
        Err(e) => {
            DeviceFlow::mark_error(&flow_state.id, &conn).await?;
            return Err(e);
        }
    };

    let id_token: Value = serde_json::to_value(&identity)?;
    DeviceFlow::insert_id_token(&flow_state.id, &id_token, CONFIG.device_flow_expiration_seconds(), &conn).await?;

    Ok(RawHtml(
        "<html><body><h1>Login complete</h1>\
         <p>You can close this window and return to your terminal.</p></body></html>",
    ))
}
