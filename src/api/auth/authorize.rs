//
// The authorization-code flow with PKCE (S256 only). The server sits between
// the client and the VO identity provider: the client redeems our own
// single-use code at the token endpoint, never the IdP's.
//
use rocket::response::Redirect;

use crate::{
    api::ApiResult,
    auth,
    db::{models::AuthorizationFlow, DbConn},
    idp_client::{callback_uri, FlowKind, FlowState, IdpClient},
    registry::RegistrySnapshot,
    CONFIG,
};

#[allow(clippy::too_many_arguments)]
#[get("/authorize?<response_type>&<client_id>&<redirect_uri>&<scope>&<state>&<code_challenge>&<code_challenge_method>")]
pub async fn initiate_authorization_flow(
    response_type: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: Option<String>,
    code_challenge: &str,
    code_challenge_method: &str,
    registry: RegistrySnapshot,
    conn: DbConn,
) -> ApiResult<Redirect> {
    if response_type != "code" {
        err!("Only the code response type is supported")
    }
    if client_id != CONFIG.client_id() {
        err!("Unrecognised client_id")
    }
    // Plain PKCE would defeat the point of PKCE
    if code_challenge_method != "S256" {
        err!("Only the S256 code challenge method is supported")
    }

    let parsed = auth::parse_and_validate_scope(scope, &registry.0)?;
    let vo = registry.0.vo(&parsed.vo)?;

    let flow = AuthorizationFlow::start(client_id, scope, code_challenge, redirect_uri, &conn).await?;

    let client = IdpClient::for_vo(&parsed.vo, &vo.idp).await?;
    let url = client.authorize_url(FlowKind::Authorization, &flow.uuid, state)?;

    Ok(Redirect::to(url.to_string()))
}

/// IdP callback: verify the identity, assign the single-use code and bounce
/// the browser back to the client with it.
#[get("/authorize/complete?<code>&<state>&<error>")]
pub async fn complete_authorization_flow(
    code: Option<String>,
    state: String,
    error: Option<String>,
    registry: RegistrySnapshot,
    conn: DbConn,
) -> ApiResult<Redirect> {
    let flow_state = FlowState::decode(&state)?;
    if flow_state.flow != FlowKind::Authorization {
        err!("State does not belong to an authorization flow")
    }

    if let Some(error) = error {
        AuthorizationFlow::mark_error(&flow_state.id, &conn).await?;
        err!("The identity provider denied the request", error)
    }
    let Some(code) = code else {
        err!("Missing authorization code")
    };

    let Some(flow) = AuthorizationFlow::find_by_uuid(&flow_state.id, &conn).await else {
        err_code!("Unknown authorization flow", 404)
    };
    let parsed = auth::parse_and_validate_scope(&flow.scope, &registry.0)?;
    let vo = registry.0.vo(&parsed.vo)?;

    let client = IdpClient::for_vo(&parsed.vo, &vo.idp).await?;
    let identity = match client
        .exchange_code(code, flow_state.pkce_verifier, flow_state.nonce, callback_uri(FlowKind::Authorization))
        .await
    {
        Ok(identity) => identity,
        Err(e) => {
            AuthorizationFlow::mark_error(&flow_state.id, &conn).await?;
            return Err(e);
        }
    };

    let id_token = serde_json::to_value(&identity)?;
    let ready = AuthorizationFlow::insert_id_token(
        &flow.uuid,
        &id_token,
        CONFIG.authorization_flow_expiration_seconds(),
        &conn,
    )
    .await?;

    let our_code = ready.code.as_deref().unwrap_or_default();
    let mut target = url::Url::parse(&ready.redirect_uri).map_err(|e| {
        crate::error::Error::new("Invalid redirect_uri", e.to_string())
    })?;
    target.query_pairs_mut().append_pair("code", our_code);
    if let Some(client_state) = flow_state.client_state {
        target.query_pairs_mut().append_pair("state", &client_state);
    }

    Ok(Redirect::to(target.to_string()))
}
