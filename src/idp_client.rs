//
// Outbound OpenID Connect: one discovered client per VO identity provider,
// cached so the discovery endpoint is not hammered on every login.
//
use std::time::Duration;

use moka::future::Cache;
use once_cell::sync::Lazy;
use openidconnect::core::*;
use openidconnect::*;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    api::ApiResult,
    error::MapResult,
    http_client, registry,
    util::retry_transient,
    CONFIG,
};

static CLIENT_CACHE: Lazy<Cache<String, IdpClient>> =
    Lazy::new(|| Cache::builder().max_capacity(64).time_to_live(Duration::from_secs(3600)).build());

/// OpenID Connect Core client for a public client with PKCE: authorization
/// and token endpoints are required, everything else is unused.
pub type CustomClient = openidconnect::Client<
    EmptyAdditionalClaims,
    CoreAuthDisplay,
    CoreGenderClaim,
    CoreJweContentEncryptionAlgorithm,
    CoreJsonWebKey,
    CoreAuthPrompt,
    StandardErrorResponse<CoreErrorResponseType>,
    CoreTokenResponse,
    CoreTokenIntrospectionResponse,
    CoreRevocableToken,
    CoreRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
    EndpointMaybeSet,
>;

#[derive(Clone)]
pub struct IdpClient {
    pub http_client: reqwest::Client,
    pub core_client: CustomClient,
}

/// The identity extracted from a verified id_token; exactly what the flows
/// persist until the token endpoint turns it into internal credentials.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IdpIdentity {
    pub sub: String,
    pub preferred_username: Option<String>,
}

impl IdpClient {
    // Call the OpenId discovery endpoint to retrieve configuration
    async fn discover(idp: &registry::IdpConfig) -> ApiResult<Self> {
        let client_id = ClientId::new(idp.client_id.clone());
        let issuer_url = IssuerUrl::new(idp.url.clone()).map_res("Invalid identity provider URL")?;

        let http_client = match http_client::get_reqwest_client_builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Err(err) => err!(format!("Failed to build http client: {err}")),
            Ok(client) => client,
        };

        // Discovery is retried on transport failure only
        let provider_metadata = match retry_transient(
            || CoreProviderMetadata::discover_async(issuer_url.clone(), &http_client),
            3,
            |e| matches!(e, DiscoveryError::Request(_)),
        )
        .await
        {
            Err(err) => err!(format!("Failed to discover OpenID provider: {err}")),
            Ok(metadata) => metadata,
        };

        let base_client = CoreClient::from_provider_metadata(provider_metadata, client_id, None);

        let token_uri = match base_client.token_uri() {
            Some(uri) => uri.clone(),
            None => err!("Failed to discover token_url, cannot proceed"),
        };

        let core_client = base_client.set_token_uri(token_uri);

        Ok(IdpClient {
            http_client,
            core_client,
        })
    }

    /// Cached per VO; a configuration change rotates through on cache expiry.
    pub async fn for_vo(vo_name: &str, idp: &registry::IdpConfig) -> ApiResult<Self> {
        let cache_key = format!("{vo_name}|{}", idp.url);
        if let Some(client) = CLIENT_CACHE.get(&cache_key).await {
            return Ok(client);
        }
        let client = Self::discover(idp).await?;
        CLIENT_CACHE.insert(cache_key, client.clone()).await;
        Ok(client)
    }

    /// Builds the IdP authorization URL with a fresh PKCE pair. The verifier
    /// and nonce never touch our database: they travel inside the opaque
    /// `state` envelope and come back with the callback.
    pub fn authorize_url(&self, flow: FlowKind, id: &str, client_state: Option<String>) -> ApiResult<Url> {
        let redirect = RedirectUrl::new(callback_uri(flow)).map_res("Invalid redirect URI")?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let nonce = Nonce::new_random();

        let state = FlowState {
            flow,
            id: id.to_string(),
            pkce_verifier: pkce_verifier.into_secret(),
            nonce: nonce.secret().clone(),
            client_state,
        }
        .encode();

        let (auth_url, _, _) = self
            .core_client
            .authorize_url(
                AuthenticationFlow::<CoreResponseType>::AuthorizationCode,
                || CsrfToken::new(state),
                move || nonce,
            )
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .set_pkce_challenge(pkce_challenge)
            .set_redirect_uri(std::borrow::Cow::Owned(redirect))
            .url();

        Ok(auth_url)
    }

    /// Exchanges the IdP code and verifies the id_token, nonce included.
    pub async fn exchange_code(
        &self,
        code: String,
        pkce_verifier: String,
        nonce: String,
        redirect_uri: String,
    ) -> ApiResult<IdpIdentity> {
        let redirect = RedirectUrl::new(redirect_uri).map_res("Invalid redirect URI")?;

        // Token endpoint 4xx answers are final; only transport failures retry
        let attempt = || {
            let exchange = self
                .core_client
                .exchange_code(AuthorizationCode::new(code.clone()))
                .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.clone()))
                .set_redirect_uri(std::borrow::Cow::Owned(redirect.clone()));
            async { exchange.request_async(&self.http_client).await }
        };
        match retry_transient(attempt, 3, |e| matches!(e, RequestTokenError::Request(_))).await {
            Err(err) => err!(format!("Failed to contact the IdP token endpoint: {err:?}")),
            Ok(token_response) => {
                let id_token = match token_response.extra_fields().id_token() {
                    None => err!("Token response did not contain an id_token"),
                    Some(token) => token,
                };

                let oidc_nonce = Nonce::new(nonce);
                let id_claims = match id_token.claims(&self.core_client.id_token_verifier(), &oidc_nonce) {
                    Ok(claims) => claims.clone(),
                    Err(err) => {
                        err!(format!("Could not read id_token claims, {err}"));
                    }
                };

                Ok(IdpIdentity {
                    sub: id_claims.subject().to_string(),
                    preferred_username: id_claims.preferred_username().map(|u| u.to_string()),
                })
            }
        }
    }
}

/// The opaque state round-tripped through the identity provider: which local
/// flow initiated the leg, plus the PKCE verifier and nonce for the callback.
#[derive(Debug, Deserialize, Serialize)]
pub struct FlowState {
    pub flow: FlowKind,
    pub id: String,
    pub pkce_verifier: String,
    pub nonce: String,
    /// The client's own `state`, echoed on the final redirect of the
    /// authorization-code flow.
    #[serde(default)]
    pub client_state: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Device,
    Authorization,
}

impl FlowState {
    pub fn encode(&self) -> String {
        data_encoding::BASE64URL_NOPAD.encode(serde_json::to_string(self).expect("serializable state").as_bytes())
    }

    pub fn decode(raw: &str) -> ApiResult<Self> {
        let bytes = data_encoding::BASE64URL_NOPAD.decode(raw.as_bytes()).map_res("Invalid state")?;
        serde_json::from_slice(&bytes).map_res("Invalid state")
    }
}

/// The redirect URI the IdP sends the browser back to, per flow kind.
pub fn callback_uri(flow: FlowKind) -> String {
    match flow {
        FlowKind::Device => format!("{}/api/auth/device/complete/finished", CONFIG.domain()),
        FlowKind::Authorization => format!("{}/api/auth/authorize/complete", CONFIG.domain()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_state_roundtrip() {
        let state = FlowState {
            flow: FlowKind::Device,
            id: "AAAAAAAA".into(),
            pkce_verifier: "verifier".into(),
            nonce: "nonce".into(),
            client_state: None,
        };
        let encoded = state.encode();
        // URL safe on the wire
        assert!(!encoded.contains('+') && !encoded.contains('/') && !encoded.contains('='));
        let decoded = FlowState::decode(&encoded).unwrap();
        assert_eq!(decoded.flow, FlowKind::Device);
        assert_eq!(decoded.id, "AAAAAAAA");
        assert_eq!(decoded.pkce_verifier, "verifier");
        assert_eq!(decoded.nonce, "nonce");
    }

    #[test]
    fn flow_state_rejects_garbage() {
        assert!(FlowState::decode("not base64 !!").is_err());
        let valid_b64 = data_encoding::BASE64URL_NOPAD.encode(b"{\"nope\": 1}");
        assert!(FlowState::decode(&valid_b64).is_err());
    }

    #[test]
    fn callback_uris_are_flow_specific() {
        assert!(callback_uri(FlowKind::Device).ends_with("/api/auth/device/complete/finished"));
        assert!(callback_uri(FlowKind::Authorization).ends_with("/api/auth/authorize/complete"));
    }
}
