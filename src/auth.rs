//
// JWT handling: the key store, token minting and verification, and the
// request guards attaching the authenticated principal to each request.
//
use std::collections::BTreeSet;
use std::path::Path;

use chrono::{TimeDelta, Utc};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    crypto,
    error::{Error, MapResult},
    registry::{ConfigSnapshot, RegistrySnapshot},
    util, CONFIG,
};

const JWT_ALGORITHM: Algorithm = Algorithm::RS256;

struct VerifyKey {
    kid: String,
    decoding: DecodingKey,
    jwk: Value,
}

struct KeyStore {
    /// The designated signing key; always also a verification key.
    active_kid: String,
    encoding: EncodingKey,
    /// Every key accepted for verification, active first.
    verify: Vec<VerifyKey>,
    /// Installation-bound secret derived from the private key material; the
    /// default key for the pilot secret keyed hash.
    derived_secret: Vec<u8>,
}

static KEYS: Lazy<KeyStore> = Lazy::new(|| {
    KeyStore::load().unwrap_or_else(|e| panic!("Error loading token signing keys.\n{e:#?}"))
});

/// Force the keys early so a broken configuration fails at startup and not on
/// the first login.
pub fn load_keys() {
    Lazy::force(&KEYS);
}

impl KeyStore {
    fn load() -> Result<Self, Error> {
        let private_pem = load_or_create_private_pem(&CONFIG.token_signing_key())?;
        let rsa = openssl::rsa::Rsa::private_key_from_pem(&private_pem)?;
        let public_pem = rsa.public_key_to_pem()?;
        let active = make_verify_key(&public_pem)?;
        let active_kid = active.kid.clone();

        let mut verify = vec![active];
        for path in CONFIG.token_verify_keys_vec() {
            let pem = util::read_file(&path).map_res("Cannot read verification key")?;
            verify.push(make_verify_key(&pem)?);
        }

        Ok(KeyStore {
            active_kid,
            encoding: EncodingKey::from_rsa_pem(&private_pem).map_res("Invalid token signing key")?,
            verify,
            derived_secret: crypto::sha256(&private_pem),
        })
    }
}

fn load_or_create_private_pem(source: &str) -> Result<Vec<u8>, Error> {
    if source.trim_start().starts_with("-----BEGIN") {
        return Ok(source.as_bytes().to_vec());
    }
    let path = source.strip_prefix("file://").unwrap_or(source);
    if !util::file_exists(path) {
        let rsa = openssl::rsa::Rsa::generate(2048)?;
        let pem = rsa.private_key_to_pem()?;
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &pem)?;
        info!("Generated a new token signing key at {path}");
    }
    util::read_file(path).map_res("Cannot read the token signing key")
}

/// Builds the verification entry for a public key PEM: decoding key, stable
/// key id and the JWK served on the well-known endpoint.
fn make_verify_key(public_pem: &[u8]) -> Result<VerifyKey, Error> {
    let rsa = openssl::rsa::Rsa::public_key_from_pem(public_pem)?;
    let kid = HEXLOWER.encode(&crypto::sha256(&rsa.public_key_to_der()?))[..16].to_string();
    let jwk = json!({
        "kty": "RSA",
        "use": "sig",
        "alg": "RS256",
        "kid": kid,
        "n": BASE64URL_NOPAD.encode(&rsa.n().to_vec()),
        "e": BASE64URL_NOPAD.encode(&rsa.e().to_vec()),
    });
    Ok(VerifyKey {
        kid,
        decoding: DecodingKey::from_rsa_pem(public_pem).map_res("Invalid verification key")?,
        jwk,
    })
}

/// The public JWK set; verifiers accept any of these, which is what makes
/// signing-key rotation possible without a flag day.
pub fn jwks() -> Value {
    json!({ "keys": KEYS.verify.iter().map(|k| k.jwk.clone()).collect::<Vec<_>>() })
}

/// Key for the keyed hash of pilot secrets: the configured one, or a secret
/// derived from the signing key material.
pub fn pilot_hmac_key() -> Vec<u8> {
    match CONFIG.pilot_secret_hmac_key() {
        Some(key) => key.into_bytes(),
        None => KEYS.derived_secret.clone(),
    }
}

pub fn encode_jwt<T: Serialize>(claims: &T) -> String {
    let mut header = Header::new(JWT_ALGORITHM);
    header.kid = Some(KEYS.active_kid.clone());
    match jsonwebtoken::encode(&header, claims, &KEYS.encoding) {
        Ok(token) => token,
        Err(e) => panic!("Error encoding jwt {e}"),
    }
}

fn decode_jwt<T: DeserializeOwned>(token: &str, validation: &jsonwebtoken::Validation) -> Result<T, Error> {
    let token = token.replace(char::is_whitespace, "");
    let header_kid = jsonwebtoken::decode_header(&token).ok().and_then(|h| h.kid);

    // Prefer the key named by the header, fall back to the whole set
    let mut last_err = None;
    let candidates = KEYS
        .verify
        .iter()
        .filter(|k| header_kid.as_deref().is_none_or(|kid| kid == k.kid))
        .chain(KEYS.verify.iter().filter(|k| header_kid.as_deref().is_some_and(|kid| kid != k.kid)));
    for key in candidates {
        match jsonwebtoken::decode::<T>(&token, &key.decoding, validation) {
            Ok(data) => return Ok(data.claims),
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(Error::from(e).with_msg("Invalid token")),
        None => err_silent!("Invalid token"),
    }
}

fn base_validation() -> jsonwebtoken::Validation {
    let mut validation = jsonwebtoken::Validation::new(JWT_ALGORITHM);
    validation.leeway = 30; // 30 seconds
    validation.set_issuer(&[CONFIG.issuer()]);
    validation.set_audience(&[CONFIG.issuer()]);
    validation.set_required_spec_claims(&["exp", "iss", "aud"]);
    validation
}

pub fn decode_access_token(token: &str) -> Result<AccessTokenClaims, Error> {
    decode_jwt(token, &base_validation())
}

pub fn decode_refresh_token(token: &str) -> Result<RefreshTokenClaims, Error> {
    decode_jwt(token, &base_validation())
}

/// RFC 7009 accepts revocation of tokens that are already expired.
pub fn decode_for_revocation(token: &str) -> Result<RefreshTokenClaims, Error> {
    let mut validation = base_validation();
    validation.validate_exp = false;
    decode_jwt(token, &validation)
}

//
// Token payloads
//

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub vo: String,
    pub iss: String,
    pub aud: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
    pub preferred_username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirac_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirac_properties: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pilot_stamp: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshTokenClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
    pub preferred_username: String,
    pub scope: String,
    #[serde(default)]
    pub legacy_exchange: bool,
}

pub fn make_user_access_token(
    sub: &str,
    vo: &str,
    preferred_username: &str,
    group: &str,
    properties: Vec<String>,
) -> (String, i64) {
    let now = Utc::now();
    let expires_in = CONFIG.access_token_expire_minutes() * 60;
    let claims = AccessTokenClaims {
        sub: sub.to_string(),
        vo: vo.to_string(),
        iss: CONFIG.issuer(),
        aud: CONFIG.issuer(),
        jti: uuid::Uuid::new_v4().to_string(),
        exp: (now + TimeDelta::seconds(expires_in)).timestamp(),
        iat: now.timestamp(),
        preferred_username: preferred_username.to_string(),
        dirac_group: Some(group.to_string()),
        dirac_properties: Some(properties),
        pilot_stamp: None,
    };
    (encode_jwt(&claims), expires_in)
}

/// Pilot access tokens carry the pilot stamp instead of a group; their
/// property set is pinned by installation configuration.
pub fn make_pilot_access_token(sub: &str, vo: &str, preferred_username: &str, pilot_stamp: &str) -> (String, i64) {
    let now = Utc::now();
    let expires_in = CONFIG.access_token_expire_minutes() * 60;
    let claims = AccessTokenClaims {
        sub: sub.to_string(),
        vo: vo.to_string(),
        iss: CONFIG.issuer(),
        aud: CONFIG.issuer(),
        jti: uuid::Uuid::new_v4().to_string(),
        exp: (now + TimeDelta::seconds(expires_in)).timestamp(),
        iat: now.timestamp(),
        preferred_username: preferred_username.to_string(),
        dirac_group: None,
        dirac_properties: None,
        pilot_stamp: Some(pilot_stamp.to_string()),
    };
    (encode_jwt(&claims), expires_in)
}

/// The refresh token is itself a signed JWT whose `jti` is the database key
/// used for rotation and replay detection.
pub fn make_refresh_token(jti: &str, sub: &str, preferred_username: &str, scope: &str, legacy_exchange: bool) -> String {
    let now = Utc::now();
    let validity = if legacy_exchange {
        TimeDelta::days(CONFIG.legacy_exchange_refresh_expire_days())
    } else {
        TimeDelta::minutes(CONFIG.refresh_token_expire_minutes())
    };
    let claims = RefreshTokenClaims {
        sub: sub.to_string(),
        iss: CONFIG.issuer(),
        aud: CONFIG.issuer(),
        jti: jti.to_string(),
        exp: (now + validity).timestamp(),
        iat: now.timestamp(),
        preferred_username: preferred_username.to_string(),
        scope: scope.to_string(),
        legacy_exchange,
    };
    encode_jwt(&claims)
}

//
// Scope handling
//

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedScope {
    pub vo: String,
    pub group: String,
    pub properties: Vec<String>,
}

impl ParsedScope {
    pub fn as_scope_string(&self) -> String {
        format!("vo:{} group:{}", self.vo, self.group)
    }
}

/// Parses `vo:<vo> group:<group> property:<p>...` against the registry.
/// Exactly one VO, the group defaults to the VO's default group, requested
/// properties must be a subset of the group's.
pub fn parse_and_validate_scope(scope: &str, snapshot: &ConfigSnapshot) -> Result<ParsedScope, Error> {
    let mut vos = Vec::new();
    let mut groups = Vec::new();
    let mut requested: Vec<String> = Vec::new();

    for token in scope.split_whitespace() {
        if let Some(vo) = token.strip_prefix("vo:") {
            vos.push(vo.to_string());
        } else if let Some(group) = token.strip_prefix("group:") {
            groups.push(group.to_string());
        } else if let Some(property) = token.strip_prefix("property:") {
            requested.push(property.to_string());
        } else {
            err_silent!(format!("Unrecognised scope element {token}"))
        }
    }

    let [vo] = vos.as_slice() else {
        err_silent!("Exactly one vo:<vo> scope is required")
    };
    let vo_config = snapshot.vo(vo)?;

    let group = match groups.as_slice() {
        [] => vo_config.default_group.clone(),
        [group] => group.clone(),
        _ => err_silent!("At most one group:<group> scope is allowed"),
    };
    let Some(group_config) = vo_config.group(&group) else {
        err_silent!(format!("Unknown group {group} in VO {vo}"))
    };

    for property in &requested {
        if !group_config.properties.contains(property) {
            err_silent!(format!("Property {property} is not available to group {group}"))
        }
    }

    Ok(ParsedScope {
        vo: vo.clone(),
        group,
        properties: group_config.properties.iter().cloned().collect(),
    })
}

//
// Bearer token authentication
//
use rocket::http::Status;
use rocket::outcome::try_outcome;
use rocket::request::{FromRequest, Outcome, Request};

/// The authenticated human (or robot-account) principal. Security properties
/// are resolved from the current registry snapshot, not from the token, so a
/// property revocation takes effect on the next request.
pub struct AuthorizedUser {
    pub sub: String,
    pub vo: String,
    pub preferred_username: String,
    pub dirac_group: String,
    pub properties: BTreeSet<String>,
    pub bearer_token: String,
    pub token_id: String,
}

impl AuthorizedUser {
    pub fn has_property(&self, property: &str) -> bool {
        self.properties.contains(property)
    }
}

fn bearer_token<'r>(request: &'r Request<'_>) -> Option<&'r str> {
    request.headers().get_one("Authorization").and_then(|header| header.strip_prefix("Bearer "))
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthorizedUser {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        try_outcome!(check_client_version(request));

        let Some(token) = bearer_token(request) else {
            err_handler!("No access token provided")
        };
        let claims = match decode_access_token(token) {
            Ok(claims) => claims,
            Err(_) => err_handler!("Invalid access token"),
        };

        if claims.pilot_stamp.is_some() {
            return Outcome::Error((Status::Forbidden, "Pilot tokens cannot access user endpoints"));
        }
        let Some(dirac_group) = claims.dirac_group else {
            return Outcome::Error((Status::Forbidden, "Token carries no group"));
        };

        let registry = try_outcome!(request.guard::<RegistrySnapshot>().await.map_error(|(status, _)| (status, "Configuration not available")));

        // Re-derived on every request on purpose
        let properties: BTreeSet<String> = match registry.0.registry.get(&claims.vo) {
            Some(vo) => match vo.group(&dirac_group) {
                Some(group) => group.properties.iter().cloned().collect(),
                None => return Outcome::Error((Status::Forbidden, "Group no longer exists")),
            },
            None => return Outcome::Error((Status::Forbidden, "VO no longer exists")),
        };

        Outcome::Success(AuthorizedUser {
            sub: claims.sub,
            vo: claims.vo,
            preferred_username: claims.preferred_username,
            dirac_group,
            properties,
            bearer_token: token.to_string(),
            token_id: claims.jti,
        })
    }
}

/// The authenticated pilot principal; only minted through the pilot login.
pub struct AuthorizedPilot {
    pub sub: String,
    pub vo: String,
    pub preferred_username: String,
    pub pilot_stamp: String,
    pub properties: BTreeSet<String>,
    pub bearer_token: String,
    pub token_id: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthorizedPilot {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        try_outcome!(check_client_version(request));

        let Some(token) = bearer_token(request) else {
            err_handler!("No access token provided")
        };
        let claims = match decode_access_token(token) {
            Ok(claims) => claims,
            Err(_) => err_handler!("Invalid access token"),
        };

        let Some(pilot_stamp) = claims.pilot_stamp else {
            return Outcome::Error((Status::Forbidden, "User tokens cannot access pilot endpoints"));
        };

        Outcome::Success(AuthorizedPilot {
            sub: claims.sub,
            vo: claims.vo,
            preferred_username: claims.preferred_username,
            pilot_stamp,
            properties: CONFIG.pilot_token_properties_vec().into_iter().collect(),
            bearer_token: token.to_string(),
            token_id: claims.jti,
        })
    }
}

/// Minimum supported client enforcement: a version header below the floor is
/// told to upgrade, requests without the header pass.
fn check_client_version(request: &Request<'_>) -> Outcome<(), &'static str> {
    let Some(min_version) = CONFIG.min_client_version() else {
        return Outcome::Success(());
    };
    let Some(header) = request.headers().get_one("Gridgate-Client-Version") else {
        return Outcome::Success(());
    };
    match (semver::Version::parse(header), semver::Version::parse(&min_version)) {
        (Ok(client), Ok(min)) if client < min => {
            Outcome::Error((Status::UpgradeRequired, "Client version below the supported minimum"))
        }
        _ => Outcome::Success(()),
    }
}

//
// Client IP address detection
//
use std::net::IpAddr;

pub struct ClientIp {
    pub ip: IpAddr,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req.headers().get_one("X-Real-IP").and_then(|ip| {
            ip.parse().map_err(|_| warn!("'X-Real-IP' header is malformed: {ip}")).ok()
        });

        let ip = ip.or_else(|| req.client_ip()).unwrap_or_else(|| "0.0.0.0".parse().unwrap());

        Outcome::Success(ClientIp {
            ip,
        })
    }
}
