use chrono::{NaiveDateTime, TimeDelta, Utc};
use data_encoding::BASE64URL_NOPAD;
use diesel::prelude::*;
use serde_json::Value;

use crate::api::EmptyResult;
use crate::crypto;
use crate::db::schema::authorization_flows;
use crate::db::DbConn;
use crate::error::{Error, MapResult};

use super::FlowStatus;

#[derive(Debug, Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = authorization_flows)]
#[diesel(primary_key(uuid))]
pub struct AuthorizationFlow {
    pub uuid: String,
    pub client_id: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub redirect_uri: String,
    pub status: String,
    pub code: Option<String>,
    pub creation_time: NaiveDateTime,
    pub id_token: Option<String>,
}

/// Outcome of redeeming an authorization code at the token endpoint.
pub enum CodeRedeem {
    /// The code was live; this caller consumed it and mints the tokens.
    Redeemed(AuthorizationFlow),
    /// Unknown code, expired flow, challenge mismatch or replay. All of them
    /// surface as the same OAuth `invalid_grant`.
    Invalid,
}

/// Local methods
impl AuthorizationFlow {
    pub fn new(client_id: String, scope: String, code_challenge: String, redirect_uri: String) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            client_id,
            scope,
            code_challenge,
            code_challenge_method: "S256".to_string(),
            redirect_uri,
            status: FlowStatus::Pending.to_string(),
            code: None,
            creation_time: Utc::now().naive_utc(),
            id_token: None,
        }
    }

    pub fn id_token(&self) -> Option<Value> {
        self.id_token.as_deref().and_then(|raw| serde_json::from_str(raw).ok())
    }

    fn is_expired(&self, max_validity_seconds: i64) -> bool {
        self.creation_time < Utc::now().naive_utc() - TimeDelta::seconds(max_validity_seconds)
    }

    /// PKCE S256: BASE64URL(SHA256(code_verifier)), compared in constant time.
    pub fn verifier_matches(&self, code_verifier: &str) -> bool {
        let digest = crypto::sha256(code_verifier.as_bytes());
        crypto::ct_eq(BASE64URL_NOPAD.encode(&digest), &self.code_challenge)
    }
}

/// Database methods
impl AuthorizationFlow {
    pub async fn start(
        client_id: &str,
        scope: &str,
        code_challenge: &str,
        redirect_uri: &str,
        conn: &DbConn,
    ) -> Result<Self, Error> {
        let flow = AuthorizationFlow::new(
            client_id.to_string(),
            scope.to_string(),
            code_challenge.to_string(),
            redirect_uri.to_string(),
        );
        let value = flow.clone();
        let result: Result<(), Error> = db_run! { conn: {
            diesel::insert_into(authorization_flows::table)
                .values(&value)
                .execute(conn)
                .map_res("Error inserting authorization flow")
        }};
        result?;
        Ok(flow)
    }

    /// Stores the IdP identity, assigns the single-use code and moves
    /// PENDING -> READY. Never idempotent: a second call fails.
    pub async fn insert_id_token(
        uuid: &str,
        id_token: &Value,
        max_validity_seconds: i64,
        conn: &DbConn,
    ) -> Result<Self, Error> {
        let cutoff = Utc::now().naive_utc() - TimeDelta::seconds(max_validity_seconds);
        let code = crypto::encode_random_bytes::<48>(BASE64URL_NOPAD);
        let raw_token = serde_json::to_string(id_token)?;
        let stored_code = code.clone();
        let updated = db_run! { conn: {
            diesel::update(
                authorization_flows::table
                    .filter(authorization_flows::uuid.eq(uuid))
                    .filter(authorization_flows::status.eq(FlowStatus::Pending.to_string()))
                    .filter(authorization_flows::id_token.is_null())
                    .filter(authorization_flows::creation_time.ge(cutoff)),
            )
            .set((
                authorization_flows::status.eq(FlowStatus::Ready.to_string()),
                authorization_flows::code.eq(stored_code),
                authorization_flows::id_token.eq(raw_token),
            ))
            .execute(conn)
            .map_err(Error::from)
        }}?;

        if updated == 0 {
            err_silent!("Authorization flow is not pending")
        }

        match Self::find_by_uuid(uuid, conn).await {
            Some(flow) => Ok(flow),
            None => err_silent!("Authorization flow disappeared"),
        }
    }

    pub async fn mark_error(uuid: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(
                authorization_flows::table
                    .filter(authorization_flows::uuid.eq(uuid))
                    .filter(authorization_flows::status.eq(FlowStatus::Pending.to_string())),
            )
            .set(authorization_flows::status.eq(FlowStatus::Error.to_string()))
            .execute(conn)
            .map_res("Error updating authorization flow")
        }}
    }

    /// Redeems a code: recompute the PKCE challenge from the presented
    /// verifier, then consume the flow with a READY -> DONE compare-and-set.
    /// Any second redemption of the same code loses the CAS and is invalid.
    pub async fn redeem(
        code: &str,
        code_verifier: &str,
        max_validity_seconds: i64,
        conn: &DbConn,
    ) -> Result<CodeRedeem, Error> {
        let Some(flow) = Self::find_by_code(code, conn).await else {
            return Ok(CodeRedeem::Invalid);
        };
        if flow.is_expired(max_validity_seconds)
            || flow.status != FlowStatus::Ready.to_string()
            || !flow.verifier_matches(code_verifier)
        {
            return Ok(CodeRedeem::Invalid);
        }

        let updated = db_run! { conn: {
            diesel::update(
                authorization_flows::table
                    .filter(authorization_flows::code.eq(code))
                    .filter(authorization_flows::status.eq(FlowStatus::Ready.to_string())),
            )
            .set(authorization_flows::status.eq(FlowStatus::Done.to_string()))
            .execute(conn)
            .map_err(Error::from)
        }}?;

        if updated == 1 {
            Ok(CodeRedeem::Redeemed(flow))
        } else {
            Ok(CodeRedeem::Invalid)
        }
    }

    pub async fn find_by_uuid(uuid: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            authorization_flows::table
                .filter(authorization_flows::uuid.eq(uuid))
                .first::<AuthorizationFlow>(conn)
                .ok()
        }}
    }

    pub async fn find_by_code(code: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            authorization_flows::table
                .filter(authorization_flows::code.eq(code))
                .first::<AuthorizationFlow>(conn)
                .ok()
        }}
    }

    pub async fn purge_expired(max_validity_seconds: i64, conn: &DbConn) -> EmptyResult {
        let cutoff = Utc::now().naive_utc() - TimeDelta::seconds(max_validity_seconds) - TimeDelta::hours(1);
        db_run! { conn: {
            diesel::delete(authorization_flows::table.filter(authorization_flows::creation_time.lt(cutoff)))
                .execute(conn)
                .map_res("Error purging authorization flows")
        }}
    }
}
