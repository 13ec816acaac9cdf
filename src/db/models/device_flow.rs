use chrono::{NaiveDateTime, TimeDelta, Utc};
use data_encoding::BASE64URL_NOPAD;
use diesel::prelude::*;
use serde_json::Value;

use crate::api::EmptyResult;
use crate::crypto;
use crate::db::schema::device_flows;
use crate::db::{DbConn, ExpectedSqlError};
use crate::error::{Error, MapResult};

use super::FlowStatus;

/// How often an insert is retried when the generated user code collides with a
/// live flow before giving up and letting the client start over.
const USER_CODE_INSERT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = device_flows)]
#[diesel(primary_key(user_code))]
pub struct DeviceFlow {
    pub user_code: String,
    pub device_code: String,
    pub client_id: String,
    pub scope: String,
    pub status: String,
    pub creation_time: NaiveDateTime,
    pub id_token: Option<String>,
}

/// Result of polling a device flow on the token endpoint.
pub enum DeviceFlowPoll {
    /// The user did not finish the browser leg yet.
    Pending,
    /// The flow just transitioned READY -> DONE; this caller mints the tokens.
    Ready(DeviceFlow),
    /// The flow was already consumed (or this caller lost the race).
    AlreadyUsed,
    Expired,
    /// The IdP leg failed.
    Failed,
    Unknown,
}

/// Local methods
impl DeviceFlow {
    pub fn new(client_id: String, scope: String) -> Self {
        Self {
            user_code: crypto::generate_user_code(),
            // 96 random bytes, base64url encoded: 128 characters on the wire
            device_code: crypto::encode_random_bytes::<96>(BASE64URL_NOPAD),
            client_id,
            scope,
            status: FlowStatus::Pending.to_string(),
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
}

/// Database methods
impl DeviceFlow {
    /// Starts a device flow, retrying on user-code collisions with a freshly
    /// sampled code. A pathologically unlucky caller gets an error and retries.
    pub async fn start(client_id: &str, scope: &str, conn: &DbConn) -> Result<DeviceFlow, Error> {
        for _ in 0..USER_CODE_INSERT_ATTEMPTS {
            let flow = DeviceFlow::new(client_id.to_string(), scope.to_string());
            if flow.try_insert(conn).await? {
                return Ok(flow);
            }
            warn!("Device flow user code collision, resampling");
        }
        err_silent!("Could not insert new device flow")
    }

    /// Inserts the flow; returns false when the user code is already taken.
    pub async fn try_insert(&self, conn: &DbConn) -> Result<bool, Error> {
        let value = self.clone();
        let outcome = conn
            .run_checked(&[ExpectedSqlError::UniqueViolation], move |conn| {
                diesel::insert_into(device_flows::table).values(&value).execute(conn)
            })
            .await?;
        Ok(outcome.is_ok())
    }

    /// The browser leg looks flows up by user code; only live PENDING flows
    /// are eligible.
    pub async fn validate_user_code(user_code: &str, max_validity_seconds: i64, conn: &DbConn) -> Result<Self, Error> {
        let Some(flow) = Self::find_by_user_code(user_code, conn).await else {
            err_code!("Unknown user code", 404)
        };
        if flow.is_expired(max_validity_seconds) {
            err_code!("Unknown user code", "Device flow expired", 404)
        }
        if flow.status != FlowStatus::Pending.to_string() {
            err_code!("Device flow already completed", 400)
        }
        Ok(flow)
    }

    /// Stores the IdP identity and moves PENDING -> READY. The conditional
    /// update is the only writer, so a second call can never overwrite an
    /// already stored id_token.
    pub async fn insert_id_token(
        user_code: &str,
        id_token: &Value,
        max_validity_seconds: i64,
        conn: &DbConn,
    ) -> EmptyResult {
        let cutoff = Utc::now().naive_utc() - TimeDelta::seconds(max_validity_seconds);
        let raw_token = serde_json::to_string(id_token)?;
        let updated = db_run! { conn: {
            diesel::update(
                device_flows::table
                    .filter(device_flows::user_code.eq(user_code))
                    .filter(device_flows::status.eq(FlowStatus::Pending.to_string()))
                    .filter(device_flows::id_token.is_null())
                    .filter(device_flows::creation_time.ge(cutoff)),
            )
            .set((
                device_flows::status.eq(FlowStatus::Ready.to_string()),
                device_flows::id_token.eq(raw_token),
            ))
            .execute(conn)
            .map_err(Error::from)
        }}?;

        if updated == 0 {
            err_silent!("Device flow is not pending")
        }
        Ok(())
    }

    /// Marks the flow as failed after an IdP error; best effort.
    pub async fn mark_error(user_code: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(
                device_flows::table
                    .filter(device_flows::user_code.eq(user_code))
                    .filter(device_flows::status.eq(FlowStatus::Pending.to_string())),
            )
            .set(device_flows::status.eq(FlowStatus::Error.to_string()))
            .execute(conn)
            .map_res("Error updating device flow")
        }}
    }

    /// Token endpoint poll. The READY -> DONE transition is a single
    /// conditional update; with concurrent polls exactly one caller wins.
    pub async fn poll(device_code: &str, max_validity_seconds: i64, conn: &DbConn) -> Result<DeviceFlowPoll, Error> {
        let Some(flow) = Self::find_by_device_code(device_code, conn).await else {
            return Ok(DeviceFlowPoll::Unknown);
        };
        if flow.is_expired(max_validity_seconds) {
            return Ok(DeviceFlowPoll::Expired);
        }
        match FlowStatus::parse(&flow.status) {
            Some(FlowStatus::Pending) => Ok(DeviceFlowPoll::Pending),
            Some(FlowStatus::Error) => Ok(DeviceFlowPoll::Failed),
            Some(FlowStatus::Done) => Ok(DeviceFlowPoll::AlreadyUsed),
            Some(FlowStatus::Ready) => {
                if Self::claim(device_code, conn).await? {
                    Ok(DeviceFlowPoll::Ready(flow))
                } else {
                    Ok(DeviceFlowPoll::AlreadyUsed)
                }
            }
            None => err!("Device flow in unknown state", flow.status),
        }
    }

    /// READY -> DONE compare-and-set; false means another poll won the race.
    pub async fn claim(device_code: &str, conn: &DbConn) -> Result<bool, Error> {
        let updated = db_run! { conn: {
            diesel::update(
                device_flows::table
                    .filter(device_flows::device_code.eq(device_code))
                    .filter(device_flows::status.eq(FlowStatus::Ready.to_string())),
            )
            .set(device_flows::status.eq(FlowStatus::Done.to_string()))
            .execute(conn)
            .map_err(Error::from)
        }}?;
        Ok(updated == 1)
    }

    pub async fn find_by_user_code(user_code: &str, conn: &DbConn) -> Option<Self> {
        let user_code = user_code.to_string();
        db_run! { conn: {
            device_flows::table
                .filter(device_flows::user_code.eq(user_code))
                .first::<DeviceFlow>(conn)
                .ok()
        }}
    }

    pub async fn find_by_device_code(device_code: &str, conn: &DbConn) -> Option<Self> {
        let device_code = device_code.to_string();
        db_run! { conn: {
            device_flows::table
                .filter(device_flows::device_code.eq(device_code))
                .first::<DeviceFlow>(conn)
                .ok()
        }}
    }

    /// Removes flows that expired more than an hour ago, whatever their state.
    pub async fn purge_expired(max_validity_seconds: i64, conn: &DbConn) -> EmptyResult {
        let cutoff = Utc::now().naive_utc() - TimeDelta::seconds(max_validity_seconds) - TimeDelta::hours(1);
        db_run! { conn: {
            diesel::delete(device_flows::table.filter(device_flows::creation_time.lt(cutoff)))
                .execute(conn)
                .map_res("Error purging device flows")
        }}
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::test_helpers::test_db;
    use serde_json::json;

    const MAX_VALIDITY: i64 = 600;

    #[tokio::test(flavor = "multi_thread")]
    async fn device_flow_happy_path() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let flow = DeviceFlow::start("cli", "vo:lhcb group:lhcb_user", &conn).await.unwrap();
        assert_eq!(flow.user_code.len(), 8);
        assert_eq!(flow.device_code.len(), 128);
        assert_eq!(flow.status, "PENDING");

        // Pending until the browser leg finishes
        match DeviceFlow::poll(&flow.device_code, MAX_VALIDITY, &conn).await.unwrap() {
            DeviceFlowPoll::Pending => {}
            _ => panic!("expected a pending poll"),
        }

        DeviceFlow::validate_user_code(&flow.user_code, MAX_VALIDITY, &conn).await.unwrap();
        DeviceFlow::insert_id_token(&flow.user_code, &json!({"sub": "42"}), MAX_VALIDITY, &conn).await.unwrap();

        // A second identity insertion must be refused
        assert!(DeviceFlow::insert_id_token(&flow.user_code, &json!({"sub": "43"}), MAX_VALIDITY, &conn)
            .await
            .is_err());

        // The user code can no longer be validated once READY
        assert!(DeviceFlow::validate_user_code(&flow.user_code, MAX_VALIDITY, &conn).await.is_err());

        match DeviceFlow::poll(&flow.device_code, MAX_VALIDITY, &conn).await.unwrap() {
            DeviceFlowPoll::Ready(ready) => {
                assert_eq!(ready.id_token().unwrap()["sub"], "42");
            }
            _ => panic!("expected a ready poll"),
        }

        // Replay: the flow has been consumed
        match DeviceFlow::poll(&flow.device_code, MAX_VALIDITY, &conn).await.unwrap() {
            DeviceFlowPoll::AlreadyUsed => {}
            _ => panic!("expected access_denied on replay"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_flow_user_code_collision() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let mut flow = DeviceFlow::new("client_id".into(), "scope".into());
        flow.user_code = "AAAAAAAA".into();
        assert!(flow.try_insert(&conn).await.unwrap());

        // Same user code, fresh device code: primary key collision
        let mut clash = DeviceFlow::new("client_id".into(), "scope".into());
        clash.user_code = "AAAAAAAA".into();
        assert!(!clash.try_insert(&conn).await.unwrap());

        clash.user_code = "BBBBBBBB".into();
        assert!(clash.try_insert(&conn).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_flow_expiry() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let flow = DeviceFlow::start("cli", "scope", &conn).await.unwrap();

        // An expired flow is invisible to the browser leg
        assert_eq!(
            DeviceFlow::validate_user_code(&flow.user_code, 0, &conn).await.unwrap_err().status_code(),
            404
        );
        assert!(DeviceFlow::insert_id_token(&flow.user_code, &json!({"sub": "42"}), 0, &conn).await.is_err());
        match DeviceFlow::poll(&flow.device_code, 0, &conn).await.unwrap() {
            DeviceFlowPoll::Expired => {}
            _ => panic!("expected an expired poll"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_flow_claim_is_single_winner() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let flow = DeviceFlow::start("cli", "scope", &conn).await.unwrap();
        DeviceFlow::insert_id_token(&flow.user_code, &json!({"sub": "42"}), MAX_VALIDITY, &conn).await.unwrap();

        // The CAS transition succeeds exactly once
        assert!(DeviceFlow::claim(&flow.device_code, &conn).await.unwrap());
        assert!(!DeviceFlow::claim(&flow.device_code, &conn).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn device_flow_error_state() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let flow = DeviceFlow::start("cli", "scope", &conn).await.unwrap();
        DeviceFlow::mark_error(&flow.user_code, &conn).await.unwrap();

        match DeviceFlow::poll(&flow.device_code, MAX_VALIDITY, &conn).await.unwrap() {
            DeviceFlowPoll::Failed => {}
            _ => panic!("expected a failed poll"),
        }
        // The identity can no longer be attached
        assert!(DeviceFlow::insert_id_token(&flow.user_code, &json!({"sub": "42"}), MAX_VALIDITY, &conn)
            .await
            .is_err());
    }
}
