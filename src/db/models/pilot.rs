use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde_json::{Map, Value};

use crate::api::EmptyResult;
use crate::crypto;
use crate::db::schema::pilots;
use crate::db::{DbConn, ExpectedSqlError};
use crate::error::{Error, MapResult};
use crate::search::{FieldType, SearchField};

#[derive(Debug, Clone, Identifiable, Queryable, QueryableByName, Insertable, AsChangeset)]
#[diesel(table_name = pilots)]
#[diesel(primary_key(pilot_job_reference))]
pub struct Pilot {
    pub pilot_job_reference: String,
    pub pilot_stamp: String,
    pub vo: String,
    pub grid_type: String,
    pub status: String,
    pub submission_time: NaiveDateTime,
    pub last_update_time: NaiveDateTime,
    pub hashed_secret: Option<String>,
    pub secret_creation_time: Option<NaiveDateTime>,
}

pub const SEARCH_FIELDS: &[SearchField] = &[
    SearchField {
        name: "PilotJobReference",
        column: "pilot_job_reference",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "PilotStamp",
        column: "pilot_stamp",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "VO",
        column: "vo",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "GridType",
        column: "grid_type",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "Status",
        column: "status",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "SubmissionTime",
        column: "submission_time",
        ftype: FieldType::DateTime,
    },
    SearchField {
        name: "LastUpdateTime",
        column: "last_update_time",
        ftype: FieldType::DateTime,
    },
];

/// Local methods
impl Pilot {
    pub fn new(pilot_job_reference: String, vo: String, grid_type: String) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            pilot_job_reference,
            pilot_stamp: crypto::get_random_token_hex::<16>(),
            vo,
            grid_type,
            status: "Submitted".to_string(),
            submission_time: now,
            last_update_time: now,
            hashed_secret: None,
            secret_creation_time: None,
        }
    }

    pub fn to_search_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("PilotJobReference".into(), Value::from(self.pilot_job_reference.clone()));
        row.insert("PilotStamp".into(), Value::from(self.pilot_stamp.clone()));
        row.insert("VO".into(), Value::from(self.vo.clone()));
        row.insert("GridType".into(), Value::from(self.grid_type.clone()));
        row.insert("Status".into(), Value::from(self.status.clone()));
        row.insert("SubmissionTime".into(), Value::from(self.submission_time.format("%Y-%m-%dT%H:%M:%S").to_string()));
        row.insert(
            "LastUpdateTime".into(),
            Value::from(self.last_update_time.format("%Y-%m-%dT%H:%M:%S").to_string()),
        );
        row
    }

    /// Constant time verification of a presented secret against the stored
    /// keyed hash. Pilots without credentials never verify.
    pub fn secret_matches(&self, presented_secret: &str, hmac_key: &[u8]) -> bool {
        match self.hashed_secret {
            Some(ref stored) => {
                let presented = crypto::hmac_sha256_hex(hmac_key, presented_secret.as_bytes());
                crypto::ct_eq(presented, stored)
            }
            None => false,
        }
    }
}

/// Database methods
impl Pilot {
    /// Inserts the pilot. A duplicate job reference (or stamp) is a conflict.
    pub async fn insert(&self, conn: &DbConn) -> EmptyResult {
        let value = self.clone();
        let outcome = conn
            .run_checked(&[ExpectedSqlError::UniqueViolation], move |conn| {
                diesel::insert_into(pilots::table).values(&value).execute(conn)
            })
            .await?;
        match outcome {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::new("Pilot already exists", "").with_code(409)),
        }
    }

    /// Generates a fresh secret, stores only its keyed hash and returns the
    /// plaintext. This is the only place the plaintext ever exists server side.
    pub async fn assign_credentials(&mut self, hmac_key: &[u8], conn: &DbConn) -> Result<String, Error> {
        let secret = crypto::get_random_token_hex::<32>();
        self.hashed_secret = Some(crypto::hmac_sha256_hex(hmac_key, secret.as_bytes()));
        self.secret_creation_time = Some(Utc::now().naive_utc());
        let value = self.clone();
        let result: Result<(), Error> = db_run! { conn: {
            diesel::update(pilots::table.filter(pilots::pilot_job_reference.eq(&value.pilot_job_reference)))
                .set((
                    pilots::hashed_secret.eq(&value.hashed_secret),
                    pilots::secret_creation_time.eq(&value.secret_creation_time),
                ))
                .execute(conn)
                .map_res("Error storing pilot credentials")
        }};
        result?;
        Ok(secret)
    }

    pub async fn find_by_reference(reference: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            pilots::table
                .filter(pilots::pilot_job_reference.eq(reference))
                .first::<Pilot>(conn)
                .ok()
        }}
    }

    pub async fn find_by_stamp(stamp: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            pilots::table
                .filter(pilots::pilot_stamp.eq(stamp))
                .first::<Pilot>(conn)
                .ok()
        }}
    }

    pub async fn set_status(&mut self, status: &str, conn: &DbConn) -> EmptyResult {
        self.status = status.to_string();
        self.last_update_time = Utc::now().naive_utc();
        let value = self.clone();
        db_run! { conn: {
            diesel::update(pilots::table.filter(pilots::pilot_job_reference.eq(&value.pilot_job_reference)))
                .set((
                    pilots::status.eq(&value.status),
                    pilots::last_update_time.eq(&value.last_update_time),
                ))
                .execute(conn)
                .map_res("Error updating pilot status")
        }}
    }
}

crate::impl_searchable!(Pilot, "pilots", "vo");
