use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use serde_json::{Map, Value};

use crate::api::EmptyResult;
use crate::db::schema::jobs;
use crate::db::DbConn;
use crate::error::{Error, MapResult};
use crate::search::{FieldType, SearchField};

/// Administrative job state. Matching and execution live elsewhere; this row
/// is what the search engine and the sandbox assignment work against.
#[derive(Debug, Clone, Identifiable, Queryable, QueryableByName, Insertable, AsChangeset)]
#[diesel(table_name = jobs)]
#[diesel(primary_key(job_id))]
pub struct Job {
    pub job_id: i64,
    pub vo: String,
    pub owner: String,
    pub owner_group: String,
    pub job_name: String,
    pub job_type: String,
    pub status: String,
    pub minor_status: String,
    pub application_status: String,
    pub site: String,
    pub submission_time: NaiveDateTime,
    pub last_update_time: NaiveDateTime,
}

/// External name to column binding consumed by the search engine.
pub const SEARCH_FIELDS: &[SearchField] = &[
    SearchField {
        name: "JobID",
        column: "job_id",
        ftype: FieldType::Integer,
    },
    SearchField {
        name: "VO",
        column: "vo",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "Owner",
        column: "owner",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "OwnerGroup",
        column: "owner_group",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "JobName",
        column: "job_name",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "JobType",
        column: "job_type",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "Status",
        column: "status",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "MinorStatus",
        column: "minor_status",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "ApplicationStatus",
        column: "application_status",
        ftype: FieldType::Text,
    },
    SearchField {
        name: "Site",
        column: "site",
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
impl Job {
    pub fn new(vo: String, owner: String, owner_group: String, job_name: String) -> Self {
        let now = Utc::now().naive_utc();
        Self {
            job_id: 0, // assigned by the database
            vo,
            owner,
            owner_group,
            job_name,
            job_type: "User".to_string(),
            status: "Received".to_string(),
            minor_status: "Job accepted".to_string(),
            application_status: "Unknown".to_string(),
            site: "ANY".to_string(),
            submission_time: now,
            last_update_time: now,
        }
    }

    pub fn to_search_row(&self) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("JobID".into(), Value::from(self.job_id));
        row.insert("VO".into(), Value::from(self.vo.clone()));
        row.insert("Owner".into(), Value::from(self.owner.clone()));
        row.insert("OwnerGroup".into(), Value::from(self.owner_group.clone()));
        row.insert("JobName".into(), Value::from(self.job_name.clone()));
        row.insert("JobType".into(), Value::from(self.job_type.clone()));
        row.insert("Status".into(), Value::from(self.status.clone()));
        row.insert("MinorStatus".into(), Value::from(self.minor_status.clone()));
        row.insert("ApplicationStatus".into(), Value::from(self.application_status.clone()));
        row.insert("Site".into(), Value::from(self.site.clone()));
        row.insert("SubmissionTime".into(), Value::from(self.submission_time.format("%Y-%m-%dT%H:%M:%S").to_string()));
        row.insert(
            "LastUpdateTime".into(),
            Value::from(self.last_update_time.format("%Y-%m-%dT%H:%M:%S").to_string()),
        );
        row
    }
}

/// Database methods
impl Job {
    /// Inserts the job and returns it with its database-assigned id.
    pub async fn insert(mut self, conn: &DbConn) -> Result<Self, Error> {
        let value = self.clone();
        let job_id: i64 = db_run! { conn:
            sqlite {
                diesel::insert_into(jobs::table)
                    .values((
                        jobs::vo.eq(&value.vo),
                        jobs::owner.eq(&value.owner),
                        jobs::owner_group.eq(&value.owner_group),
                        jobs::job_name.eq(&value.job_name),
                        jobs::job_type.eq(&value.job_type),
                        jobs::status.eq(&value.status),
                        jobs::minor_status.eq(&value.minor_status),
                        jobs::application_status.eq(&value.application_status),
                        jobs::site.eq(&value.site),
                        jobs::submission_time.eq(&value.submission_time),
                        jobs::last_update_time.eq(&value.last_update_time),
                    ))
                    .execute(conn)
                    .map_err(Error::from)
                    .and_then(|_| {
                        diesel::select(diesel::dsl::sql::<diesel::sql_types::BigInt>("last_insert_rowid()"))
                            .get_result::<i64>(conn)
                            .map_err(Error::from)
                    })
            }
            mysql {
                diesel::insert_into(jobs::table)
                    .values((
                        jobs::vo.eq(&value.vo),
                        jobs::owner.eq(&value.owner),
                        jobs::owner_group.eq(&value.owner_group),
                        jobs::job_name.eq(&value.job_name),
                        jobs::job_type.eq(&value.job_type),
                        jobs::status.eq(&value.status),
                        jobs::minor_status.eq(&value.minor_status),
                        jobs::application_status.eq(&value.application_status),
                        jobs::site.eq(&value.site),
                        jobs::submission_time.eq(&value.submission_time),
                        jobs::last_update_time.eq(&value.last_update_time),
                    ))
                    .execute(conn)
                    .map_err(Error::from)
                    .and_then(|_| {
                        diesel::select(diesel::dsl::sql::<diesel::sql_types::BigInt>("LAST_INSERT_ID()"))
                            .get_result::<i64>(conn)
                            .map_err(Error::from)
                    })
            }
            postgresql {
                diesel::insert_into(jobs::table)
                    .values((
                        jobs::vo.eq(&value.vo),
                        jobs::owner.eq(&value.owner),
                        jobs::owner_group.eq(&value.owner_group),
                        jobs::job_name.eq(&value.job_name),
                        jobs::job_type.eq(&value.job_type),
                        jobs::status.eq(&value.status),
                        jobs::minor_status.eq(&value.minor_status),
                        jobs::application_status.eq(&value.application_status),
                        jobs::site.eq(&value.site),
                        jobs::submission_time.eq(&value.submission_time),
                        jobs::last_update_time.eq(&value.last_update_time),
                    ))
                    .returning(jobs::job_id)
                    .get_result::<i64>(conn)
                    .map_err(Error::from)
            }
        }?;
        self.job_id = job_id;
        Ok(self)
    }

    pub async fn find_by_id(job_id: i64, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            jobs::table
                .filter(jobs::job_id.eq(job_id))
                .first::<Job>(conn)
                .ok()
        }}
    }

    pub async fn set_status(&mut self, status: &str, minor_status: &str, conn: &DbConn) -> EmptyResult {
        self.status = status.to_string();
        self.minor_status = minor_status.to_string();
        self.last_update_time = Utc::now().naive_utc();
        let value = self.clone();
        db_run! { conn: {
            diesel::update(jobs::table.filter(jobs::job_id.eq(value.job_id)))
                .set((
                    jobs::status.eq(&value.status),
                    jobs::minor_status.eq(&value.minor_status),
                    jobs::last_update_time.eq(&value.last_update_time),
                ))
                .execute(conn)
                .map_res("Error updating job status")
        }}
    }
}

crate::impl_searchable!(Job, "jobs", "vo");
