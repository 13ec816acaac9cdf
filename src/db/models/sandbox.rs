use chrono::{NaiveDateTime, TimeDelta, Utc};
use diesel::prelude::*;

use crate::api::EmptyResult;
use crate::db::schema::sandboxes;
use crate::db::{DbConn, ExpectedSqlError};
use crate::error::{Error, MapResult};

/// Content addressed sandbox metadata. The PFN is a pure function of the
/// owner's identity and the content digest, which is what makes re-uploads
/// idempotent.
#[derive(Debug, Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = sandboxes)]
#[diesel(primary_key(pfn))]
pub struct Sandbox {
    pub pfn: String,
    pub vo: String,
    pub owner_id: String,
    pub size: i64,
    pub checksum_algorithm: String,
    pub checksum: String,
    pub assigned: bool,
    pub last_access_time: NaiveDateTime,
}

/// Canonical PFN: `/S3/{bucket}/{vo}/{group}/{username}/{algo}:{checksum}.{format}`.
pub fn sandbox_pfn(bucket: &str, vo: &str, group: &str, username: &str, algo: &str, checksum: &str, format: &str) -> String {
    format!("/S3/{bucket}/{vo}/{group}/{username}/{algo}:{checksum}.{format}")
}

/// The object store key is the PFN without the leading `/S3/{bucket}/`.
pub fn pfn_to_key(bucket: &str, pfn: &str) -> Option<String> {
    pfn.strip_prefix(&format!("/S3/{bucket}/")).map(str::to_string)
}

/// A caller may only touch sandboxes under its own `{vo}/{group}/{username}`
/// prefix.
pub fn pfn_matches_identity(bucket: &str, pfn: &str, vo: &str, group: &str, username: &str) -> bool {
    pfn.starts_with(&format!("/S3/{bucket}/{vo}/{group}/{username}/"))
}

/// Local methods
impl Sandbox {
    pub fn new(pfn: String, vo: String, owner_id: String, size: i64, checksum_algorithm: String, checksum: String) -> Self {
        Self {
            pfn,
            vo,
            owner_id,
            size,
            checksum_algorithm,
            checksum,
            assigned: false,
            last_access_time: Utc::now().naive_utc(),
        }
    }
}

/// Database methods
impl Sandbox {
    /// Inserts the metadata row, or refreshes `last_access_time` when the
    /// same content has been uploaded before. Returns true when the row
    /// already existed (the client can skip the upload).
    pub async fn insert_or_touch(&self, conn: &DbConn) -> Result<bool, Error> {
        let value = self.clone();
        let outcome = conn
            .run_checked(&[ExpectedSqlError::UniqueViolation], move |conn| {
                diesel::insert_into(sandboxes::table).values(&value).execute(conn)
            })
            .await?;
        match outcome {
            Ok(_) => Ok(false),
            Err(_) => {
                Self::touch(&self.pfn, conn).await?;
                Ok(true)
            }
        }
    }

    pub async fn touch(pfn: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(sandboxes::table.filter(sandboxes::pfn.eq(pfn)))
                .set(sandboxes::last_access_time.eq(Utc::now().naive_utc()))
                .execute(conn)
                .map_res("Error refreshing sandbox access time")
        }}
    }

    /// Ties the sandbox to a job so the cleanup job keeps its hands off.
    pub async fn set_assigned(pfn: &str, assigned: bool, conn: &DbConn) -> Result<bool, Error> {
        let updated = db_run! { conn: {
            diesel::update(sandboxes::table.filter(sandboxes::pfn.eq(pfn)))
                .set(sandboxes::assigned.eq(assigned))
                .execute(conn)
                .map_err(Error::from)
        }}?;
        Ok(updated == 1)
    }

    pub async fn find_by_pfn(pfn: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            sandboxes::table
                .filter(sandboxes::pfn.eq(pfn))
                .first::<Sandbox>(conn)
                .ok()
        }}
    }

    /// Unassigned rows whose last access is older than the retention period;
    /// candidates for deletion together with their backing objects.
    pub async fn find_expired(retention_days: i64, conn: &DbConn) -> Vec<Self> {
        let cutoff = Utc::now().naive_utc() - TimeDelta::days(retention_days);
        db_run! { conn: {
            sandboxes::table
                .filter(sandboxes::assigned.eq(false))
                .filter(sandboxes::last_access_time.lt(cutoff))
                .load::<Sandbox>(conn)
                .unwrap_or_default()
        }}
    }

    pub async fn delete(pfn: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(sandboxes::table.filter(sandboxes::pfn.eq(pfn)))
                .execute(conn)
                .map_res("Error deleting sandbox")
        }}
    }
}

#[cfg(test)]
mod pfn_tests {
    use super::*;

    #[test]
    fn pfn_is_canonical() {
        let pfn = sandbox_pfn("sandboxes", "lhcb", "lhcb_user", "chaen", "sha256", "abc123", "tar.bz2");
        assert_eq!(pfn, "/S3/sandboxes/lhcb/lhcb_user/chaen/sha256:abc123.tar.bz2");
        assert_eq!(pfn_to_key("sandboxes", &pfn).unwrap(), "lhcb/lhcb_user/chaen/sha256:abc123.tar.bz2");
    }

    #[test]
    fn pfn_identity_prefix() {
        let pfn = sandbox_pfn("sandboxes", "lhcb", "lhcb_user", "chaen", "sha256", "abc123", "tar.bz2");
        assert!(pfn_matches_identity("sandboxes", &pfn, "lhcb", "lhcb_user", "chaen"));
        // Another user, group or VO must not pass the prefix check
        assert!(!pfn_matches_identity("sandboxes", &pfn, "lhcb", "lhcb_user", "other"));
        assert!(!pfn_matches_identity("sandboxes", &pfn, "lhcb", "lhcb_admin", "chaen"));
        assert!(!pfn_matches_identity("sandboxes", &pfn, "gridpp", "lhcb_user", "chaen"));
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::test_helpers::test_db;

    fn sample(pfn: &str) -> Sandbox {
        Sandbox::new(
            pfn.to_string(),
            "lhcb".to_string(),
            "lhcb:42".to_string(),
            512,
            "sha256".to_string(),
            "ab".repeat(32),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reupload_is_idempotent_and_touches() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let sandbox = sample("/S3/sandboxes/lhcb/lhcb_user/chaen/sha256:aa.tar.bz2");
        assert!(!sandbox.insert_or_touch(&conn).await.unwrap());
        let first = Sandbox::find_by_pfn(&sandbox.pfn, &conn).await.unwrap().last_access_time;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(sandbox.insert_or_touch(&conn).await.unwrap());
        let second = Sandbox::find_by_pfn(&sandbox.pfn, &conn).await.unwrap().last_access_time;
        assert!(second > first, "{second} should be after {first}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_spares_assigned_rows() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let stale = sample("/S3/sandboxes/lhcb/lhcb_user/chaen/sha256:aa.tar.bz2");
        let kept = sample("/S3/sandboxes/lhcb/lhcb_user/chaen/sha256:bb.tar.bz2");
        stale.insert_or_touch(&conn).await.unwrap();
        kept.insert_or_touch(&conn).await.unwrap();
        Sandbox::set_assigned(&kept.pfn, true, &conn).await.unwrap();

        // Nothing is expired with a positive retention
        assert!(Sandbox::find_expired(15, &conn).await.is_empty());

        // With a zero-day retention everything unassigned is a candidate
        let expired = Sandbox::find_expired(0, &conn).await;
        assert!(expired.is_empty(), "last_access_time is now, not in the past");

        // Backdate both rows; only the unassigned one comes back
        let backdated = Utc::now().naive_utc() - TimeDelta::days(30);
        db_run! { conn: {
            diesel::update(sandboxes::table)
                .set(sandboxes::last_access_time.eq(backdated))
                .execute(conn)
                .unwrap();
        }};
        let expired = Sandbox::find_expired(15, &conn).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].pfn, stale.pfn);

        Sandbox::delete(&stale.pfn, &conn).await.unwrap();
        assert!(Sandbox::find_by_pfn(&stale.pfn, &conn).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn assignment_flag() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let sandbox = sample("/S3/sandboxes/lhcb/lhcb_user/chaen/sha256:cc.tar.bz2");
        sandbox.insert_or_touch(&conn).await.unwrap();

        assert!(Sandbox::set_assigned(&sandbox.pfn, true, &conn).await.unwrap());
        assert!(Sandbox::find_by_pfn(&sandbox.pfn, &conn).await.unwrap().assigned);
        // Unknown PFN: no row updated
        assert!(!Sandbox::set_assigned("/S3/sandboxes/nope", true, &conn).await.unwrap());
    }
}
