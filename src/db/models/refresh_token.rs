use chrono::{NaiveDateTime, TimeDelta, Utc};
use diesel::prelude::*;
use std::fmt;

use crate::api::EmptyResult;
use crate::db::schema::refresh_tokens;
use crate::db::DbConn;
use crate::error::{Error, MapResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshTokenStatus {
    Created,
    Revoked,
}

impl RefreshTokenStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for RefreshTokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row per issued refresh token. Revoked rows are retained: a revoked
/// `jti` showing up again is the replay signal that triggers the lineage-wide
/// revocation, so deleting them would blind the theft detection.
#[derive(Debug, Clone, Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = refresh_tokens)]
#[diesel(primary_key(jti))]
pub struct RefreshToken {
    pub jti: String,
    pub status: String,
    pub creation_time: NaiveDateTime,
    pub scope: String,
    pub sub: String,
    pub preferred_username: String,
    pub legacy_exchange: bool,
}

/// Outcome of presenting a refresh token for rotation.
pub enum RefreshUse {
    /// The token was live and is now revoked; the caller mints the successor.
    Rotated(RefreshToken),
    /// Replay detected (or the rotation race was lost): the whole lineage has
    /// been revoked.
    Replayed,
    /// The `jti` was never issued, or has already been purged.
    Unknown,
}

/// Local methods
impl RefreshToken {
    pub fn new(sub: String, preferred_username: String, scope: String, legacy_exchange: bool) -> Self {
        Self {
            // v7 keeps the primary key time-ordered
            jti: uuid::Uuid::now_v7().to_string(),
            status: RefreshTokenStatus::Created.to_string(),
            creation_time: Utc::now().naive_utc(),
            scope,
            sub,
            preferred_username,
            legacy_exchange,
        }
    }
}

/// Database methods
impl RefreshToken {
    pub async fn mint(
        sub: &str,
        preferred_username: &str,
        scope: &str,
        legacy_exchange: bool,
        conn: &DbConn,
    ) -> Result<Self, Error> {
        let token = RefreshToken::new(sub.to_string(), preferred_username.to_string(), scope.to_string(), legacy_exchange);
        let value = token.clone();
        let result: Result<(), Error> = db_run! { conn: {
            diesel::insert_into(refresh_tokens::table)
                .values(&value)
                .execute(conn)
                .map_res("Error inserting refresh token")
        }};
        result?;
        Ok(token)
    }

    /// Rotation with replay detection. The CREATED -> REVOKED compare-and-set
    /// is the single serialization point: under concurrent refreshes with the
    /// same token exactly one caller rotates, everyone else is treated as a
    /// replay and takes the lineage down with them.
    pub async fn use_token(jti: &str, conn: &DbConn) -> Result<RefreshUse, Error> {
        let Some(token) = Self::find_by_jti(jti, conn).await else {
            return Ok(RefreshUse::Unknown);
        };

        if token.status == RefreshTokenStatus::Revoked.to_string() {
            Self::revoke_lineage(&token.sub, &token.preferred_username, conn).await?;
            return Ok(RefreshUse::Replayed);
        }

        let updated = db_run! { conn: {
            diesel::update(
                refresh_tokens::table
                    .filter(refresh_tokens::jti.eq(jti))
                    .filter(refresh_tokens::status.eq(RefreshTokenStatus::Created.to_string())),
            )
            .set(refresh_tokens::status.eq(RefreshTokenStatus::Revoked.to_string()))
            .execute(conn)
            .map_err(Error::from)
        }}?;

        if updated == 1 {
            Ok(RefreshUse::Rotated(token))
        } else {
            // Lost the race: someone rotated this jti between our read and the
            // update. Same response as a replay.
            Self::revoke_lineage(&token.sub, &token.preferred_username, conn).await?;
            Ok(RefreshUse::Replayed)
        }
    }

    /// RFC 7009: revoking an unknown token is a silent no-op.
    pub async fn revoke(jti: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(refresh_tokens::table.filter(refresh_tokens::jti.eq(jti)))
                .set(refresh_tokens::status.eq(RefreshTokenStatus::Revoked.to_string()))
                .execute(conn)
                .map_res("Error revoking refresh token")
        }}
    }

    /// Token-theft response: kill every refresh token of the same identity.
    pub async fn revoke_lineage(sub: &str, preferred_username: &str, conn: &DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(
                refresh_tokens::table
                    .filter(refresh_tokens::sub.eq(sub))
                    .filter(refresh_tokens::preferred_username.eq(preferred_username)),
            )
            .set(refresh_tokens::status.eq(RefreshTokenStatus::Revoked.to_string()))
            .execute(conn)
            .map_res("Error revoking refresh token lineage")
        }}
    }

    pub async fn find_by_jti(jti: &str, conn: &DbConn) -> Option<Self> {
        db_run! { conn: {
            refresh_tokens::table
                .filter(refresh_tokens::jti.eq(jti))
                .first::<RefreshToken>(conn)
                .ok()
        }}
    }

    /// Deletes rows past the replay-detection retention window.
    pub async fn purge_expired(retention_days: i64, conn: &DbConn) -> EmptyResult {
        let cutoff = Utc::now().naive_utc() - TimeDelta::days(retention_days);
        db_run! { conn: {
            diesel::delete(refresh_tokens::table.filter(refresh_tokens::creation_time.lt(cutoff)))
                .execute(conn)
                .map_res("Error purging refresh tokens")
        }}
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::*;
    use crate::db::test_helpers::test_db;

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_rotation_and_replay() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let j1 = RefreshToken::mint("lhcb:42", "chaen", "vo:lhcb group:lhcb_user", false, &conn).await.unwrap();

        // First use rotates
        let j2 = match RefreshToken::use_token(&j1.jti, &conn).await.unwrap() {
            RefreshUse::Rotated(old) => {
                assert_eq!(old.jti, j1.jti);
                RefreshToken::mint(&old.sub, &old.preferred_username, &old.scope, old.legacy_exchange, &conn)
                    .await
                    .unwrap()
            }
            _ => panic!("expected the first use to rotate"),
        };

        // Replaying j1 revokes the whole lineage, including the successor
        assert!(matches!(RefreshToken::use_token(&j1.jti, &conn).await.unwrap(), RefreshUse::Replayed));
        let j2_row = RefreshToken::find_by_jti(&j2.jti, &conn).await.unwrap();
        assert_eq!(j2_row.status, "REVOKED");

        // And the successor is now unusable as well
        assert!(matches!(RefreshToken::use_token(&j2.jti, &conn).await.unwrap(), RefreshUse::Replayed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refresh_lineage_is_per_identity() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let ours = RefreshToken::mint("lhcb:42", "chaen", "scope", false, &conn).await.unwrap();
        let theirs = RefreshToken::mint("lhcb:43", "other", "scope", false, &conn).await.unwrap();

        RefreshToken::use_token(&ours.jti, &conn).await.unwrap();
        assert!(matches!(RefreshToken::use_token(&ours.jti, &conn).await.unwrap(), RefreshUse::Replayed));

        // The unrelated identity is untouched
        let theirs_row = RefreshToken::find_by_jti(&theirs.jti, &conn).await.unwrap();
        assert_eq!(theirs_row.status, "CREATED");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn revoke_unknown_is_silent() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        assert!(RefreshToken::revoke("00000000-0000-0000-0000-000000000000", &conn).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn jti_is_time_ordered() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let a = RefreshToken::mint("lhcb:42", "chaen", "scope", false, &conn).await.unwrap();
        let b = RefreshToken::mint("lhcb:42", "chaen", "scope", false, &conn).await.unwrap();
        assert!(a.jti < b.jti, "{} should sort before {}", a.jti, b.jti);
    }
}
