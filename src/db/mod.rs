use std::{sync::Mutex, time::Duration};

use diesel::{
    connection::SimpleConnection,
    r2d2::{ManageConnection, Pool, PooledConnection, R2D2Connection},
    Connection,
};

use rocket::{
    http::Status,
    request::{FromRequest, Outcome},
    Request,
};

use crate::{
    error::{Error, MapResult},
    CONFIG,
};

// One variant per compiled-in backend; the runtime backend is picked from the
// DATABASE_URL scheme.
#[derive(diesel::MultiConnection)]
pub enum DbConnInner {
    #[cfg(mysql)]
    Mysql(diesel::mysql::MysqlConnection),
    #[cfg(postgresql)]
    Postgresql(diesel::pg::PgConnection),
    #[cfg(sqlite)]
    Sqlite(diesel::sqlite::SqliteConnection),
}

/// Driver error kinds a caller may declare as legitimate outcomes of a
/// statement. Everything else escaping a checked statement is treated as
/// evidence that the connection is in an unknown state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExpectedSqlError {
    /// The insert hit an existing primary key or unique index.
    UniqueViolation,
    /// The statement expected a row that is not there.
    NotFound,
}

impl ExpectedSqlError {
    fn classify(e: &diesel::result::Error) -> Option<Self> {
        match e {
            diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, _) => {
                Some(Self::UniqueViolation)
            }
            diesel::result::Error::NotFound => Some(Self::NotFound),
            _ => None,
        }
    }
}

/// What the pool actually manages: the backend connection plus the poison
/// marker set by the failure guard. A poisoned connection is discarded on
/// release instead of being handed to the next request.
pub struct ManagedConn {
    inner: DbConnInner,
    poisoned: bool,
}

pub struct DbConnManager {
    database_url: String,
    init_stmts: String,
}

impl ManageConnection for DbConnManager {
    type Connection = ManagedConn;
    type Error = diesel::r2d2::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn_type = DbConnType::from_url(&self.database_url).map_err(|e| {
            diesel::r2d2::Error::ConnectionError(diesel::ConnectionError::InvalidConnectionUrl(e.to_string()))
        })?;

        let mut inner = match conn_type {
            #[cfg(mysql)]
            DbConnType::Mysql => DbConnInner::Mysql(diesel::mysql::MysqlConnection::establish(&self.database_url)?),
            #[cfg(postgresql)]
            DbConnType::Postgresql => {
                DbConnInner::Postgresql(diesel::pg::PgConnection::establish(&self.database_url)?)
            }
            #[cfg(sqlite)]
            DbConnType::Sqlite => {
                DbConnInner::Sqlite(diesel::sqlite::SqliteConnection::establish(sqlite_path(&self.database_url))?)
            }
        };

        // Session setup happens here, on the connection the pool will hand
        // out, not in a separate customizer.
        if !self.init_stmts.is_empty() {
            inner.batch_execute(&self.init_stmts).map_err(diesel::r2d2::Error::QueryError)?;
        }

        Ok(ManagedConn {
            inner,
            poisoned: false,
        })
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.inner.ping().map_err(diesel::r2d2::Error::QueryError)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.poisoned || conn.inner.is_broken()
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum DbConnType {
    #[cfg(mysql)]
    Mysql,
    #[cfg(postgresql)]
    Postgresql,
    #[cfg(sqlite)]
    Sqlite,
}

impl DbConnType {
    pub fn from_url(url: &str) -> Result<Self, Error> {
        if url.starts_with("mysql://") {
            #[cfg(mysql)]
            return Ok(DbConnType::Mysql);

            #[cfg(not(mysql))]
            err!("`DATABASE_URL` is a MySQL URL, but the 'mysql' feature is not enabled")
        } else if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            #[cfg(postgresql)]
            return Ok(DbConnType::Postgresql);

            #[cfg(not(postgresql))]
            err!("`DATABASE_URL` is a PostgreSQL URL, but the 'postgresql' feature is not enabled")
        } else {
            // Bare paths and sqlite:// URLs
            #[cfg(sqlite)]
            return Ok(DbConnType::Sqlite);

            #[cfg(not(sqlite))]
            err!("`DATABASE_URL` looks like a SQLite URL, but the 'sqlite' feature is not enabled")
        }
    }

    fn init_stmts(&self) -> String {
        let configured = CONFIG.database_conn_init();
        if !configured.is_empty() {
            return configured;
        }
        match self {
            #[cfg(mysql)]
            Self::Mysql => String::new(),
            #[cfg(postgresql)]
            Self::Postgresql => String::new(),
            #[cfg(sqlite)]
            Self::Sqlite => "PRAGMA busy_timeout = 5000; PRAGMA synchronous = NORMAL;".to_string(),
        }
    }
}

/// SQLite accepts a bare path or a sqlite:// URL.
#[cfg(sqlite)]
fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://").unwrap_or(url)
}

#[derive(Clone)]
pub struct DbPool {
    pool: Pool<DbConnManager>,
}

impl DbPool {
    // For the config-provided database URL, guess its type, run migrations, create pool, and return it
    pub fn from_config() -> Result<Self, Error> {
        Self::from_url(&CONFIG.database_url(), CONFIG.database_max_conns(), CONFIG.database_timeout())
    }

    pub fn from_url(db_url: &str, max_conns: u32, conn_timeout: u64) -> Result<Self, Error> {
        let conn_type = DbConnType::from_url(db_url)?;
        run_migrations(&conn_type, db_url)?;

        let manager = DbConnManager {
            database_url: db_url.to_string(),
            init_stmts: conn_type.init_stmts(),
        };
        let pool = Pool::builder()
            .max_size(max_conns)
            .connection_timeout(Duration::from_secs(conn_timeout))
            .build(manager)
            .map_res("Failed to create the database pool")?;

        Ok(DbPool {
            pool,
        })
    }

    /// Gets a connection from the pool. Waiting for a free slot happens on a
    /// blocking thread so the async workers stay available.
    pub async fn get(&self) -> Result<DbConn, Error> {
        let pool = self.pool.clone();
        let pooled = match tokio::task::spawn_blocking(move || pool.get()).await {
            Ok(result) => result.map_res("Error retrieving connection from pool")?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => err_code!("Database executor shut down", 503),
        };
        Ok(DbConn {
            conn: Mutex::new(pooled),
        })
    }
}

pub struct DbConn {
    conn: Mutex<PooledConnection<DbConnManager>>,
}

impl DbConn {
    /// Runs a closure against the backend connection. Diesel is synchronous,
    /// so the current worker is flagged as blocking for the duration.
    pub async fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut DbConnInner) -> R,
    {
        tokio::task::block_in_place(|| {
            let mut pooled = self.conn.lock().expect("database connection mutex");
            f(&mut pooled.inner)
        })
    }

    /// The failure-mode guard around a single statement: the caller declares
    /// which driver error kinds are legitimate outcomes. A declared error is
    /// passed back as the inner `Err`; anything undeclared poisons the
    /// connection, which the pool then throws away instead of reusing in an
    /// unknown state.
    pub async fn run_checked<F, R>(
        &self,
        expected: &'static [ExpectedSqlError],
        f: F,
    ) -> Result<Result<R, ExpectedSqlError>, Error>
    where
        F: FnOnce(&mut DbConnInner) -> diesel::QueryResult<R>,
    {
        tokio::task::block_in_place(|| {
            let mut pooled = self.conn.lock().expect("database connection mutex");
            match f(&mut pooled.inner) {
                Ok(value) => Ok(Ok(value)),
                Err(e) => match ExpectedSqlError::classify(&e) {
                    Some(kind) if expected.contains(&kind) => Ok(Err(kind)),
                    _ => {
                        pooled.poisoned = true;
                        Err(Error::from(e).with_msg("Database connection is in a bad state").with_code(500))
                    }
                },
            }
        })
    }

    #[cfg(test)]
    fn is_poisoned(&self) -> bool {
        self.conn.lock().unwrap().poisoned
    }
}

#[macro_export]
macro_rules! db_run {
    ( $conn:ident: $body:block ) => {
        $conn.run(move |$conn| $body).await
    };

    ( $conn:ident: $( $($db:ident),+ $body:block )+ ) => {
        $conn.run(move |$conn| {
            match $conn {
                $($(
                #[cfg($db)]
                pastey::paste!(&mut $crate::db::DbConnInner::[<$db:camel>](ref mut $conn)) => {
                    $body
                },
            )+)+}
        }).await
    };
}

pub mod schema;

// Reexport the models, needs to be after the macros are defined so it can access them
pub mod models;

/// Attempts to retrieve a single connection from the managed database pool. If
/// no pool is currently managed, fails with an `InternalServerError` status. If
/// no connections are available, fails with a `ServiceUnavailable` status.
#[rocket::async_trait]
impl<'r> FromRequest<'r> for DbConn {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.rocket().state::<DbPool>() {
            Some(p) => match p.get().await {
                Ok(dbconn) => Outcome::Success(dbconn),
                _ => Outcome::Error((Status::ServiceUnavailable, ())),
            },
            None => Outcome::Error((Status::InternalServerError, ())),
        }
    }
}

//
// Embedded migrations, applied before the pool opens. The schema carries no
// foreign keys, so no constraint juggling is needed around them.
//
#[cfg(sqlite)]
const SQLITE_MIGRATIONS: diesel_migrations::EmbeddedMigrations = diesel_migrations::embed_migrations!("migrations/sqlite");
#[cfg(mysql)]
const MYSQL_MIGRATIONS: diesel_migrations::EmbeddedMigrations = diesel_migrations::embed_migrations!("migrations/mysql");
#[cfg(postgresql)]
const POSTGRESQL_MIGRATIONS: diesel_migrations::EmbeddedMigrations =
    diesel_migrations::embed_migrations!("migrations/postgresql");

fn run_migrations(conn_type: &DbConnType, db_url: &str) -> Result<(), Error> {
    use diesel_migrations::MigrationHarness;

    match conn_type {
        #[cfg(sqlite)]
        DbConnType::Sqlite => {
            use diesel::RunQueryDsl;

            // This will create the database file if it does not exist yet
            let mut conn = diesel::sqlite::SqliteConnection::establish(sqlite_path(db_url))?;
            if CONFIG.enable_db_wal() {
                let result: Result<(), Error> =
                    diesel::sql_query("PRAGMA journal_mode=wal").execute(&mut conn).map_res("Failed to enable WAL");
                result?;
            }
            conn.run_pending_migrations(SQLITE_MIGRATIONS)
                .map_err(|e| Error::new("Error running migrations", e.to_string()))?;
        }
        #[cfg(mysql)]
        DbConnType::Mysql => {
            let mut conn = diesel::mysql::MysqlConnection::establish(db_url)?;
            conn.run_pending_migrations(MYSQL_MIGRATIONS)
                .map_err(|e| Error::new("Error running migrations", e.to_string()))?;
        }
        #[cfg(postgresql)]
        DbConnType::Postgresql => {
            let mut conn = diesel::pg::PgConnection::establish(db_url)?;
            conn.run_pending_migrations(POSTGRESQL_MIGRATIONS)
                .map_err(|e| Error::new("Error running migrations", e.to_string()))?;
        }
    }
    Ok(())
}

/// Test helper: a pool backed by a throwaway on-disk SQLite database, so that
/// several pooled connections observe the same data.
#[cfg(all(test, sqlite))]
pub mod test_helpers {
    use super::DbPool;

    pub struct TestDb {
        pub pool: DbPool,
        // Removed from disk when the last test reference drops.
        _dir: tempfile::TempDir,
    }

    pub fn test_db() -> TestDb {
        let dir = tempfile::tempdir().expect("Failed to create a temporary directory");
        let db_path = dir.path().join("gridgate-test.sqlite3");
        let pool = DbPool::from_url(db_path.to_str().unwrap(), 4, 5).expect("Failed to create the test pool");
        TestDb {
            pool,
            _dir: dir,
        }
    }
}

#[cfg(all(test, sqlite))]
mod tests {
    use super::test_helpers::test_db;
    use super::*;
    use diesel::RunQueryDsl;

    fn insert_flow_stmt() -> diesel::query_builder::SqlQuery {
        diesel::sql_query(
            "INSERT INTO device_flows (user_code, device_code, client_id, scope, status, creation_time) \
             VALUES ('AAAAAAAA', 'device-code', 'cli', 'vo:lhcb', 'PENDING', '2025-01-01 00:00:00')",
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn declared_errors_pass_through_without_poisoning() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let first = conn.run_checked(&[ExpectedSqlError::UniqueViolation], |c| insert_flow_stmt().execute(c)).await;
        assert!(matches!(first, Ok(Ok(1))));

        // The duplicate key was declared: reported, not fatal
        let second = conn.run_checked(&[ExpectedSqlError::UniqueViolation], |c| insert_flow_stmt().execute(c)).await;
        assert!(matches!(second, Ok(Err(ExpectedSqlError::UniqueViolation))));
        assert!(!conn.is_poisoned());

        // The connection keeps serving
        conn.run(|c| diesel::sql_query("SELECT 1").execute(c)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn undeclared_errors_poison_the_connection() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let result = conn.run_checked(&[], |c| diesel::sql_query("SELECT broken FROM nowhere").execute(c)).await;
        assert_eq!(result.unwrap_err().status_code(), 500);
        assert!(conn.is_poisoned());
        drop(conn);

        // The pool discards the poisoned connection and serves a healthy one
        let fresh = db.pool.get().await.unwrap();
        assert!(!fresh.is_poisoned());
        fresh.run(|c| diesel::sql_query("SELECT 1").execute(c)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn declaring_an_error_that_does_not_occur_is_a_noop() {
        let db = test_db();
        let conn = db.pool.get().await.unwrap();

        let result = conn
            .run_checked(&[ExpectedSqlError::UniqueViolation, ExpectedSqlError::NotFound], |c| {
                insert_flow_stmt().execute(c)
            })
            .await;
        assert!(matches!(result, Ok(Ok(1))));
        assert!(!conn.is_poisoned());
    }

    #[test]
    fn sqlite_urls_accept_both_forms() {
        assert_eq!(sqlite_path("data/gridgate.sqlite3"), "data/gridgate.sqlite3");
        assert_eq!(sqlite_path("sqlite://data/gridgate.sqlite3"), "data/gridgate.sqlite3");
    }
}
