use std::process::exit;
use std::sync::RwLock;

use job_scheduler_ng::Schedule;
use once_cell::sync::Lazy;
use reqwest::Url;

use crate::{
    error::Error,
    util::{get_env, get_env_bool, parse_csv_list},
};

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::load().unwrap_or_else(|e| {
        println!("Error loading config:\n  {e:?}\n");
        exit(1)
    })
});

pub type Pass = String;

macro_rules! make_config {
    ($(
        $(#[doc = $groupdoc:literal])?
        $group:ident {
        $(
            $(#[doc = $doc:literal])+
            $name:ident : $ty:ident, $none_action:ident $(, $default:expr)?;
        )+},
    )+) => {
        pub struct Config { inner: RwLock<Inner> }

        struct Inner {
            config: ConfigItems,
        }

        #[derive(Clone, Default)]
        struct ConfigBuilder {
            $($(
                $name: Option<$ty>,
            )+)+
        }

        impl ConfigBuilder {
            fn from_env() -> Self {
                let env_file = get_env("ENV_FILE").unwrap_or_else(|| String::from(".env"));
                match dotenvy::from_path(&env_file) {
                    Ok(_) => {
                        println!("[INFO] Using environment file `{env_file}` for configuration.\n");
                    },
                    Err(e) => match e {
                        dotenvy::Error::LineParse(msg, pos) => {
                            println!("[ERROR] Failed parsing environment file: `{env_file}`\nNear {msg:?} on position {pos}\nPlease fix and restart!\n");
                            exit(255);
                        },
                        dotenvy::Error::Io(ioerr) => match ioerr.kind() {
                            std::io::ErrorKind::NotFound => {
                                // Only exit if this environment variable is set, but the file was not found.
                                // This prevents incorrectly configured environments.
                                if let Some(env_file) = get_env::<String>("ENV_FILE") {
                                    println!("[ERROR] The configured ENV_FILE `{env_file}` was not found!\n");
                                    exit(255);
                                }
                            },
                            std::io::ErrorKind::PermissionDenied => {
                                println!("[ERROR] Permission denied while trying to read environment file `{env_file}`!\n");
                                exit(255);
                            },
                            _ => {
                                println!("[ERROR] Reading environment file `{env_file}` failed:\n{ioerr:?}\n");
                                exit(255);
                            }
                        },
                        _ => {
                            println!("[ERROR] Reading environment file `{env_file}` failed:\n{e:?}\n");
                            exit(255);
                        }
                    }
                };

                let mut builder = ConfigBuilder::default();
                $($(
                    builder.$name = make_config! { @getenv pastey::paste!(stringify!([<$name:upper>])), $ty };
                )+)+

                builder
            }

            fn build(&self) -> ConfigItems {
                let mut config = ConfigItems::default();
                $($(
                    config.$name = make_config!{ @build self.$name.clone(), &config, $none_action, $($default)? };
                )+)+

                config.domain = config.domain.trim_end_matches('/').to_string();

                config
            }
        }

        #[derive(Clone, Default)]
        struct ConfigItems { $($( $name: make_config!{@type $ty, $none_action}, )+)+ }

        #[allow(unused)]
        impl Config {
            $($(
                $(#[doc = $doc])+
                pub fn $name(&self) -> make_config!{@type $ty, $none_action} {
                    self.inner.read().unwrap().config.$name.clone()
                }
            )+)+
        }
    };

    // Group or empty string
    ( @show ) => { "" };
    ( @show $lit:literal ) => { $lit };

    // Wrap the optionals in an Option type
    ( @type $ty:ty, option) => { Option<$ty> };
    ( @type $ty:ty, $id:ident) => { $ty };

    // Generate the values depending on none_action
    ( @build $value:expr, $config:expr, option, ) => { $value };
    ( @build $value:expr, $config:expr, def, $default:expr ) => { $value.unwrap_or($default) };
    ( @build $value:expr, $config:expr, auto, $default_fn:expr ) => {{
        let f: &dyn Fn(&ConfigItems) -> _ = &$default_fn;
        $value.unwrap_or_else(|| f($config))
    }};

    ( @getenv $name:expr, bool ) => { get_env_bool($name) };
    ( @getenv $name:expr, $ty:ident ) => { get_env($name) };
}

//STRUCTURE:
// /$group {
//    /// $doc
//    $name: $ty, $none_action, $default;
// }
//
// $none_action: an none_action to do when the value is none, possible values are:
//  - def:    use a default value
//  - auto:   value is auto generated based on other values
//  - option: value is optional
make_config! {
    folders {
        ///  Data folder |> Main data folder
        data_folder:            String, def,    String::from("data");
    },
    server {
        /// Public origin of the service. Used as the issuer of every minted token and to
        /// derive the device-flow verification URI
        domain:                 String, def,    String::from("http://localhost:8000");
    },
    database {
        /// Database URL
        database_url:           String, auto,   |c| format!("{}/{}", c.data_folder, "gridgate.sqlite3");
        /// Database connection pool size
        database_max_conns:     u32,    def,    10;
        /// Database connection init |> SQL statements to run when creating a new database connection
        database_conn_init:     String, def,    String::new();
        /// Timeout when acquiring database connection
        database_timeout:       u64,    def,    30;
        /// Enable WAL for the DB |> Turn on WAL with the `journal_mode=wal` PRAGMA. SQLite only
        enable_db_wal:          bool,   def,    true;
    },
    auth {
        /// Token signing key |> Active signing key: either an inline RSA private key PEM or a
        /// (possibly `file://` prefixed) path to one. Created at first start when missing
        token_signing_key:      Pass,   auto,   |c| format!("{}/{}", c.data_folder, "token_signing_key.pem");
        /// Extra verification keys |> Comma separated public key PEM paths kept valid for
        /// verification after a signing-key rotation
        token_verify_keys:      String, def,    String::new();
        /// Access token validity in minutes
        access_token_expire_minutes: i64, def,  30;
        /// Refresh token validity in minutes
        refresh_token_expire_minutes: i64, def, 60;
        /// Legacy-exchange refresh validity in days |> Refresh tokens minted through the legacy
        /// bearer exchange are long lived by design
        legacy_exchange_refresh_expire_days: i64, def, 365;
        /// Revoked token retention in days |> Revoked refresh tokens are retained for replay
        /// detection and only purged after this window
        refresh_token_retention_days: i64,  def, 400;
        /// Device flow validity in seconds
        device_flow_expiration_seconds: i64, def, 600;
        /// Authorization flow validity in seconds
        authorization_flow_expiration_seconds: i64, def, 300;
        /// Device flow poll interval hint in seconds
        device_flow_poll_interval: u64, def,    5;
        /// OAuth client id |> The public client id accepted on the flow initiation endpoints
        client_id:              String, def,    String::from("gridgate-cli");
        /// Legacy exchange API key hash |> Hex encoded SHA-256 of the static legacy exchange
        /// bearer. The endpoint answers 503 while unset
        legacy_exchange_hashed_api_key: Pass, option;
        /// Pilot token properties |> Comma separated security properties attached to pilot
        /// access tokens
        pilot_token_properties: String, def,    String::from("GenericPilot");
        /// Pilot secret HMAC key |> Key for the keyed hash of pilot secrets. Derived from the
        /// signing key fingerprint when unset
        pilot_secret_hmac_key:  Pass,   option;
        /// Minimum client version |> Semver floor enforced through the client version header
        min_client_version:     String, option;
        /// Seconds incrementally added per token request
        token_ratelimit_seconds: u64,   def,    1;
        /// Max burst size for the token endpoint rate limit
        token_ratelimit_max_burst: u32, def,    20;
    },
    registry {
        /// Config source URL |> Local path or HTTP(S) URL of the VO registry YAML document
        config_source_url:      String, auto,   |c| format!("{}/{}", c.data_folder, "registry.yml");
        /// Config cache TTL in seconds |> Soft TTL after which a snapshot refresh is attempted
        config_cache_ttl:       u64,    def,    60;
    },
    storage {
        /// S3 endpoint
        s3_endpoint:            String, def,    String::from("http://localhost:9000");
        /// S3 region
        s3_region:              String, def,    String::from("us-east-1");
        /// S3 access key
        s3_access_key:          Pass,   option;
        /// S3 secret key
        s3_secret_key:          Pass,   option;
        /// Sandbox bucket
        sandbox_bucket:         String, def,    String::from("sandboxes");
        /// Presigned URL validity in seconds
        sandbox_url_validity_seconds: u64, def, 300;
        /// Max sandbox size in bytes
        max_sandbox_size:       u64,    def,    256 * 1024 * 1024;
        /// Sandbox retention in days |> Unassigned sandboxes older than this are removed by the
        /// cleanup job
        sandbox_retention_days: i64,    def,    15;
    },
    search {
        /// Max page size |> Hard cap applied to the per_page search parameter
        max_page_size:          u64,    def,    10_000;
    },
    extensions {
        /// Extensions |> Ordered comma separated list of extension names, highest priority first
        extensions:             String, def,    String::new();
    },
    jobs {
        /// Job scheduler poll interval |> How often the job scheduler thread checks for jobs to run.
        /// Set to 0 to globally disable scheduled jobs.
        job_poll_interval_ms:   u64,    def,    30_000;
        /// Flow purge schedule |> Cron schedule of the job purging expired device and
        /// authorization flows and refresh tokens past retention
        flow_purge_schedule:    String, def,    String::from("0 20 * * * *");
        /// Sandbox cleanup schedule |> Cron schedule of the job deleting expired unassigned sandboxes
        sandbox_cleanup_schedule: String, def,  String::from("0 45 3 * * *");
        /// Registry refresh schedule |> Cron schedule of the config snapshot refresh
        registry_refresh_schedule: String, def, String::from("*/30 * * * * *");
    },
    log {
        /// Log level
        log_level:              String, def,    String::from("info");
        /// Log file path
        log_file:               String, option;
        /// Enable syslog logging
        use_syslog:             bool,   def,    false;
        /// Log timestamp format
        log_timestamp_format:   String, def,    String::from("%Y-%m-%d %H:%M:%S.%3f");
    },
}

fn validate_config(cfg: &ConfigItems) -> Result<(), Error> {
    if let Err(e) = Url::parse(&cfg.domain) {
        err!(format!("DOMAIN is not a valid URL: {e}"));
    }

    let limit = 256;
    if cfg.database_max_conns < 1 || cfg.database_max_conns > limit {
        err!(format!("`DATABASE_MAX_CONNS` contains an invalid value. Ensure it is between 1 and {limit}."));
    }

    if cfg.token_ratelimit_max_burst == 0 {
        err!("`TOKEN_RATELIMIT_MAX_BURST` cannot be zero");
    }

    if let Some(ref key) = cfg.legacy_exchange_hashed_api_key {
        if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            err!("`LEGACY_EXCHANGE_HASHED_API_KEY` must be a hex encoded SHA-256 digest");
        }
    }

    if let Some(ref version) = cfg.min_client_version {
        if semver::Version::parse(version).is_err() {
            err!(format!("`MIN_CLIENT_VERSION` is not a valid semantic version: {version}"));
        }
    }

    if cfg.s3_access_key.is_some() != cfg.s3_secret_key.is_some() {
        err!("`S3_ACCESS_KEY` and `S3_SECRET_KEY` must be provided together");
    }

    for (name, schedule) in [
        ("FLOW_PURGE_SCHEDULE", &cfg.flow_purge_schedule),
        ("SANDBOX_CLEANUP_SCHEDULE", &cfg.sandbox_cleanup_schedule),
        ("REGISTRY_REFRESH_SCHEDULE", &cfg.registry_refresh_schedule),
    ] {
        if !schedule.is_empty() && schedule.parse::<Schedule>().is_err() {
            err!(format!("`{name}` is not a valid cron expression: {schedule}"));
        }
    }

    if cfg.max_page_size == 0 {
        err!("`MAX_PAGE_SIZE` cannot be zero");
    }

    Ok(())
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        // Loading from env
        let _env = ConfigBuilder::from_env();
        let config = _env.build();
        validate_config(&config)?;

        Ok(Config {
            inner: RwLock::new(Inner {
                config,
            }),
        })
    }

    /// The token issuer, equal to the public origin of the service.
    pub fn issuer(&self) -> String {
        self.domain()
    }

    /// The URI a user has to visit to complete a device flow.
    pub fn device_verification_uri(&self) -> String {
        format!("{}/api/auth/device/complete", self.domain())
    }

    pub fn legacy_exchange_enabled(&self) -> bool {
        self.legacy_exchange_hashed_api_key().is_some()
    }

    pub fn pilot_token_properties_vec(&self) -> Vec<String> {
        parse_csv_list(&self.pilot_token_properties())
    }

    pub fn token_verify_keys_vec(&self) -> Vec<String> {
        parse_csv_list(&self.token_verify_keys())
    }

    pub fn extensions_vec(&self) -> Vec<String> {
        parse_csv_list(&self.extensions())
    }

    pub fn s3_credentials(&self) -> Option<(String, String)> {
        match (self.s3_access_key(), self.s3_secret_key()) {
            (Some(access), Some(secret)) => Some((access, secret)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ConfigItems {
        ConfigBuilder::default().build()
    }

    #[test]
    fn check_defaults_are_valid() {
        let cfg = base_config();
        assert!(validate_config(&cfg).is_ok());
        assert_eq!(cfg.database_url, "data/gridgate.sqlite3");
        assert_eq!(cfg.max_page_size, 10_000);
    }

    #[test]
    fn check_invalid_legacy_key_rejected() {
        let mut cfg = base_config();
        cfg.legacy_exchange_hashed_api_key = Some("not-hex".into());
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn check_invalid_schedule_rejected() {
        let mut cfg = base_config();
        cfg.flow_purge_schedule = "every sometimes".into();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn check_s3_keys_must_pair() {
        let mut cfg = base_config();
        cfg.s3_access_key = Some("minioadmin".into());
        assert!(validate_config(&cfg).is_err());
        cfg.s3_secret_key = Some("minioadmin".into());
        assert!(validate_config(&cfg).is_ok());
    }
}
