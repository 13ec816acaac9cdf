//
// The configuration view: a read-only snapshot of the VO / group / user tree,
// refreshed asynchronously from a versioned source and shared by every
// request through an `Arc`.
//
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use serde::{Deserialize, Serialize};

use crate::{
    crypto,
    error::{Error, MapResult},
    util, CONFIG,
};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IdpConfig {
    pub url: String,
    pub client_id: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SupportInfo {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub webpage: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserConfig {
    pub preferred_username: String,
    #[serde(default)]
    pub email: Option<String>,
}

fn default_job_share() -> i32 {
    2
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub properties: BTreeSet<String>,
    #[serde(default)]
    pub users: BTreeSet<String>,
    #[serde(default = "default_job_share")]
    pub job_share: i32,
    #[serde(default)]
    pub allow_background_tqs: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VoConfig {
    pub idp: IdpConfig,
    pub default_group: String,
    #[serde(default)]
    pub support: SupportInfo,
    #[serde(default)]
    pub users: BTreeMap<String, UserConfig>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

impl VoConfig {
    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.get(name)
    }

    pub fn user(&self, subject: &str) -> Option<&UserConfig> {
        self.users.get(subject)
    }

    /// Resolves a preferred username to its unique subject. Ambiguity or
    /// absence are both errors: the legacy exchange must map to exactly one
    /// user.
    pub fn subject_of_username(&self, preferred_username: &str) -> Result<&str, Error> {
        let mut matches = self.users.iter().filter(|(_, user)| user.preferred_username == preferred_username);
        match (matches.next(), matches.next()) {
            (Some((subject, _)), None) => Ok(subject),
            _ => err_silent!(format!("No unique user with preferred_username {preferred_username}")),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegistryDocument {
    pub registry: BTreeMap<String, VoConfig>,
}

/// One immutable, validated revision of the configuration.
pub struct ConfigSnapshot {
    pub registry: BTreeMap<String, VoConfig>,
    /// Revision identifier, served as the `ETag`.
    pub revision: String,
    /// Source modification time, served as `Last-Modified`.
    pub modified: NaiveDateTime,
    /// The rendered document, served on the config endpoint.
    pub document: serde_json::Value,
}

impl ConfigSnapshot {
    pub fn vo(&self, name: &str) -> Result<&VoConfig, Error> {
        match self.registry.get(name) {
            Some(vo) => Ok(vo),
            None => err_silent!(format!("Unknown VO {name}")),
        }
    }
}

/// Structural invariants every accepted snapshot upholds.
fn validate(document: &RegistryDocument) -> Result<(), Error> {
    for (vo_name, vo) in &document.registry {
        if !vo.groups.contains_key(&vo.default_group) {
            err!(format!("VO {vo_name}: default_group {} is not a defined group", vo.default_group));
        }
        for (group_name, group) in &vo.groups {
            for subject in &group.users {
                if !vo.users.contains_key(subject) {
                    err!(format!("VO {vo_name}: group {group_name} member {subject} is not a registered user"));
                }
            }
        }
    }
    Ok(())
}

pub fn parse_document(raw: &str, revision: String, modified: NaiveDateTime) -> Result<ConfigSnapshot, Error> {
    let document: RegistryDocument = serde_yaml::from_str(raw).map_res("Invalid registry document")?;
    validate(&document)?;
    let rendered = serde_json::to_value(&document)?;
    Ok(ConfigSnapshot {
        registry: document.registry,
        revision,
        modified,
        document: rendered,
    })
}

enum SourceKind {
    File(String),
    Http(String),
}

enum FetchAttemptError {
    Local(Error),
    Transport(reqwest::Error),
}

fn source_kind() -> SourceKind {
    let url = CONFIG.config_source_url();
    if let Some(stripped) = url.strip_prefix("file://") {
        SourceKind::File(stripped.to_string())
    } else if url.starts_with("http://") || url.starts_with("https://") {
        SourceKind::Http(url)
    } else {
        SourceKind::File(url)
    }
}

async fn fetch() -> Result<ConfigSnapshot, Error> {
    match source_kind() {
        SourceKind::File(path) => {
            let raw = util::read_file_string(&path).map_res("Cannot read the registry document")?;
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|t| DateTime::<Utc>::from(t).naive_utc())
                .unwrap_or_else(|_| Utc::now().naive_utc());
            let revision = crypto::sha256_hex(raw.as_bytes());
            parse_document(&raw, revision, modified)
        }
        SourceKind::Http(url) => {
            let attempt = || async {
                crate::http_client::make_http_request(reqwest::Method::GET, &url)
                    .map_err(FetchAttemptError::Local)?
                    .send()
                    .await
                    .map_err(FetchAttemptError::Transport)
            };
            let response = util::retry_transient(attempt, 3, |e| {
                matches!(e, FetchAttemptError::Transport(inner) if crate::http_client::is_transient_error(inner))
            })
            .await
            .map_err(|e| match e {
                FetchAttemptError::Local(e) => e,
                FetchAttemptError::Transport(e) => Error::from(e),
            })?
            .error_for_status()?;
            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string());
            let modified = response
                .headers()
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(util::parse_datetime_http)
                .unwrap_or_else(|| Utc::now().naive_utc());
            let raw = response.text().await?;
            let revision = etag.unwrap_or_else(|| crypto::sha256_hex(raw.as_bytes()));
            parse_document(&raw, revision, modified)
        }
    }
}

struct RegistryCache {
    snapshot: Option<Arc<ConfigSnapshot>>,
    fetched_at: Option<Instant>,
}

static CACHE: Lazy<RwLock<RegistryCache>> = Lazy::new(|| {
    RwLock::new(RegistryCache {
        snapshot: None,
        fetched_at: None,
    })
});

/// The last good snapshot, if any. Never blocks on the source.
pub fn snapshot() -> Option<Arc<ConfigSnapshot>> {
    CACHE.read().unwrap().snapshot.clone()
}

fn is_stale() -> bool {
    let cache = CACHE.read().unwrap();
    match cache.fetched_at {
        Some(at) => at.elapsed() > Duration::from_secs(CONFIG.config_cache_ttl()),
        None => true,
    }
}

/// Fetches the source and swaps the snapshot in. Revisions are monotone per
/// process: an unchanged revision keeps the existing `Arc`.
pub async fn refresh() -> Result<(), Error> {
    let fresh = fetch().await?;
    let mut cache = CACHE.write().unwrap();
    cache.fetched_at = Some(Instant::now());
    match cache.snapshot {
        Some(ref current) if current.revision == fresh.revision => {}
        _ => {
            info!("Loaded configuration revision {}", fresh.revision);
            cache.snapshot = Some(Arc::new(fresh));
        }
    }
    Ok(())
}

/// Soft-TTL refresh used by the scheduler and by the first request to arrive
/// after the TTL; errors keep the previous snapshot in place.
pub async fn refresh_if_stale() {
    if is_stale() {
        if let Err(e) = refresh().await {
            warn!("Configuration refresh failed, keeping the previous revision: {e:#?}");
        }
    }
}

/// Request guard handing out one consistent snapshot for the whole request.
/// 503 while the source has never been read successfully.
pub struct RegistrySnapshot(pub Arc<ConfigSnapshot>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RegistrySnapshot {
    type Error = &'static str;

    async fn from_request(_request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        refresh_if_stale().await;
        match snapshot() {
            Some(snapshot) => Outcome::Success(RegistrySnapshot(snapshot)),
            None => Outcome::Error((Status::ServiceUnavailable, "Configuration not available")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub const SAMPLE: &str = r#"
registry:
  lhcb:
    idp:
      url: "https://idp.invalid/realm"
      client_id: "lhcb-client"
    default_group: lhcb_user
    support:
      message: "ask the helpdesk"
    users:
      "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041":
        preferred_username: chaen
        email: chaen@example.invalid
      "26dbe36e-cf5c-4c52-a834-29a1c904ef74":
        preferred_username: albdr
    groups:
      lhcb_user:
        properties: [NormalUser]
        users:
          - "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041"
          - "26dbe36e-cf5c-4c52-a834-29a1c904ef74"
      lhcb_prmgr:
        properties: [NormalUser, ProductionManagement]
        users:
          - "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041"
"#;

    fn sample_snapshot() -> ConfigSnapshot {
        parse_document(SAMPLE, "rev-1".into(), Utc::now().naive_utc()).unwrap()
    }

    #[test]
    fn parses_and_indexes() {
        let snapshot = sample_snapshot();
        let vo = snapshot.vo("lhcb").unwrap();
        assert_eq!(vo.default_group, "lhcb_user");
        assert_eq!(vo.groups["lhcb_user"].users.len(), 2);
        assert!(vo.groups["lhcb_prmgr"].properties.contains("ProductionManagement"));
        assert_eq!(vo.groups["lhcb_user"].job_share, 2);
        assert!(snapshot.vo("atlas").is_err());
    }

    #[test]
    fn username_resolution_is_unique() {
        let snapshot = sample_snapshot();
        let vo = snapshot.vo("lhcb").unwrap();
        assert_eq!(vo.subject_of_username("chaen").unwrap(), "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041");
        assert!(vo.subject_of_username("nobody").is_err());
    }

    #[test]
    fn rejects_default_group_not_defined() {
        let broken = SAMPLE.replace("default_group: lhcb_user", "default_group: lhcb_admin");
        assert!(parse_document(&broken, "rev".into(), Utc::now().naive_utc()).is_err());
    }

    #[test]
    fn rejects_group_member_not_registered() {
        let broken = SAMPLE.replace("- \"26dbe36e-cf5c-4c52-a834-29a1c904ef74\"", "- \"deadbeef-0000\"");
        assert!(parse_document(&broken, "rev".into(), Utc::now().naive_utc()).is_err());
    }

    #[test]
    fn document_roundtrips_to_json() {
        let snapshot = sample_snapshot();
        assert!(snapshot.document["registry"]["lhcb"]["groups"]["lhcb_user"].is_object());
    }
}
