use once_cell::sync::Lazy;
use regex::Regex;
use rocket::serde::json::Json;
use rocket::Route;
use serde::Deserialize;
use serde_json::Value;

use macros::NumberFromParam;

use crate::{
    access::{self, PolicyAction},
    api::JsonResult,
    auth::AuthorizedUser,
    db::{
        models::{sandbox, Job, Sandbox},
        DbConn,
    },
    object_store,
    search::{SearchParams, SearchSpec},
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![
        submit_jobs,
        get_job,
        search_jobs,
        summary_jobs,
        initiate_sandbox_upload,
        get_sandbox_download,
        assign_job_sandbox,
    ]
}

#[derive(Clone, Copy, NumberFromParam)]
pub struct JobId(i64);

#[derive(Debug, Deserialize)]
struct JobDescription {
    job_name: String,
    #[serde(default)]
    job_type: Option<String>,
}

/// Registers job rows under the caller's identity. Everything past admission
/// (matching, execution) is out of scope here.
#[post("/", data = "<data>")]
async fn submit_jobs(data: Json<Vec<JobDescription>>, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::JobSubmit)?;

    let descriptions = data.into_inner();
    if descriptions.is_empty() {
        err!("No jobs submitted")
    }

    let mut rows = Vec::with_capacity(descriptions.len());
    for description in descriptions {
        let mut job = Job::new(
            user.vo.clone(),
            user.preferred_username.clone(),
            user.dirac_group.clone(),
            description.job_name,
        );
        if let Some(job_type) = description.job_type {
            job.job_type = job_type;
        }
        let job = job.insert(&conn).await?;
        rows.push(serde_json::json!({
            "JobID": job.job_id,
            "Status": job.status,
            "MinorStatus": job.minor_status,
            "TimeStamp": job.submission_time.format("%Y-%m-%dT%H:%M:%S").to_string(),
        }));
    }

    Ok(Json(Value::Array(rows)))
}

#[get("/<job_id>")]
async fn get_job(job_id: JobId, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    let Some(job) = Job::find_by_id(job_id.0, &conn).await else {
        err_code!("Job not found", 404)
    };
    access::check_permissions(
        &user,
        &PolicyAction::JobRead {
            owner: &job.owner,
            owner_group: &job.owner_group,
        },
    )?;
    if job.vo != user.vo {
        err_code!("Job not found", 404)
    }

    Ok(Json(Value::Object(job.to_search_row())))
}

#[post("/search?<page>&<per_page>", data = "<data>")]
async fn search_jobs(
    data: Json<SearchParams>,
    page: Option<u64>,
    per_page: Option<u64>,
    user: AuthorizedUser,
    conn: DbConn,
) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::JobSearch)?;

    let (total, rows) =
        Job::search(&data.into_inner(), Some(&user.vo), page.unwrap_or(1), per_page.unwrap_or(100), &conn).await?;
    Ok(Json(serde_json::json!({"total": total, "rows": rows})))
}

#[derive(Debug, Deserialize)]
struct SummaryParams {
    grouping: Vec<String>,
    #[serde(default)]
    search: Vec<SearchSpec>,
}

#[post("/summary", data = "<data>")]
async fn summary_jobs(data: Json<SummaryParams>, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::JobSearch)?;

    let data = data.into_inner();
    let rows = Job::summary(&data.grouping, &data.search, Some(&user.vo), &conn).await?;
    Ok(Json(serde_json::json!(rows)))
}

//
// Sandboxes
//

static CHECKSUM_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{64}$").unwrap());

#[derive(Debug, Deserialize)]
struct SandboxInfo {
    checksum_algorithm: String,
    checksum: String,
    size: u64,
    format: String,
}

impl SandboxInfo {
    fn validate(&self) -> crate::api::EmptyResult {
        if self.checksum_algorithm != "sha256" {
            err!("Unsupported checksum algorithm")
        }
        if !CHECKSUM_FORMAT.is_match(&self.checksum) {
            err!("Invalid checksum")
        }
        if self.size == 0 {
            err!("Invalid sandbox size")
        }
        if !matches!(self.format.as_str(), "tar.bz2" | "tar.zst") {
            err!("Unsupported sandbox format")
        }
        Ok(())
    }
}

/// Computes the canonical PFN and either hands out a presigned POST or tells
/// the client the content is already there. The presigned policy is the
/// authoritative gate on size and checksum; the metadata row only mirrors it.
#[post("/sandbox", data = "<data>")]
async fn initiate_sandbox_upload(data: Json<SandboxInfo>, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::SandboxAccess)?;

    let info = data.into_inner();
    info.validate()?;
    if info.size > CONFIG.max_sandbox_size() {
        err!("Sandbox too large")
    }

    let checksum = info.checksum.to_lowercase();
    let bucket = CONFIG.sandbox_bucket();
    let pfn = sandbox::sandbox_pfn(
        &bucket,
        &user.vo,
        &user.dirac_group,
        &user.preferred_username,
        &info.checksum_algorithm,
        &checksum,
        &info.format,
    );

    let row = Sandbox::new(
        pfn.clone(),
        user.vo.clone(),
        user.sub.clone(),
        info.size as i64,
        info.checksum_algorithm.clone(),
        checksum.clone(),
    );
    if row.insert_or_touch(&conn).await? {
        // Same principal, same content: nothing to upload
        return Ok(Json(serde_json::json!({"pfn": pfn, "url": null, "fields": {}})));
    }

    let key = sandbox::pfn_to_key(&bucket, &pfn).expect("PFN was just built from this bucket");
    let post = object_store::presigned_upload_post(
        &bucket,
        &key,
        &info.checksum_algorithm,
        &checksum,
        info.size,
        CONFIG.sandbox_url_validity_seconds(),
    )?;

    let fields: serde_json::Map<String, Value> =
        post.fields.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
    Ok(Json(serde_json::json!({"pfn": pfn, "url": post.url, "fields": fields})))
}

/// Presigned download, restricted to the caller's own sandbox prefix.
#[get("/sandbox?<pfn>")]
async fn get_sandbox_download(pfn: &str, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::SandboxAccess)?;

    let bucket = CONFIG.sandbox_bucket();
    if !sandbox::pfn_matches_identity(&bucket, pfn, &user.vo, &user.dirac_group, &user.preferred_username) {
        err!("Invalid PFN")
    }
    if Sandbox::find_by_pfn(pfn, &conn).await.is_none() {
        err_code!("Sandbox not found", 404)
    }
    Sandbox::touch(pfn, &conn).await?;

    let key = sandbox::pfn_to_key(&bucket, pfn).expect("prefix checked above");
    let validity = CONFIG.sandbox_url_validity_seconds();
    let url = object_store::presigned_download_url(&bucket, &key, validity).await?;

    Ok(Json(serde_json::json!({"url": url, "expires_in": validity})))
}

/// Ties an uploaded sandbox to a job, sheltering it from the cleanup job.
#[patch("/<job_id>/sandbox?<pfn>")]
async fn assign_job_sandbox(job_id: JobId, pfn: &str, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    let Some(job) = Job::find_by_id(job_id.0, &conn).await else {
        err_code!("Job not found", 404)
    };
    access::check_permissions(
        &user,
        &PolicyAction::JobRead {
            owner: &job.owner,
            owner_group: &job.owner_group,
        },
    )?;

    let bucket = CONFIG.sandbox_bucket();
    if !sandbox::pfn_matches_identity(&bucket, pfn, &user.vo, &user.dirac_group, &user.preferred_username) {
        err!("Invalid PFN")
    }
    if !Sandbox::set_assigned(pfn, true, &conn).await? {
        err_code!("Sandbox not found", 404)
    }

    Ok(Json(serde_json::json!({})))
}

/// Scheduled cleanup: drop unassigned metadata past retention and the
/// backing objects with it.
pub async fn clean_sandboxes(conn: &DbConn) {
    let bucket = CONFIG.sandbox_bucket();
    let expired = Sandbox::find_expired(CONFIG.sandbox_retention_days(), conn).await;
    for row in expired {
        let Some(key) = sandbox::pfn_to_key(&bucket, &row.pfn) else {
            warn!("Skipping sandbox with foreign PFN {}", row.pfn);
            continue;
        };
        match object_store::delete_object(&bucket, &key).await {
            Ok(()) => {
                if let Err(e) = Sandbox::delete(&row.pfn, conn).await {
                    warn!("Failed to delete sandbox metadata {}: {e:#?}", row.pfn);
                }
            }
            Err(e) => warn!("Failed to delete sandbox object {}: {e:#?}", row.pfn),
        }
    }
}
