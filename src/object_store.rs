//
// Object storage access: presigned uploads and downloads against an
// S3-compatible endpoint.
//
// Uploads use a SigV4 POST policy with an exact size condition and a
// required checksum field, so the storage backend itself enforces that the
// uploaded bytes are the ones announced; a leaked URL is useless for
// anything else. Downloads are plain SigV4 presigned GETs.
//
use std::time::Duration;

use aws_sdk_s3::{presigning::PresigningConfig, Client};
use chrono::{DateTime, TimeDelta, Utc};
use data_encoding::{BASE64, HEXLOWER};
use once_cell::sync::Lazy;
use serde_json::json;

use crate::{
    crypto,
    error::{Error, MapResult},
    CONFIG,
};

static CLIENT: Lazy<Option<Client>> = Lazy::new(|| {
    let (access_key, secret_key) = CONFIG.s3_credentials()?;
    let credentials = aws_sdk_s3::config::Credentials::new(access_key, secret_key, None, None, "gridgate");
    let config = aws_sdk_s3::config::Builder::new()
        .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
        .region(aws_sdk_s3::config::Region::new(CONFIG.s3_region()))
        .endpoint_url(CONFIG.s3_endpoint())
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    Some(Client::from_conf(config))
});

fn client() -> Result<&'static Client, Error> {
    match CLIENT.as_ref() {
        Some(client) => Ok(client),
        None => Err(Error::new("Object storage is not configured", "").with_code(503)),
    }
}

/// Makes sure the bucket exists; finding it already there is not an error.
pub async fn ensure_bucket(bucket: &str) -> Result<(), Error> {
    match client()?.create_bucket().bucket(bucket).send().await {
        Ok(_) => Ok(()),
        Err(e) => {
            if let Some(service_error) = e.as_service_error() {
                if service_error.is_bucket_already_owned_by_you() || service_error.is_bucket_already_exists() {
                    return Ok(());
                }
            }
            err!("Failed to create the bucket", format!("{e:?}"))
        }
    }
}

pub async fn object_exists(bucket: &str, key: &str) -> Result<bool, Error> {
    match client()?.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            if let Some(service_error) = e.as_service_error() {
                if service_error.is_not_found() {
                    return Ok(false);
                }
            }
            err!("Failed to query object storage", format!("{e:?}"))
        }
    }
}

pub async fn delete_object(bucket: &str, key: &str) -> Result<(), Error> {
    client()?
        .delete_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map(|_| ())
        .map_err(|e| Error::new("Failed to delete object", format!("{e:?}")))
}

pub async fn presigned_download_url(bucket: &str, key: &str, validity_seconds: u64) -> Result<String, Error> {
    let presigning = PresigningConfig::expires_in(Duration::from_secs(validity_seconds))
        .map_err(|e| Error::new("Invalid presigning validity", e.to_string()))?;
    client()?
        .get_object()
        .bucket(bucket)
        .key(key)
        .presigned(presigning)
        .await
        .map(|presigned| presigned.uri().to_string())
        .map_err(|e| Error::new("Failed to presign download", format!("{e:?}")))
}

/// A presigned POST: the URL plus the form fields the client must send
/// verbatim alongside the file.
#[derive(Debug)]
pub struct PresignedPost {
    pub url: String,
    pub fields: Vec<(String, String)>,
}

/// Generates a POST policy restricted to exactly `size` bytes of content
/// with the announced checksum.
pub fn presigned_upload_post(
    bucket: &str,
    key: &str,
    checksum_algorithm: &str,
    checksum_hex: &str,
    size: u64,
    validity_seconds: u64,
) -> Result<PresignedPost, Error> {
    let Some((access_key, secret_key)) = CONFIG.s3_credentials() else {
        return Err(Error::new("Object storage is not configured", "").with_code(503));
    };
    presigned_upload_post_at(
        Utc::now(),
        &CONFIG.s3_endpoint(),
        &CONFIG.s3_region(),
        &access_key,
        &secret_key,
        bucket,
        key,
        checksum_algorithm,
        checksum_hex,
        size,
        validity_seconds,
    )
}

/// The time-explicit worker behind `presigned_upload_post`.
#[allow(clippy::too_many_arguments)]
fn presigned_upload_post_at(
    now: DateTime<Utc>,
    endpoint: &str,
    region: &str,
    access_key: &str,
    secret_key: &str,
    bucket: &str,
    key: &str,
    checksum_algorithm: &str,
    checksum_hex: &str,
    size: u64,
    validity_seconds: u64,
) -> Result<PresignedPost, Error> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let credential = format!("{access_key}/{date}/{region}/s3/aws4_request");
    let expiration = (now + TimeDelta::seconds(validity_seconds as i64)).format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();

    let checksum_field = format!("x-amz-checksum-{checksum_algorithm}");
    let checksum_b64 = crypto::b16_to_b64(checksum_hex)?;
    let mut checksum_condition = serde_json::Map::new();
    checksum_condition.insert(checksum_field.clone(), json!(checksum_b64));

    let policy = json!({
        "expiration": expiration,
        "conditions": [
            {"bucket": bucket},
            {"key": key},
            ["content-length-range", size, size],
            {"x-amz-checksum-algorithm": checksum_algorithm},
            checksum_condition,
            {"x-amz-algorithm": "AWS4-HMAC-SHA256"},
            {"x-amz-credential": &credential},
            {"x-amz-date": &amz_date},
        ],
    });
    let policy_b64 = BASE64.encode(serde_json::to_string(&policy)?.as_bytes());

    // AWS SigV4 key derivation chain
    let k_date = crypto::hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let k_region = crypto::hmac_sha256(&k_date, region.as_bytes());
    let k_service = crypto::hmac_sha256(&k_region, b"s3");
    let k_signing = crypto::hmac_sha256(&k_service, b"aws4_request");
    let signature = HEXLOWER.encode(&crypto::hmac_sha256(&k_signing, policy_b64.as_bytes()));

    Ok(PresignedPost {
        url: format!("{}/{bucket}", endpoint.trim_end_matches('/')),
        fields: vec![
            ("key".to_string(), key.to_string()),
            ("x-amz-algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            ("x-amz-credential".to_string(), credential),
            ("x-amz-date".to_string(), amz_date),
            ("x-amz-checksum-algorithm".to_string(), checksum_algorithm.to_string()),
            (checksum_field, checksum_b64),
            ("policy".to_string(), policy_b64),
            ("x-amz-signature".to_string(), signature),
        ],
    })
}
