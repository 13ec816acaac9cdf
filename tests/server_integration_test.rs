//
// End to end exercises against a local Rocket instance: device flow,
// authorization-code flow, refresh rotation, legacy exchange, pilots,
// sandboxes, config caching and the search surface.
//
// The identity-provider leg is driven through the database, as the flows
// would be after a successful IdP callback; everything else goes through the
// HTTP surface.
//
use std::sync::Once;

use data_encoding::BASE64URL_NOPAD;
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use serde_json::{json, Value};

use gridgate::{
    crypto,
    db::{models::*, DbPool},
    registry,
};

const CHAEN_SUB: &str = "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041";
const LEGACY_SECRET: &[u8] = b"integration-test-legacy-secret";

const REGISTRY_DOC: &str = r#"
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
      "26dbe36e-cf5c-4c52-a834-29a1c904ef74":
        preferred_username: other
    groups:
      lhcb_user:
        properties: [NormalUser]
        users:
          - "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041"
          - "26dbe36e-cf5c-4c52-a834-29a1c904ef74"
      lhcb_admin:
        properties: [NormalUser, ServiceAdministrator]
        users:
          - "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041"
  gridpp:
    idp:
      url: "https://idp.invalid/other"
      client_id: "gridpp-client"
    default_group: gridpp_user
    users:
      "11111111-2222-3333-4444-555555555555":
        preferred_username: dave
    groups:
      gridpp_user:
        properties: [NormalUser]
        users:
          - "11111111-2222-3333-4444-555555555555"
"#;

static INIT: Once = Once::new();
static mut TEST_DIR: Option<tempfile::TempDir> = None;

fn setup_env() {
    INIT.call_once(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();

        std::fs::write(base.join("registry.yml"), REGISTRY_DOC).unwrap();

        std::env::set_var("DATA_FOLDER", base.to_str().unwrap());
        std::env::set_var("DATABASE_URL", base.join("gridgate.sqlite3").to_str().unwrap());
        std::env::set_var("CONFIG_SOURCE_URL", base.join("registry.yml").to_str().unwrap());
        std::env::set_var("TOKEN_SIGNING_KEY", base.join("token_signing_key.pem").to_str().unwrap());
        std::env::set_var("DOMAIN", "http://localhost:8000");
        std::env::set_var("LEGACY_EXCHANGE_HASHED_API_KEY", crypto::sha256_hex(LEGACY_SECRET));
        std::env::set_var("S3_ENDPOINT", "http://localhost:9000");
        std::env::set_var("S3_ACCESS_KEY", "minioadmin");
        std::env::set_var("S3_SECRET_KEY", "minioadmin");
        std::env::set_var("MIN_CLIENT_VERSION", "1.0.0");
        std::env::set_var("TOKEN_RATELIMIT_MAX_BURST", "500");

        unsafe { TEST_DIR = Some(dir) };
    });
}

struct TestServer {
    client: Client,
    pool: DbPool,
    runtime: tokio::runtime::Runtime,
}

impl TestServer {
    fn start() -> Self {
        setup_env();
        let pool = DbPool::from_config().expect("test database pool");
        let client = Client::tracked(gridgate::build_rocket(pool.clone())).expect("valid rocket instance");
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
        TestServer {
            client,
            pool,
            runtime,
        }
    }

    fn with_conn<T, F, Fut>(&self, f: F) -> T
    where
        F: FnOnce(gridgate::db::DbConn) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.runtime.block_on(async {
            let conn = self.pool.get().await.expect("test db connection");
            f(conn).await
        })
    }

    fn post_token(&self, body: &str) -> (Status, Value) {
        let response = self.client.post("/api/auth/token").header(ContentType::Form).body(body.to_string()).dispatch();
        let status = response.status();
        let body: Value = response.into_json().expect("json body");
        (status, body)
    }

    fn legacy_exchange(&self, preferred_username: &str, group: &str) -> Value {
        let bearer = format!("Bearer gridgate:legacy:{}", data_encoding::BASE64URL.encode(LEGACY_SECRET));
        let uri = format!(
            "/api/auth/legacy-exchange?preferred_username={preferred_username}&scope=vo%3Alhcb%20group%3A{group}"
        );
        let response = self.client.get(uri).header(Header::new("Authorization", bearer)).dispatch();
        assert_eq!(response.status(), Status::Ok);
        response.into_json().expect("token pair")
    }
}

#[test]
fn full_control_plane_roundtrip() {
    let server = TestServer::start();
    let client = &server.client;

    //
    // Well-known surface and health
    //
    let response = client.get("/.well-known/openid-configuration").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let meta: Value = response.into_json().unwrap();
    assert_eq!(meta["code_challenge_methods_supported"], json!(["S256"]));
    assert_eq!(meta["issuer"], "http://localhost:8000");

    let response = client.get("/.well-known/dirac-metadata").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let meta: Value = response.into_json().unwrap();
    assert!(meta["virtual_organizations"]["lhcb"]["groups"]["lhcb_user"].is_object());

    let response = client.get("/.well-known/jwks.json").dispatch();
    let jwks: Value = response.into_json().unwrap();
    assert_eq!(jwks["keys"][0]["kty"], "RSA");

    let response = client.get("/api/health/live").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let response = client.get("/api/health/ready").dispatch();
    assert_eq!(response.status(), Status::Ok);

    // Unauthenticated requests are refused with the stable error shape
    let response = client.post("/api/jobs/search").header(ContentType::JSON).body("{}").dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
    let body: Value = response.into_json().unwrap();
    assert!(body["detail"].is_string());

    //
    // Scenario A: device flow
    //
    let response = client
        .post("/api/auth/device")
        .header(ContentType::JSON)
        .body(json!({"client_id": "gridgate-cli", "scope": "vo:lhcb group:lhcb_user"}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let flow: Value = response.into_json().unwrap();
    let user_code = flow["user_code"].as_str().unwrap().to_string();
    let device_code = flow["device_code"].as_str().unwrap().to_string();
    assert_eq!(user_code.len(), 8);
    assert_eq!(device_code.len(), 128);
    assert!(flow["verification_uri"].as_str().unwrap().ends_with("/api/auth/device/complete"));

    // Poll while pending
    let (status, body) = server.post_token(&format!(
        "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Adevice_code&device_code={device_code}"
    ));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "authorization_pending");

    // The browser leg succeeded (driven through the flow record)
    server.with_conn(|conn| async move {
        DeviceFlow::insert_id_token(
            &user_code,
            &json!({"sub": CHAEN_SUB, "preferred_username": "chaen"}),
            600,
            &conn,
        )
        .await
        .unwrap();
    });

    let (status, tokens) = server.post_token(&format!(
        "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Adevice_code&device_code={device_code}"
    ));
    assert_eq!(status, Status::Ok);
    let access_token = tokens["access_token"].as_str().unwrap().to_string();
    let device_refresh_token = tokens["refresh_token"].as_str().unwrap().to_string();
    assert_eq!(tokens["token_type"], "Bearer");

    let claims = gridgate::auth::decode_access_token(&access_token).unwrap();
    assert_eq!(claims.sub, format!("lhcb:{CHAEN_SUB}"));
    assert_eq!(claims.vo, "lhcb");
    assert_eq!(claims.dirac_group.as_deref(), Some("lhcb_user"));
    assert_eq!(claims.preferred_username, "chaen");

    // Replay of the device code
    let (status, body) = server.post_token(&format!(
        "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Adevice_code&device_code={device_code}"
    ));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "access_denied");

    let bearer = |token: &str| Header::new("Authorization", format!("Bearer {token}"));

    let response = client.get("/api/auth/userinfo").header(bearer(&access_token)).dispatch();
    assert_eq!(response.status(), Status::Ok);
    let info: Value = response.into_json().unwrap();
    assert_eq!(info["preferred_username"], "chaen");
    assert_eq!(info["dirac_group"], "lhcb_user");
    assert_eq!(info["properties"], json!(["NormalUser"]));

    // Client version floor
    let response = client
        .get("/api/auth/userinfo")
        .header(bearer(&access_token))
        .header(Header::new("Gridgate-Client-Version", "0.9.0"))
        .dispatch();
    assert_eq!(response.status(), Status::UpgradeRequired);

    //
    // Authorization-code flow: PKCE redeem through the token endpoint
    //
    let verifier = "integration-test-verifier-0123456789";
    let challenge = BASE64URL_NOPAD.encode(&crypto::sha256(verifier.as_bytes()));
    let auth_code = server.with_conn(|conn| async move {
        let flow = AuthorizationFlow::start("gridgate-cli", "vo:lhcb", &challenge, "http://localhost:7777/cb", &conn)
            .await
            .unwrap();
        let ready = AuthorizationFlow::insert_id_token(
            &flow.uuid,
            &json!({"sub": CHAEN_SUB, "preferred_username": "chaen"}),
            300,
            &conn,
        )
        .await
        .unwrap();
        ready.code.unwrap()
    });

    // A wrong verifier is an invalid grant and does not burn the code
    let (status, body) =
        server.post_token(&format!("grant_type=authorization_code&code={auth_code}&code_verifier=wrong"));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "invalid_grant");

    let (status, tokens) =
        server.post_token(&format!("grant_type=authorization_code&code={auth_code}&code_verifier={verifier}"));
    assert_eq!(status, Status::Ok);
    assert!(tokens["access_token"].is_string());

    // Single use
    let (status, body) =
        server.post_token(&format!("grant_type=authorization_code&code={auth_code}&code_verifier={verifier}"));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "invalid_grant");

    //
    // Scenario E: config caching
    //
    let response = client.get("/api/config/").header(bearer(&access_token)).dispatch();
    assert_eq!(response.status(), Status::Ok);
    let etag = response.headers().get_one("ETag").unwrap().to_string();
    let last_modified = response.headers().get_one("Last-Modified").unwrap().to_string();
    let config_body: Value = response.into_json().unwrap();
    assert!(config_body["registry"]["lhcb"].is_object());

    let response = client
        .get("/api/config/")
        .header(bearer(&access_token))
        .header(Header::new("If-None-Match", etag.clone()))
        .dispatch();
    assert_eq!(response.status(), Status::NotModified);

    // Wrong ETag with a fresh If-Modified-Since is still a 304 (permissive OR)
    let response = client
        .get("/api/config/")
        .header(bearer(&access_token))
        .header(Header::new("If-None-Match", "bogus"))
        .header(Header::new("If-Modified-Since", last_modified.clone()))
        .dispatch();
    assert_eq!(response.status(), Status::NotModified);

    // Wrong ETag and an unparseable date: full answer
    let response = client
        .get("/api/config/")
        .header(bearer(&access_token))
        .header(Header::new("If-None-Match", "bogus"))
        .header(Header::new("If-Modified-Since", "wrong format"))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    // A new commit invalidates the ETag
    let registry_path = std::path::PathBuf::from(std::env::var("CONFIG_SOURCE_URL").unwrap());
    let mut doc = std::fs::read_to_string(&registry_path).unwrap();
    doc.push_str("\n# revision bump\n");
    std::fs::write(&registry_path, doc).unwrap();
    server.runtime.block_on(registry::refresh()).unwrap();

    let response = client
        .get("/api/config/")
        .header(bearer(&access_token))
        .header(Header::new("If-None-Match", etag.clone()))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let new_etag = response.headers().get_one("ETag").unwrap();
    assert_ne!(new_etag, etag);

    //
    // Scenario F: search with the implicit VO filter
    //
    let response = client
        .post("/api/jobs")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(json!([{"job_name": "hello"}, {"job_name": "world"}]).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let submitted: Value = response.into_json().unwrap();
    let job_id = submitted[0]["JobID"].as_i64().unwrap();

    // A job of a foreign VO, as the control plane of that VO would create it
    server.with_conn(|conn| async move {
        Job::new("gridpp".into(), "dave".into(), "gridpp_user".into(), "foreign".into()).insert(&conn).await.unwrap();
    });

    let response = client
        .post("/api/jobs/search")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(json!({"parameters": ["JobID", "VO", "Owner"]}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let result: Value = response.into_json().unwrap();
    assert_eq!(result["total"], 2);
    for row in result["rows"].as_array().unwrap() {
        assert_eq!(row["VO"], "lhcb");
    }

    // An unknown parameter is an invalid query
    let response = client
        .post("/api/jobs/search")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(json!({"parameters": ["Nope"]}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);

    let response = client.get(format!("/api/jobs/{job_id}")).header(bearer(&access_token)).dispatch();
    assert_eq!(response.status(), Status::Ok);
    let job: Value = response.into_json().unwrap();
    assert_eq!(job["JobName"], "hello");

    //
    // Scenario D: sandbox upload and download
    //
    let content: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
    let checksum = crypto::sha256_hex(&content);
    let sandbox_info = json!({
        "checksum_algorithm": "sha256",
        "checksum": checksum,
        "size": 512,
        "format": "tar.bz2",
    });

    let response = client
        .post("/api/jobs/sandbox")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(sandbox_info.to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let upload: Value = response.into_json().unwrap();
    let pfn = upload["pfn"].as_str().unwrap().to_string();
    assert_eq!(pfn, format!("/S3/sandboxes/lhcb/lhcb_user/chaen/sha256:{checksum}.tar.bz2"));
    assert!(upload["url"].is_string());
    assert!(upload["fields"]["x-amz-signature"].is_string());
    assert_eq!(upload["fields"]["x-amz-checksum-algorithm"], "sha256");

    // Idempotent re-initiation: the content is already known
    let response = client
        .post("/api/jobs/sandbox")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(sandbox_info.to_string())
        .dispatch();
    let upload: Value = response.into_json().unwrap();
    assert_eq!(upload["pfn"].as_str().unwrap(), pfn);
    assert!(upload["url"].is_null());

    // An oversized sandbox is refused outright
    let response = client
        .post("/api/jobs/sandbox")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(
            json!({"checksum_algorithm": "sha256", "checksum": checksum, "size": 1_u64 << 40, "format": "tar.bz2"})
                .to_string(),
        )
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
    let body: Value = response.into_json().unwrap();
    assert_eq!(body["detail"], "Sandbox too large");

    // Download of our own sandbox
    let encoded_pfn: String = percent_encode(&pfn);
    let response =
        client.get(format!("/api/jobs/sandbox?pfn={encoded_pfn}")).header(bearer(&access_token)).dispatch();
    assert_eq!(response.status(), Status::Ok);
    let download: Value = response.into_json().unwrap();
    assert!(download["url"].as_str().unwrap().contains("X-Amz-Signature"));
    assert_eq!(download["expires_in"], 300);

    // Another principal of the same group must not touch it
    let other_tokens = server.legacy_exchange("other", "lhcb_user");
    let other_access = other_tokens["access_token"].as_str().unwrap();
    let response =
        client.get(format!("/api/jobs/sandbox?pfn={encoded_pfn}")).header(bearer(other_access)).dispatch();
    assert_eq!(response.status(), Status::BadRequest);
    let body: Value = response.into_json().unwrap();
    assert_eq!(body["detail"], "Invalid PFN");

    // Assigning the sandbox to a job shelters it from cleanup
    let response = client
        .patch(format!("/api/jobs/{job_id}/sandbox?pfn={encoded_pfn}"))
        .header(bearer(&access_token))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    //
    // Pilots: registration is gated, login is one-shot secret based
    //
    let response = client
        .post("/api/pilots/management")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(json!({"vo": "lhcb", "pilot_job_references": ["https://ce.example/1"]}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Forbidden);

    let admin_tokens = server.legacy_exchange("chaen", "lhcb_admin");
    let admin_access = admin_tokens["access_token"].as_str().unwrap();

    let response = client
        .post("/api/pilots/management")
        .header(ContentType::JSON)
        .header(bearer(admin_access))
        .body(json!({"vo": "lhcb", "pilot_job_references": ["https://ce.example/1", "https://ce.example/2"]}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let registered: Value = response.into_json().unwrap();
    let pilots = registered["pilots"].as_array().unwrap();
    assert_eq!(pilots.len(), 2);
    let pilot_reference = pilots[0]["pilot_job_reference"].as_str().unwrap().to_string();
    let pilot_secret = pilots[0]["pilot_secret"].as_str().unwrap().to_string();
    assert_eq!(pilot_secret.len(), 64);

    // Duplicate registration of any reference in the batch is a conflict
    let response = client
        .post("/api/pilots/management")
        .header(ContentType::JSON)
        .header(bearer(admin_access))
        .body(json!({"vo": "lhcb", "pilot_job_references": ["https://ce.example/1"]}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Conflict);

    // Unknown reference and wrong secret fail identically
    let response = client
        .post("/api/auth/pilot-login")
        .header(ContentType::JSON)
        .body(json!({"pilot_job_reference": "https://nowhere.invalid/1", "pilot_secret": &pilot_secret}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
    let unknown_body: Value = response.into_json().unwrap();

    let response = client
        .post("/api/auth/pilot-login")
        .header(ContentType::JSON)
        .body(json!({"pilot_job_reference": &pilot_reference, "pilot_secret": "0".repeat(64)}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
    let mismatch_body: Value = response.into_json().unwrap();
    assert_eq!(unknown_body, mismatch_body);

    let response = client
        .post("/api/auth/pilot-login")
        .header(ContentType::JSON)
        .body(json!({"pilot_job_reference": &pilot_reference, "pilot_secret": &pilot_secret}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let pilot_tokens: Value = response.into_json().unwrap();
    let pilot_access = pilot_tokens["access_token"].as_str().unwrap().to_string();
    let pilot_refresh = pilot_tokens["refresh_token"].as_str().unwrap().to_string();

    let pilot_claims = gridgate::auth::decode_access_token(&pilot_access).unwrap();
    assert!(pilot_claims.pilot_stamp.is_some());
    assert!(pilot_claims.dirac_group.is_none());

    // Pilot tokens are locked out of user endpoints
    let response = client.get("/api/auth/userinfo").header(bearer(&pilot_access)).dispatch();
    assert_eq!(response.status(), Status::Forbidden);

    // Pilot refresh rotates like user refresh
    let response = client
        .post("/api/auth/pilot-refresh-token")
        .header(ContentType::Form)
        .body(format!("refresh_token={pilot_refresh}"))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let response = client
        .post("/api/auth/pilot-refresh-token")
        .header(ContentType::Form)
        .body(format!("refresh_token={pilot_refresh}"))
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);

    // Pilot search through the engine, tenant scoped
    let response = client
        .post("/api/pilots/management/search")
        .header(ContentType::JSON)
        .header(bearer(&access_token))
        .body(json!({"parameters": ["PilotJobReference", "VO"]}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let result: Value = response.into_json().unwrap();
    assert_eq!(result["total"], 2);

    // Single pilot lookup by stamp
    let pilot_stamp = pilots[0]["pilot_stamp"].as_str().unwrap().to_string();
    let response =
        client.get(format!("/api/pilots/management/{pilot_stamp}")).header(bearer(&access_token)).dispatch();
    assert_eq!(response.status(), Status::Ok);
    let pilot_row: Value = response.into_json().unwrap();
    assert_eq!(pilot_row["PilotJobReference"].as_str().unwrap(), pilot_reference);

    let response =
        client.get("/api/pilots/management/ffffffffffffffff").header(bearer(&access_token)).dispatch();
    assert_eq!(response.status(), Status::NotFound);

    //
    // Scenario B: refresh rotation with replay detection (kept for last: the
    // replay response revokes the whole lineage of this identity)
    //
    let (status, rotated) = server.post_token(&format!("grant_type=refresh_token&refresh_token={device_refresh_token}"));
    assert_eq!(status, Status::Ok);
    let successor = rotated["refresh_token"].as_str().unwrap().to_string();

    // Replay of the consumed token
    let (status, body) = server.post_token(&format!("grant_type=refresh_token&refresh_token={device_refresh_token}"));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "invalid_grant");

    // ...and the successor died with the lineage
    let (status, body) = server.post_token(&format!("grant_type=refresh_token&refresh_token={successor}"));
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["error"], "invalid_grant");

    // Revocation of an unknown token is a silent 200
    let response = client
        .post("/api/auth/revoke")
        .header(ContentType::Form)
        .body("token=not-even-a-jwt&token_type_hint=refresh_token")
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
}

/// The presigned POST policy is the authoritative gate on size and checksum:
/// the storage backend itself must reject content that does not match the
/// announced digest. This runs against the S3-compatible backend configured
/// through `S3_ENDPOINT` (MinIO in development) and skips cleanly when none
/// is listening.
#[test]
fn presigned_upload_is_enforced_by_the_storage_backend() {
    setup_env();

    let endpoint = gridgate::CONFIG.s3_endpoint();
    let http = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("http client");

    // Any HTTP answer, even a 403, means a backend is listening
    if http.get(endpoint.as_str()).send().is_err() {
        eprintln!("skipping: no S3-compatible backend at {endpoint}");
        return;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap();
    let bucket = gridgate::CONFIG.sandbox_bucket();
    runtime.block_on(gridgate::object_store::ensure_bucket(&bucket)).expect("sandbox bucket");

    let payload: Vec<u8> = (0..512u32).map(|i| (i.wrapping_mul(7) % 253) as u8).collect();
    let checksum = crypto::sha256_hex(&payload);
    let key = format!("integration/sha256:{checksum}.tar.bz2");

    let post = gridgate::object_store::presigned_upload_post(&bucket, &key, "sha256", &checksum, 512, 300)
        .expect("presigned post");

    // The announced content is accepted
    let response = http.post(post.url.as_str()).multipart(upload_form(&post, payload.clone())).send().unwrap();
    let status = response.status();
    assert!(status.is_success(), "upload refused: {status} {}", response.text().unwrap_or_default());

    // Same length, different bytes: only the checksum condition can fail
    let mut tampered = payload.clone();
    tampered[0] ^= 0xff;
    let response = http.post(post.url.as_str()).multipart(upload_form(&post, tampered)).send().unwrap();
    let status = response.status();
    let body = response.text().unwrap_or_default();
    assert!(status.is_client_error(), "tampered upload must be rejected, got {status}: {body}");

    // The stored object is still the announced content
    let url =
        runtime.block_on(gridgate::object_store::presigned_download_url(&bucket, &key, 300)).expect("download url");
    let downloaded = http.get(url).send().unwrap();
    assert!(downloaded.status().is_success());
    assert_eq!(downloaded.bytes().unwrap().as_ref(), payload.as_slice());
}

/// Builds the browser-equivalent multipart body: every presigned field
/// verbatim, the file part last as S3 requires.
fn upload_form(post: &gridgate::object_store::PresignedPost, file: Vec<u8>) -> reqwest::blocking::multipart::Form {
    let mut form = reqwest::blocking::multipart::Form::new();
    for (name, value) in &post.fields {
        form = form.text(name.clone(), value.clone());
    }
    form.part("file", reqwest::blocking::multipart::Part::bytes(file).file_name("sandbox.tar.bz2"))
}

fn percent_encode(value: &str) -> String {
    value
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            other => format!("%{other:02X}"),
        })
        .collect()
}
