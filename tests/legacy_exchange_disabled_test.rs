//
// With no hashed API key configured the legacy exchange endpoint is
// unavailable, whatever credentials are presented. Lives in its own test
// binary: the configuration is process wide.
//
use rocket::http::{Header, Status};
use rocket::local::blocking::Client;
use serde_json::Value;

const REGISTRY_DOC: &str = r#"
registry:
  lhcb:
    idp:
      url: "https://idp.invalid/realm"
      client_id: "lhcb-client"
    default_group: lhcb_user
    users:
      "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041":
        preferred_username: chaen
    groups:
      lhcb_user:
        properties: [NormalUser]
        users:
          - "b824d4dc-1f9d-4ee8-8df5-c0ae55d46041"
"#;

#[test]
fn legacy_exchange_disabled_returns_unavailable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path();
    std::fs::write(base.join("registry.yml"), REGISTRY_DOC).unwrap();

    std::env::set_var("DATA_FOLDER", base.to_str().unwrap());
    std::env::set_var("DATABASE_URL", base.join("gridgate.sqlite3").to_str().unwrap());
    std::env::set_var("CONFIG_SOURCE_URL", base.join("registry.yml").to_str().unwrap());
    std::env::set_var("TOKEN_SIGNING_KEY", base.join("token_signing_key.pem").to_str().unwrap());
    std::env::set_var("DOMAIN", "http://localhost:8000");
    std::env::remove_var("LEGACY_EXCHANGE_HASHED_API_KEY");

    let pool = gridgate::db::DbPool::from_config().expect("test database pool");
    let client = Client::tracked(gridgate::build_rocket(pool)).expect("valid rocket instance");

    // Well-formed credentials, properly encoded: still 503
    let bearer = format!("Bearer gridgate:legacy:{}", data_encoding::BASE64URL.encode(b"whatever"));
    let response = client
        .get("/api/auth/legacy-exchange?preferred_username=chaen&scope=vo%3Alhcb%20group%3Alhcb_user")
        .header(Header::new("Authorization", bearer))
        .dispatch();
    assert_eq!(response.status(), Status::ServiceUnavailable);
    let body: Value = response.into_json().unwrap();
    assert_eq!(body["detail"], "Legacy exchange is disabled");

    // A malformed header does not change the answer: availability is ranked
    // above the credential check
    let response = client
        .get("/api/auth/legacy-exchange?preferred_username=chaen&scope=vo%3Alhcb")
        .header(Header::new("Authorization", "Bearer nonsense"))
        .dispatch();
    assert_eq!(response.status(), Status::ServiceUnavailable);
}
