use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{db::DbConn, registry::RegistrySnapshot};

pub fn routes() -> Vec<Route> {
    routes![health_live, health_startup, health_ready]
}

// The probes answer 503 through the guards while the configuration source
// has never produced a revision.

#[get("/live")]
fn health_live(_registry: RegistrySnapshot) -> Json<Value> {
    Json(json!({"status": "live"}))
}

#[get("/startup")]
fn health_startup(_registry: RegistrySnapshot) -> Json<Value> {
    Json(json!({"status": "startup complete"}))
}

// Readiness additionally verifies that a database connection can be acquired.
#[get("/ready")]
fn health_ready(_registry: RegistrySnapshot, _conn: DbConn) -> Json<Value> {
    Json(json!({"status": "ready"}))
}
