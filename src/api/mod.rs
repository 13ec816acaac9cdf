pub mod auth;
mod config;
mod health;
mod jobs;
mod pilots;
mod wellknown;

pub use auth::routes as auth_routes;
pub use config::routes as config_routes;
pub use health::routes as health_routes;
pub use jobs::clean_sandboxes;
pub use jobs::routes as jobs_routes;
pub use pilots::routes as pilots_routes;
pub use wellknown::routes as wellknown_routes;

use rocket::serde::json::Json;
use rocket::Catcher;
use serde_json::Value;

// Type aliases for API methods results
pub type ApiResult<T> = Result<T, crate::error::Error>;
pub type JsonResult = ApiResult<Json<Value>>;
pub type EmptyResult = ApiResult<()>;

pub fn catchers() -> Vec<Catcher> {
    catchers![
        bad_request,
        unauthorized,
        forbidden,
        not_found,
        conflict,
        unprocessable,
        upgrade_required,
        too_many_requests,
        internal_error,
        service_unavailable,
    ]
}

fn detail(message: &str) -> Json<Value> {
    Json(serde_json::json!({"detail": message}))
}

#[catch(400)]
fn bad_request() -> Json<Value> {
    detail("Bad request")
}

#[catch(401)]
fn unauthorized() -> Json<Value> {
    detail("Not authenticated")
}

#[catch(403)]
fn forbidden() -> Json<Value> {
    detail("Forbidden")
}

#[catch(404)]
fn not_found() -> Json<Value> {
    detail("Not found")
}

#[catch(409)]
fn conflict() -> Json<Value> {
    detail("Conflict")
}

#[catch(422)]
fn unprocessable() -> Json<Value> {
    detail("Malformed request body")
}

#[catch(426)]
fn upgrade_required() -> Json<Value> {
    detail("Client version below the supported minimum")
}

#[catch(429)]
fn too_many_requests() -> Json<Value> {
    detail("Too many requests")
}

#[catch(500)]
fn internal_error() -> Json<Value> {
    detail("Internal server error")
}

#[catch(503)]
fn service_unavailable() -> Json<Value> {
    detail("Service unavailable")
}
