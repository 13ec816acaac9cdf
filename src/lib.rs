#[macro_use]
extern crate log;
#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde_json;

#[macro_use]
pub mod error;
pub mod util;

pub mod config;

#[macro_use]
pub mod db;

pub mod access;
pub mod api;
pub mod auth;
pub mod crypto;
pub mod extensions;
pub mod http_client;
pub mod idp_client;
pub mod object_store;
pub mod ratelimit;
pub mod registry;
pub mod search;

pub use crate::config::CONFIG;
pub use crate::error::Error;

use rocket::{Build, Rocket};

pub const VERSION: &str = match option_env!("GG_VERSION") {
    Some(version) => version,
    None => env!("CARGO_PKG_VERSION"),
};

/// Assembles the full HTTP surface around an initialized database pool.
pub fn build_rocket(pool: db::DbPool) -> Rocket<Build> {
    let rocket = rocket::custom(rocket::Config::figment())
        .mount("/", api::wellknown_routes())
        .mount("/api/health", api::health_routes())
        .mount("/api/auth", api::auth_routes())
        .mount("/api/config", api::config_routes())
        .mount("/api/jobs", api::jobs_routes())
        .mount("/api/pilots", api::pilots_routes())
        .register("/", api::catchers())
        .manage(pool);

    // In development builds an unclassified route is a startup crash
    access::assert_route_policies(&rocket);

    rocket
}
