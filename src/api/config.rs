use std::io::Cursor;

use chrono::NaiveDateTime;
use rocket::http::{ContentType, Header, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::response::{self, Responder, Response};
use rocket::Route;

use crate::{
    access::{self, PolicyAction},
    api::ApiResult,
    auth::AuthorizedUser,
    registry::RegistrySnapshot,
    util,
};

pub fn routes() -> Vec<Route> {
    routes![get_config]
}

/// The conditional request headers we honour on the config endpoint.
pub struct CacheHeaders {
    if_none_match: Option<String>,
    if_modified_since: Option<NaiveDateTime>,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CacheHeaders {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = request.headers();
        Outcome::Success(CacheHeaders {
            if_none_match: headers.get_one("If-None-Match").map(|v| v.trim_matches('"').to_string()),
            // An unparseable date is treated as an absent header
            if_modified_since: headers.get_one("If-Modified-Since").and_then(util::parse_datetime_http),
        })
    }
}

pub struct ConfigResponse {
    body: Option<String>,
    etag: String,
    last_modified: String,
}

impl<'r> Responder<'r, 'static> for ConfigResponse {
    fn respond_to(self, _: &Request<'_>) -> response::Result<'static> {
        let mut builder = Response::build();
        builder
            .header(Header::new("ETag", self.etag))
            .header(Header::new("Last-Modified", self.last_modified));
        match self.body {
            Some(body) => {
                builder.status(Status::Ok).header(ContentType::JSON).sized_body(Some(body.len()), Cursor::new(body));
            }
            None => {
                builder.status(Status::NotModified);
            }
        }
        builder.ok()
    }
}

/// Serves the rendered configuration with revision metadata. The client's
/// copy counts as current when its ETag matches *or* its If-Modified-Since
/// is not older than the revision time: deliberately permissive, matching
/// what grid clients in the field already rely on.
#[get("/")]
async fn get_config(user: AuthorizedUser, cache: CacheHeaders, registry: RegistrySnapshot) -> ApiResult<ConfigResponse> {
    access::check_permissions(&user, &PolicyAction::ConfigRead)?;

    let snapshot = registry.0;
    let etag_matches = cache.if_none_match.as_deref() == Some(snapshot.revision.as_str());
    let not_modified = cache.if_modified_since.is_some_and(|since| since >= snapshot.modified);

    let body = if etag_matches || not_modified {
        None
    } else {
        Some(serde_json::to_string(&snapshot.document)?)
    };

    Ok(ConfigResponse {
        body,
        etag: snapshot.revision.clone(),
        last_modified: util::format_datetime_http(&snapshot.modified),
    })
}
