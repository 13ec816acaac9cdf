use rocket::serde::json::Json;
use rocket::Route;
use serde::Deserialize;
use serde_json::Value;

use macros::IdFromParam;

use crate::{
    access::{self, PolicyAction},
    api::JsonResult,
    auth::{self, AuthorizedUser},
    db::{models::Pilot, DbConn},
    search::SearchParams,
};

pub fn routes() -> Vec<Route> {
    routes![register_pilots, get_pilot, search_pilots]
}

#[derive(Clone, IdFromParam)]
pub struct PilotStamp(String);

#[derive(Debug, Deserialize)]
struct RegisterPilotsRequest {
    vo: String,
    #[serde(default)]
    grid_type: Option<String>,
    pilot_job_references: Vec<String>,
}

/// Registers a batch of pilots and returns their secrets. Each plaintext
/// secret exists exactly once, in this response; only keyed hashes are
/// stored.
#[post("/management", data = "<data>")]
async fn register_pilots(data: Json<RegisterPilotsRequest>, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::PilotRegister)?;

    let data = data.into_inner();
    if data.vo != user.vo {
        err_code!("Cannot register pilots for another VO", 403)
    }
    if data.pilot_job_references.is_empty() {
        err!("No pilot references provided")
    }

    // Uniqueness of the whole batch before touching anything
    for reference in &data.pilot_job_references {
        if Pilot::find_by_reference(reference, &conn).await.is_some() {
            err_code!("Pilot already exists", reference.clone(), 409)
        }
    }

    let grid_type = data.grid_type.unwrap_or_else(|| "Grid".to_string());
    let hmac_key = auth::pilot_hmac_key();

    let mut registered = Vec::with_capacity(data.pilot_job_references.len());
    for reference in data.pilot_job_references {
        let mut pilot = Pilot::new(reference, data.vo.clone(), grid_type.clone());
        pilot.insert(&conn).await?;
        let secret = pilot.assign_credentials(&hmac_key, &conn).await?;
        registered.push(serde_json::json!({
            "pilot_job_reference": pilot.pilot_job_reference,
            "pilot_stamp": pilot.pilot_stamp,
            "pilot_secret": secret,
        }));
    }

    Ok(Json(serde_json::json!({"pilots": registered})))
}

/// Single pilot lookup by stamp, scoped to the caller's VO like the search.
#[get("/management/<stamp>")]
async fn get_pilot(stamp: PilotStamp, user: AuthorizedUser, conn: DbConn) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::PilotSearch)?;

    let Some(pilot) = Pilot::find_by_stamp(&stamp.0, &conn).await else {
        err_code!("Pilot not found", 404)
    };
    if pilot.vo != user.vo {
        err_code!("Pilot not found", 404)
    }

    Ok(Json(Value::Object(pilot.to_search_row())))
}

#[post("/management/search?<page>&<per_page>", data = "<data>")]
async fn search_pilots(
    data: Json<SearchParams>,
    page: Option<u64>,
    per_page: Option<u64>,
    user: AuthorizedUser,
    conn: DbConn,
) -> JsonResult {
    access::check_permissions(&user, &PolicyAction::PilotSearch)?;

    let (total, rows) =
        Pilot::search(&data.into_inner(), Some(&user.vo), page.unwrap_or(1), per_page.unwrap_or(100), &conn).await?;
    Ok(Json(serde_json::json!({"total": total, "rows": rows})))
}
