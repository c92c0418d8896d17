use crate::config::APP_CONFIG;
use crate::db::queries::enrollment as enrollment_queries;
use crate::tunnel::enrollment as keys;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, routes, Route, State};
use serde::Deserialize;
use sqlx::{MySql, Pool};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub agent_name: String,
    pub public_key: String,
    /// Code displayed on the agent console; the operator compares it
    /// before approving
    pub pairing_code: String,
}

/// Bootstrap endpoint an unenrolled agent may call. The key is recorded as
/// pending; nothing is installed until an operator approves.
#[post("/enroll", format = "json", data = "<request>")]
pub async fn enroll(
    pool: &State<Pool<MySql>>,
    request: Json<EnrollRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    if !request.public_key.trim().starts_with("ssh-") {
        return Err((
            Status::BadRequest,
            Json(json!({
                "error": "validation",
                "message": "public_key does not look like an OpenSSH public key"
            })),
        ));
    }

    let id = format!("enr-{}", Uuid::new_v4());
    let fingerprint = keys::fingerprint(&request.public_key);

    match enrollment_queries::create_enrollment(
        pool,
        &id,
        &request.agent_name,
        request.public_key.trim(),
        &fingerprint,
        &request.pairing_code,
    )
    .await
    {
        Ok(enrollment) => Ok(Json(json!({
            "enrollment_id": enrollment.id,
            "fingerprint": enrollment.fingerprint,
            "state": enrollment.state,
        }))),
        Err(e) if e.to_string().contains("Duplicate") => Err((
            Status::Conflict,
            Json(json!({
                "error": "conflict",
                "message": "this key is already enrolled"
            })),
        )),
        Err(e) => Err(internal(e)),
    }
}

/// Agents poll here until the operator decides.
#[get("/enroll/<enrollment_id>")]
pub async fn enrollment_state(
    pool: &State<Pool<MySql>>,
    enrollment_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match enrollment_queries::get_enrollment(pool, enrollment_id).await {
        Ok(enrollment) => Ok(Json(json!({
            "enrollment_id": enrollment.id,
            "state": enrollment.state,
        }))),
        Err(_) => Err((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("enrollment {} does not exist", enrollment_id)
            })),
        )),
    }
}

#[get("/pending")]
pub async fn list_pending(pool: &State<Pool<MySql>>) -> Result<Json<Value>, (Status, Json<Value>)> {
    match enrollment_queries::list_pending(pool).await {
        Ok(enrollments) => Ok(Json(json!({ "pending": enrollments }))),
        Err(e) => Err(internal(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRequest {
    pub approved_by: String,
    #[serde(default)]
    pub reject: bool,
}

/// Operator decision. Approval installs the key under the restricted
/// tunnel user, constrained to the two control-channel forwards.
#[post("/<enrollment_id>/approve", format = "json", data = "<request>")]
pub async fn approve(
    pool: &State<Pool<MySql>>,
    enrollment_id: &str,
    request: Json<ApprovalRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let enrollment = match enrollment_queries::get_enrollment(pool, enrollment_id).await {
        Ok(enrollment) => enrollment,
        Err(_) => {
            return Err((
                Status::NotFound,
                Json(json!({
                    "error": "not-found",
                    "message": format!("enrollment {} does not exist", enrollment_id)
                })),
            ));
        }
    };

    if enrollment.state != "pending_approval" {
        return Err((
            Status::Conflict,
            Json(json!({
                "error": "conflict",
                "message": format!("enrollment is already {}", enrollment.state)
            })),
        ));
    }

    if request.reject {
        enrollment_queries::update_state(pool, enrollment_id, "rejected", Some(&request.approved_by))
            .await
            .map_err(internal)?;
        return Ok(Json(json!({ "state": "rejected" })));
    }

    let config = &APP_CONFIG.orchestrator;
    keys::install_authorized_key(
        &config.tunnel_authorized_keys,
        &enrollment.public_key,
        config.port,
        config.agent_forward_port,
    )
    .map_err(internal)?;

    enrollment_queries::update_state(pool, enrollment_id, "approved", Some(&request.approved_by))
        .await
        .map_err(internal)?;

    Ok(Json(json!({ "state": "approved" })))
}

fn internal(e: anyhow::Error) -> (Status, Json<Value>) {
    (
        Status::InternalServerError,
        Json(json!({ "error": "internal", "message": e.to_string() })),
    )
}

pub fn api_routes() -> Vec<Route> {
    routes![enroll, enrollment_state, list_pending, approve]
}
