//! The agent's HTTP surface, reachable only through the control tunnel and
//! guarded by bearer tokens on every route but /health.

use crate::agent::auth::TokenAuthority;
use crate::agent::error::AgentServiceError;
use crate::agent::progress::PROGRESS;
use crate::agent::replication::ReplicationEngine;
use crate::agent::vsphere::VsphereAdapter;
use crate::clients::agent::{DiscoverRequest, ReplicationSpec};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, routes, Route, State};
use serde::Deserialize;
use std::sync::Arc;

/// Request guard proving a valid bearer token was presented.
pub struct Authenticated;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Authenticated {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let authority = match request.rocket().state::<Arc<TokenAuthority>>() {
            Some(authority) => authority,
            None => return Outcome::Error((Status::InternalServerError, ())),
        };

        let token = request
            .headers()
            .get_one("Authorization")
            .and_then(|header| header.strip_prefix("Bearer "));

        match token {
            Some(token) if authority.validate(token).is_ok() => Outcome::Success(Authenticated),
            _ => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

fn error_response(e: AgentServiceError) -> (Status, Json<Value>) {
    let status = match &e {
        AgentServiceError::JobNotFound(_) => Status::NotFound,
        AgentServiceError::JobAlreadyRunning(_) => Status::Conflict,
        AgentServiceError::Vsphere(_) => Status::BadGateway,
        _ => Status::InternalServerError,
    };

    (
        status,
        Json(json!({ "error": "agent-operation-failed", "message": e.to_string() })),
    )
}

#[get("/health")]
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[post("/api/v1/discover", format = "json", data = "<request>")]
pub async fn discover_vms(
    _auth: Authenticated,
    vsphere: &State<Arc<dyn VsphereAdapter>>,
    request: Json<DiscoverRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match vsphere.discover_vms(request.vm_path_filter.as_deref()).await {
        Ok(vms) => Ok(Json(json!({ "vms": vms }))),
        Err(e) => Err(error_response(AgentServiceError::Vsphere(e.to_string()))),
    }
}

#[derive(Debug, Deserialize)]
pub struct EnableCbtRequest {
    pub vm_path: String,
}

#[post("/api/v1/cbt/enable", format = "json", data = "<request>")]
pub async fn enable_cbt(
    _auth: Authenticated,
    vsphere: &State<Arc<dyn VsphereAdapter>>,
    request: Json<EnableCbtRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match vsphere.enable_cbt(&request.vm_path).await {
        Ok(()) => Ok(Json(json!({ "enabled": request.vm_path }))),
        Err(e) => Err(error_response(AgentServiceError::Vsphere(e.to_string()))),
    }
}

#[post("/api/v1/replications", format = "json", data = "<spec>")]
pub async fn start_replication(
    _auth: Authenticated,
    engine: &State<Arc<ReplicationEngine>>,
    spec: Json<ReplicationSpec>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    if spec.disks.is_empty() {
        return Err((
            Status::BadRequest,
            Json(json!({
                "error": "validation",
                "message": "replication spec carries no disks"
            })),
        ));
    }

    let job_id = spec.job_id.clone();
    match engine.inner().clone().start(spec.into_inner()) {
        Ok(()) => Ok(Json(json!({ "job_id": job_id }))),
        Err(e) => Err(error_response(e)),
    }
}

#[get("/api/v1/replications/<job_id>/progress")]
pub async fn progress(
    _auth: Authenticated,
    job_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match PROGRESS.snapshot(job_id) {
        Some(progress) => Ok(Json(json!(progress))),
        None => Err(error_response(AgentServiceError::JobNotFound(job_id.to_string()))),
    }
}

pub fn api_routes() -> Vec<Route> {
    routes![health, discover_vms, enable_cbt, start_replication, progress]
}
