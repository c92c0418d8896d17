//! Loopback HTTP surface of the volume daemon. Unauthenticated by design:
//! the listener binds 127.0.0.1 and the orchestrator is the only caller.

use crate::jobtracker::CORRELATION_HEADER;
use crate::volume_daemon::error::VolumeDaemonError;
use crate::volume_daemon::service::VolumeService;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, routes, Route, State};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

/// Correlation id from the caller, or a fresh one when the caller is not
/// part of a tracked operation.
pub struct CorrelationId(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CorrelationId {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let id = request
            .headers()
            .get_one(CORRELATION_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| format!("corr-{}", Uuid::new_v4()));
        Outcome::Success(CorrelationId(id))
    }
}

fn error_response(e: VolumeDaemonError) -> (Status, Json<Value>) {
    let status = match &e {
        VolumeDaemonError::NotFound(_) => Status::NotFound,
        VolumeDaemonError::VolumeBusy(_)
        | VolumeDaemonError::StillAttached(_)
        | VolumeDaemonError::ContextBlocked(_) => Status::Conflict,
        VolumeDaemonError::InsufficientPrivilege(_) | VolumeDaemonError::NoActiveConfig => {
            Status::ServiceUnavailable
        }
        VolumeDaemonError::CloudApi(_) => Status::BadGateway,
        _ => Status::InternalServerError,
    };

    let code = if e.is_correlation_failure() {
        "correlation-failure"
    } else {
        "volume-operation-failed"
    };

    (status, Json(json!({ "error": code, "message": e.to_string() })))
}

#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    pub size_gb: i64,
    pub vm_disk_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    /// Target VM; omitted for orchestrator attach
    pub vm_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateExportRequest {
    pub volume_id: String,
    pub job_id: String,
    pub vm_disk_id: i64,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct RevertRequest {
    pub snapshot_id: String,
}

#[get("/health")]
pub async fn health(service: &State<Arc<VolumeService>>) -> Json<Value> {
    let report = service.health().await;
    Json(json!(report))
}

#[post("/volumes", format = "json", data = "<request>")]
pub async fn create_volume(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    request: Json<CreateVolumeRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    if request.size_gb <= 0 {
        return Err((
            Status::BadRequest,
            Json(json!({
                "error": "validation",
                "message": "size_gb must be a positive number of GiB"
            })),
        ));
    }

    match service
        .create_volume(request.size_gb, request.vm_disk_id, &correlation.0)
        .await
    {
        Ok(volume) => Ok(Json(json!({ "volume_id": volume.volume_id }))),
        Err(e) => Err(error_response(e)),
    }
}

#[post("/volumes/<volume_id>/attach", format = "json", data = "<request>")]
pub async fn attach_volume(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    volume_id: &str,
    request: Json<AttachRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match &request.vm_id {
        // Failover attach to a destination VM
        Some(vm_id) => match service.attach_to_vm(volume_id, vm_id, &correlation.0).await {
            Ok(()) => Ok(Json(json!({ "attached_to": vm_id }))),
            Err(e) => Err(error_response(e)),
        },
        // Orchestrator attach; the response carries the stable path only
        None => match service.attach_to_orchestrator(volume_id, &correlation.0).await {
            Ok(stable_path) => Ok(Json(json!({ "device_path": stable_path }))),
            Err(e) => Err(error_response(e)),
        },
    }
}

#[post("/volumes/<volume_id>/detach")]
pub async fn detach_volume(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    volume_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service.detach(volume_id, &correlation.0).await {
        Ok(()) => Ok(Json(json!({ "detached": volume_id }))),
        Err(e) => Err(error_response(e)),
    }
}

#[delete("/volumes/<volume_id>")]
pub async fn delete_volume(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    volume_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service.delete_volume(volume_id, &correlation.0).await {
        Ok(()) => Ok(Json(json!({ "deleted": volume_id }))),
        Err(e) => Err(error_response(e)),
    }
}

#[get("/volumes/<volume_id>")]
pub async fn get_volume(
    service: &State<Arc<VolumeService>>,
    volume_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service.get_volume(volume_id).await {
        Ok(volume) => Ok(Json(json!(volume))),
        Err(e) => Err(error_response(e)),
    }
}

#[post("/exports", format = "json", data = "<request>")]
pub async fn create_export(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    request: Json<CreateExportRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service
        .create_export(
            &request.volume_id,
            &request.job_id,
            request.vm_disk_id,
            request.read_only,
            &correlation.0,
        )
        .await
    {
        Ok(export) => Ok(Json(json!({
            "export_name": export.export_name,
            "url": service.export_url(&export.export_name),
        }))),
        Err(e) => Err(error_response(e)),
    }
}

#[delete("/exports/<export_name>")]
pub async fn delete_export(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    export_name: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service.delete_export(export_name, &correlation.0).await {
        Ok(()) => Ok(Json(json!({ "deleted": export_name }))),
        Err(e) => Err(error_response(e)),
    }
}

#[get("/exports")]
pub async fn list_exports(
    service: &State<Arc<VolumeService>>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service.list_exports().await {
        Ok(exports) => Ok(Json(json!({ "exports": exports }))),
        Err(e) => Err(error_response(e)),
    }
}

#[post("/volumes/<volume_id>/snapshot")]
pub async fn snapshot_volume(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    volume_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service.snapshot_volume(volume_id, &correlation.0).await {
        Ok(snapshot_id) => Ok(Json(json!({ "snapshot_id": snapshot_id }))),
        Err(e) => Err(error_response(e)),
    }
}

#[post("/volumes/<volume_id>/revert", format = "json", data = "<request>")]
pub async fn revert_volume(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    volume_id: &str,
    request: Json<RevertRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service
        .revert_snapshot(volume_id, &request.snapshot_id, &correlation.0)
        .await
    {
        Ok(()) => Ok(Json(json!({ "reverted": volume_id }))),
        Err(e) => Err(error_response(e)),
    }
}

#[delete("/snapshots/<snapshot_id>")]
pub async fn delete_snapshot(
    service: &State<Arc<VolumeService>>,
    correlation: CorrelationId,
    snapshot_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match service.delete_snapshot(snapshot_id, &correlation.0).await {
        Ok(()) => Ok(Json(json!({ "deleted": snapshot_id }))),
        Err(e) => Err(error_response(e)),
    }
}

pub fn api_routes() -> Vec<Route> {
    routes![
        health,
        create_volume,
        attach_volume,
        detach_volume,
        delete_volume,
        get_volume,
        create_export,
        delete_export,
        list_exports,
        snapshot_volume,
        revert_volume,
        delete_snapshot,
    ]
}
