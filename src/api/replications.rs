use crate::api::workflow_error_response;
use crate::db::queries::{disk as disk_queries, replication as replication_queries, vm_context as context_queries};
use crate::models::replication::ReplicationType;
use crate::workflows::Workflows;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, routes, Route, State};
use serde::Deserialize;
use sqlx::{MySql, Pool};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreateReplicationRequest {
    pub context_id: String,
    pub replication_type: Option<ReplicationType>,
}

/// Start a replication for a managed context.
///
/// Replaying this against a context with a running job yields 409, not a
/// duplicate job.
#[post("/", format = "json", data = "<request>")]
pub async fn create_replication(
    workflows: &State<Arc<Workflows>>,
    request: Json<CreateReplicationRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match workflows
        .inner()
        .clone()
        .start_replication(&request.context_id, request.replication_type)
        .await
    {
        Ok(job) => Ok(Json(json!({ "job_id": job.id }))),
        Err(e) => Err(workflow_error_response(e)),
    }
}

#[get("/<job_id>")]
pub async fn get_replication(
    pool: &State<Pool<MySql>>,
    job_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match replication_queries::get_job(pool, job_id).await {
        Ok(job) => Ok(Json(json!(job))),
        Err(_) => Err((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("replication job {} does not exist", job_id)
            })),
        )),
    }
}

/// Cancel a running replication. 409 while the context's volumes are
/// attached to a destination VM.
#[delete("/<job_id>")]
pub async fn cancel_replication(
    workflows: &State<Arc<Workflows>>,
    job_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match workflows.cancel_replication(job_id).await {
        Ok(()) => Ok(Json(json!({ "cancelled": job_id }))),
        Err(e) => Err(workflow_error_response(e)),
    }
}

/// Last-known CBT cursor for a specific disk.
///
/// `disk_id` may be omitted only for single-disk contexts; with several
/// disks the answer would be an arbitrary cursor, so the request is
/// rejected instead.
#[get("/changeid?<vm_path>&<disk_id>")]
pub async fn get_change_id(
    pool: &State<Pool<MySql>>,
    vm_path: &str,
    disk_id: Option<&str>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let context = match find_context_by_path(pool, vm_path).await {
        Ok(context) => context,
        Err(response) => return Err(response),
    };

    let disks = disk_queries::list_disks_for_context(pool, &context.context_id)
        .await
        .map_err(internal_error)?;

    let disk = match disk_id {
        Some(disk_id) => disks.iter().find(|d| d.disk_key == disk_id).ok_or((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("disk {} not found on {}", disk_id, vm_path)
            })),
        ))?,
        None if disks.len() == 1 => &disks[0],
        None => {
            return Err((
                Status::BadRequest,
                Json(json!({
                    "error": "validation",
                    "message": format!(
                        "{} has {} disks; disk_id is required for multi-disk VMs",
                        vm_path,
                        disks.len()
                    )
                })),
            ));
        }
    };

    Ok(Json(json!({
        "vm_path": vm_path,
        "disk_id": disk.disk_key,
        "change_id": disk.change_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct StoreChangeIdRequest {
    pub vm_path: String,
    pub disk_id: String,
    pub change_id: String,
}

/// Agent-side callback storing a disk's CBT cursor after a completed copy.
/// Replaying the same (vm_path, disk_id, change_id) is a no-op.
#[post("/changeid", format = "json", data = "<request>")]
pub async fn store_change_id(
    pool: &State<Pool<MySql>>,
    request: Json<StoreChangeIdRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let context = match find_context_by_path(pool, &request.vm_path).await {
        Ok(context) => context,
        Err(response) => return Err(response),
    };

    let disk = disk_queries::get_disk(pool, &context.context_id, &request.disk_id)
        .await
        .map_err(internal_error)?
        .ok_or((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("disk {} not found on {}", request.disk_id, request.vm_path)
            })),
        ))?;

    if disk.change_id.as_deref() != Some(request.change_id.as_str()) {
        disk_queries::set_change_id(pool, &context.context_id, &request.disk_id, &request.change_id)
            .await
            .map_err(internal_error)?;
    }

    Ok(Json(json!({ "stored": request.disk_id })))
}

async fn find_context_by_path(
    pool: &Pool<MySql>,
    vm_path: &str,
) -> Result<crate::models::vm_context::VmContext, (Status, Json<Value>)> {
    let contexts = context_queries::list_all(pool).await.map_err(internal_error)?;

    contexts
        .into_iter()
        .find(|c| c.vmware_path == vm_path)
        .ok_or((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("no managed context for {}", vm_path)
            })),
        ))
}

fn internal_error(e: anyhow::Error) -> (Status, Json<Value>) {
    (
        Status::InternalServerError,
        Json(json!({ "error": "internal", "message": e.to_string() })),
    )
}

pub fn api_routes() -> Vec<Route> {
    routes![
        create_replication,
        get_replication,
        cancel_replication,
        get_change_id,
        store_change_id,
    ]
}
