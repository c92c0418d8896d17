use crate::api::workflow_error_response;
use crate::models::failover::FailoverType;
use crate::workflows::Workflows;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{post, routes, Route, State};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct FailoverRequest {
    #[serde(rename = "type")]
    pub failover_type: FailoverType,
}

/// Start a test or live failover. Validation (template size, mappings,
/// competing jobs) runs synchronously; phases 2+ continue in the
/// background and are observable through the job tree.
#[post("/<context_id>", format = "json", data = "<request>")]
pub async fn start_failover(
    workflows: &State<Arc<Workflows>>,
    context_id: &str,
    request: Json<FailoverRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match workflows
        .inner()
        .clone()
        .start_failover(context_id, request.failover_type)
        .await
    {
        Ok(job) => Ok(Json(json!({ "job_id": job.id, "phase": job.phase }))),
        Err(e) => Err(workflow_error_response(e)),
    }
}

/// Roll back the most recent completed test failover.
#[post("/<context_id>/cleanup")]
pub async fn cleanup_failover(
    workflows: &State<Arc<Workflows>>,
    context_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match workflows.cleanup_test_failover(context_id).await {
        Ok(()) => Ok(Json(json!({ "cleaned_up": context_id }))),
        Err(e) => Err(workflow_error_response(e)),
    }
}

pub fn api_routes() -> Vec<Route> {
    routes![start_failover, cleanup_failover]
}
