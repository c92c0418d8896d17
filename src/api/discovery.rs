use crate::clients::agent::DiscoverRequest;
use crate::db::queries::{credential as credential_queries, vm_context as context_queries};
use crate::models::vm_context::VmSpec;
use crate::workflows::Workflows;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{post, routes, Route, State};
use serde::Deserialize;
use sqlx::{MySql, Pool};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct DiscoveryRequest {
    /// Reference to a stored credential; inline credentials are not
    /// accepted on this surface.
    pub credential_id: Option<i64>,
    pub vm_path_filter: Option<String>,
    /// When set, discovered VMs are added to management immediately
    #[serde(default)]
    pub add_to_management: bool,
}

/// Proxies discovery to the agent and optionally registers the results as
/// managed contexts.
#[post("/discover-vms", format = "json", data = "<request>")]
pub async fn discover_vms(
    workflows: &State<Arc<Workflows>>,
    pool: &State<Pool<MySql>>,
    request: Json<DiscoveryRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let credential = match request.credential_id {
        Some(id) => credential_queries::get_by_id(pool, id).await.map_err(|_| {
            (
                Status::NotFound,
                Json(json!({
                    "error": "not-found",
                    "message": format!("credential {} does not exist", id)
                })),
            )
        })?,
        None => credential_queries::get_default(pool)
            .await
            .ok()
            .flatten()
            .ok_or((
                Status::BadRequest,
                Json(json!({
                    "error": "validation",
                    "message": "no credential reference given and no default credential stored"
                })),
            ))?,
    };

    let agent_request = DiscoverRequest {
        credential_id: Some(credential.id),
        vm_path_filter: request.vm_path_filter.clone(),
    };
    let correlation_id = format!("corr-{}", Uuid::new_v4());

    let vms: Vec<VmSpec> = match workflows.agent.discover_vms(&agent_request, &correlation_id).await
    {
        Ok(vms) => vms,
        Err(e) => {
            return Err((
                Status::BadGateway,
                Json(json!({ "error": "upstream", "message": e.to_string() })),
            ));
        }
    };

    let mut context_ids = Vec::new();
    if request.add_to_management {
        for vm in &vms {
            let context = context_queries::resolve_or_create(
                pool,
                vm,
                &credential.vcenter_host,
                None,
                Some(credential.id),
            )
            .await
            .map_err(|e| {
                (
                    Status::InternalServerError,
                    Json(json!({ "error": "internal", "message": e.to_string() })),
                )
            })?;
            context_ids.push(context.context_id);
        }
    }

    Ok(Json(json!({ "vms": vms, "context_ids": context_ids })))
}

pub fn api_routes() -> Vec<Route> {
    routes![discover_vms]
}
