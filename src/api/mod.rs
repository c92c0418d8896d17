//! Orchestrator REST API. Routes are grouped per resource and mounted
//! under /api/v1; error bodies are uniform `{error, message}` JSON with the
//! raw upstream detail sanitized out.

pub mod contexts;
pub mod discovery;
pub mod enrollment;
pub mod failover;
pub mod jobs;
pub mod network_mappings;
pub mod replications;
pub mod schedules;

use crate::workflows::WorkflowError;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, routes, Build, Rocket, Route};

pub trait RocketExt {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<Route>)>) -> Self;
}

impl RocketExt for Rocket<Build> {
    fn mount_routes(self, routes: Vec<(&'static str, Vec<Route>)>) -> Self {
        let mut rocket = self;
        for (path, routes) in routes {
            log::info!("Mounting routes at {}", path);
            rocket = rocket.mount(path, routes);
        }
        rocket
    }
}

/// Maps workflow failures to transport statuses. Upstream cloud/agent error
/// strings are already classified by the workflow layer; what reaches the
/// client is actionable, not a raw SDK message.
pub fn workflow_error_response(e: WorkflowError) -> (Status, Json<Value>) {
    let (status, code) = match &e {
        WorkflowError::Validation(_) => (Status::BadRequest, "validation"),
        WorkflowError::Conflict(_) => (Status::Conflict, "conflict"),
        WorkflowError::NotFound(_) => (Status::NotFound, "not-found"),
        WorkflowError::Upstream(_) => (Status::BadGateway, "upstream"),
        WorkflowError::Internal(_) => (Status::InternalServerError, "internal"),
    };

    (status, Json(json!({ "error": code, "message": e.to_string() })))
}

#[get("/health")]
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "orchestrator" }))
}

/// The full route table for the orchestrator process.
pub fn all_routes() -> Vec<(&'static str, Vec<Route>)> {
    vec![
        ("/", routes![health]),
        ("/api/v1/replications", replications::api_routes()),
        ("/api/v1/failover", failover::api_routes()),
        ("/api/v1/contexts", contexts::api_routes()),
        ("/api/v1/contexts", network_mappings::api_routes()),
        ("/api/v1/discovery", discovery::api_routes()),
        ("/api/v1/schedules", schedules::api_routes()),
        ("/api/v1/agents", enrollment::api_routes()),
        ("/api/v1/jobs", jobs::api_routes()),
    ]
}
