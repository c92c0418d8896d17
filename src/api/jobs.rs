use crate::db::queries::job as job_queries;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, routes, Route, State};
use sqlx::{MySql, Pool};

/// The full job tree: parent, ordered steps, and each step's log events.
/// This is the post-mortem surface; the UI's one-line summary lives on the
/// context row instead.
#[get("/<job_id>")]
pub async fn get_job_tree(
    pool: &State<Pool<MySql>>,
    job_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let job = match job_queries::get_job(pool, job_id).await {
        Ok(job) => job,
        Err(_) => {
            return Err((
                Status::NotFound,
                Json(json!({
                    "error": "not-found",
                    "message": format!("job {} does not exist", job_id)
                })),
            ));
        }
    };

    let steps = job_queries::steps_for_job(pool, job_id)
        .await
        .map_err(internal)?;

    let mut step_trees = Vec::with_capacity(steps.len());
    for step in steps {
        let logs = job_queries::logs_for_step(pool, step.id).await.map_err(internal)?;
        step_trees.push(json!({ "step": step, "logs": logs }));
    }

    Ok(Json(json!({ "job": job, "steps": step_trees })))
}

fn internal(e: anyhow::Error) -> (Status, Json<Value>) {
    (
        Status::InternalServerError,
        Json(json!({ "error": "internal", "message": e.to_string() })),
    )
}

pub fn api_routes() -> Vec<Route> {
    routes![get_job_tree]
}
