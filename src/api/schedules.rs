use crate::db::queries::schedule as schedule_queries;
use crate::scheduler::cron::CronExpr;
use crate::scheduler::Scheduler;
use crate::workflows::Workflows;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, routes, Route, State};
use serde::Deserialize;
use sqlx::{MySql, Pool};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub cron_expression: String,
    #[serde(default = "default_replication_type")]
    pub replication_type: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: i32,
}

fn default_replication_type() -> String {
    "incremental".to_string()
}

fn default_max_concurrent() -> i32 {
    4
}

#[get("/")]
pub async fn list_schedules(
    pool: &State<Pool<MySql>>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match schedule_queries::list_schedules(pool).await {
        Ok(schedules) => Ok(Json(json!({ "schedules": schedules }))),
        Err(e) => Err(internal(e)),
    }
}

#[post("/", format = "json", data = "<request>")]
pub async fn create_schedule(
    pool: &State<Pool<MySql>>,
    request: Json<CreateScheduleRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    // A schedule with an unparseable expression would silently never fire
    if let Err(e) = CronExpr::parse(&request.cron_expression) {
        return Err((
            Status::BadRequest,
            Json(json!({ "error": "validation", "message": e.to_string() })),
        ));
    }
    if request.max_concurrent < 1 {
        return Err((
            Status::BadRequest,
            Json(json!({
                "error": "validation",
                "message": "max_concurrent must be at least 1"
            })),
        ));
    }

    match schedule_queries::create_schedule(
        pool,
        &request.name,
        &request.cron_expression,
        &request.replication_type,
        request.max_concurrent,
    )
    .await
    {
        Ok(schedule) => Ok(Json(json!(schedule))),
        Err(e) => Err(internal(e)),
    }
}

#[derive(Debug, Deserialize)]
pub struct MemberRequest {
    pub context_id: String,
}

#[post("/<schedule_id>/members", format = "json", data = "<request>")]
pub async fn add_member(
    pool: &State<Pool<MySql>>,
    schedule_id: i64,
    request: Json<MemberRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match schedule_queries::add_member(pool, schedule_id, &request.context_id).await {
        Ok(()) => Ok(Json(json!({ "added": request.context_id }))),
        Err(e) => Err(internal(e)),
    }
}

#[delete("/<schedule_id>/members/<context_id>")]
pub async fn remove_member(
    pool: &State<Pool<MySql>>,
    schedule_id: i64,
    context_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match schedule_queries::remove_member(pool, schedule_id, context_id).await {
        Ok(true) => Ok(Json(json!({ "removed": context_id }))),
        Ok(false) => Err((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("context {} is not a member", context_id)
            })),
        )),
        Err(e) => Err(internal(e)),
    }
}

/// Fires a schedule immediately through the same path the cron loop uses.
#[post("/<schedule_id>/trigger")]
pub async fn trigger_schedule(
    pool: &State<Pool<MySql>>,
    workflows: &State<Arc<Workflows>>,
    schedule_id: i64,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let schedule = match schedule_queries::get_schedule(pool, schedule_id).await {
        Ok(schedule) => schedule,
        Err(_) => {
            return Err((
                Status::NotFound,
                Json(json!({
                    "error": "not-found",
                    "message": format!("schedule {} does not exist", schedule_id)
                })),
            ));
        }
    };

    let scheduler = Scheduler::new(pool.inner().clone(), workflows.inner().clone());
    match scheduler.trigger(&schedule).await {
        Ok(()) => Ok(Json(json!({ "triggered": schedule.name }))),
        Err(e) => Err(internal(e)),
    }
}

#[delete("/<schedule_id>")]
pub async fn delete_schedule(
    pool: &State<Pool<MySql>>,
    schedule_id: i64,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match schedule_queries::delete_schedule(pool, schedule_id).await {
        Ok(true) => Ok(Json(json!({ "deleted": schedule_id }))),
        Ok(false) => Err((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("schedule {} does not exist", schedule_id)
            })),
        )),
        Err(e) => Err(internal(e)),
    }
}

fn internal(e: anyhow::Error) -> (Status, Json<Value>) {
    (
        Status::InternalServerError,
        Json(json!({ "error": "internal", "message": e.to_string() })),
    )
}

pub fn api_routes() -> Vec<Route> {
    routes![
        list_schedules,
        create_schedule,
        add_member,
        remove_member,
        trigger_schedule,
        delete_schedule,
    ]
}
