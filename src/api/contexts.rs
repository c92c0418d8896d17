use crate::db::queries::{disk as disk_queries, vm_context as context_queries};
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, routes, Route, State};
use sqlx::{MySql, Pool};

#[get("/")]
pub async fn list_contexts(
    pool: &State<Pool<MySql>>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match context_queries::list_all(pool).await {
        Ok(contexts) => Ok(Json(json!({ "contexts": contexts }))),
        Err(e) => Err((
            Status::InternalServerError,
            Json(json!({ "error": "internal", "message": e.to_string() })),
        )),
    }
}

/// Context detail with its disk list and the last operation summary the UI
/// renders for post-mortems.
#[get("/<context_id>")]
pub async fn get_context(
    pool: &State<Pool<MySql>>,
    context_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let context = match context_queries::get_by_id(pool, context_id).await {
        Ok(context) => context,
        Err(_) => {
            return Err((
                Status::NotFound,
                Json(json!({
                    "error": "not-found",
                    "message": format!("context {} does not exist", context_id)
                })),
            ));
        }
    };

    let disks = disk_queries::list_disks_for_context(pool, context_id)
        .await
        .unwrap_or_default();

    Ok(Json(json!({ "context": context, "disks": disks })))
}

/// Explicit removal; cascades through disks, jobs, volumes, and mappings.
#[delete("/<context_id>")]
pub async fn delete_context(
    pool: &State<Pool<MySql>>,
    context_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match context_queries::delete_vm_context(pool, context_id).await {
        Ok(()) => Ok(Json(json!({ "deleted": context_id }))),
        Err(e) => Err((
            Status::InternalServerError,
            Json(json!({ "error": "internal", "message": e.to_string() })),
        )),
    }
}

pub fn api_routes() -> Vec<Route> {
    routes![list_contexts, get_context, delete_context]
}
