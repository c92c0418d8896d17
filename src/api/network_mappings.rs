use crate::db::queries::network_mapping as mapping_queries;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, routes, Route, State};
use serde::Deserialize;
use sqlx::{MySql, Pool};

#[derive(Debug, Deserialize)]
pub struct UpsertMappingRequest {
    pub source_network_name: String,
    pub destination_network_id: Option<String>,
    pub test_network_id: Option<String>,
}

#[get("/<context_id>/networks")]
pub async fn list_mappings(
    pool: &State<Pool<MySql>>,
    context_id: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match mapping_queries::list_for_context(pool, context_id).await {
        Ok(mappings) => Ok(Json(json!({ "mappings": mappings }))),
        Err(e) => Err(internal(e)),
    }
}

/// Creates or updates the mapping for one source network; at most one row
/// per (context, source network) exists.
#[post("/<context_id>/networks", format = "json", data = "<request>")]
pub async fn upsert_mapping(
    pool: &State<Pool<MySql>>,
    context_id: &str,
    request: Json<UpsertMappingRequest>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    if request.destination_network_id.is_none() && request.test_network_id.is_none() {
        return Err((
            Status::BadRequest,
            Json(json!({
                "error": "validation",
                "message": "at least one of destination_network_id or test_network_id is required"
            })),
        ));
    }

    match mapping_queries::upsert_mapping(
        pool,
        context_id,
        &request.source_network_name,
        request.destination_network_id.as_deref(),
        request.test_network_id.as_deref(),
    )
    .await
    {
        Ok(mapping) => Ok(Json(json!(mapping))),
        Err(e) => Err(internal(e)),
    }
}

#[delete("/<context_id>/networks/<source_network_name>")]
pub async fn delete_mapping(
    pool: &State<Pool<MySql>>,
    context_id: &str,
    source_network_name: &str,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    match mapping_queries::delete_mapping(pool, context_id, source_network_name).await {
        Ok(true) => Ok(Json(json!({ "deleted": source_network_name }))),
        Ok(false) => Err((
            Status::NotFound,
            Json(json!({
                "error": "not-found",
                "message": format!("no mapping for {} on {}", source_network_name, context_id)
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
    routes![list_mappings, upsert_mapping, delete_mapping]
}
