//! Item handlers.
//!
//! Each handler takes the request's [`Deadline`] and routes its repository
//! call through [`Deadline::run`]; a call still pending when the deadline
//! fires is dropped instead of running on unobserved.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use super::AppState;
use crate::service::{CatalogError, Deadline, Item, NewItem};

/// `GET /items`
pub async fn list_items(
    State(state): State<AppState>,
    deadline: Deadline,
) -> Result<Json<Vec<Item>>, CatalogError> {
    let items = deadline.run(state.catalog.list()).await??;
    Ok(Json(items))
}

/// `GET /items/{id}`
pub async fn get_item(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(id): Path<String>,
) -> Result<Json<Item>, CatalogError> {
    let item = deadline.run(state.catalog.get(&id)).await??;
    Ok(Json(item))
}

/// `POST /items` -- the authenticated subject becomes the owner.
pub async fn create_item(
    State(state): State<AppState>,
    deadline: Deadline,
    Json(new_item): Json<NewItem>,
) -> Result<impl IntoResponse, CatalogError> {
    let owner = deadline.context().subject_id();
    let item = deadline.run(state.catalog.create(owner, new_item)).await??;
    Ok((StatusCode::CREATED, Json(item)))
}

/// `DELETE /items/{id}`
pub async fn delete_item(
    State(state): State<AppState>,
    deadline: Deadline,
    Path(id): Path<String>,
) -> Result<StatusCode, CatalogError> {
    deadline.run(state.catalog.delete(&id)).await??;
    Ok(StatusCode::NO_CONTENT)
}
