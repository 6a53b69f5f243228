//! Tag registry endpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};

use super::routes::AppState;
use super::types::TagsQuery;
use crate::tags::{TagDimension, TagItem};

/// List known tags, most referenced first.
pub async fn list_tags(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TagsQuery>,
) -> Result<Json<Vec<TagItem>>, (StatusCode, String)> {
    let dimension = query
        .dimension
        .as_deref()
        .map(|d| d.parse::<TagDimension>())
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    Ok(Json(state.tags.list(dimension).await))
}
