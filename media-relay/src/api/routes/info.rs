//! `POST /api/info`: media info and format catalog for a URL.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::catalog::FormatCatalog;
use crate::selector::validate_url;

#[derive(Debug, Deserialize)]
pub struct InfoRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub duration: Option<f64>,
    /// Every classified format, in catalog order.
    pub formats: FormatCatalog,
    /// Sized formats, quality ordered and floored.
    pub catalog: FormatCatalog,
}

pub async fn media_info(
    State(state): State<AppState>,
    body: Result<Json<InfoRequest>, JsonRejection>,
) -> ApiResult<Json<InfoResponse>> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let url = validate_url(request.url.as_deref())?;

    let media = state.orchestrator.fetch_info(&url).await?;
    let formats = state.resolver.classify(&media.formats);
    let catalog = state.resolver.resolve(&media.formats);

    Ok(Json(InfoResponse {
        title: media.title,
        thumbnail: media.thumbnail,
        duration: media.duration,
        formats,
        catalog,
    }))
}
