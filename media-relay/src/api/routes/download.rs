//! `POST /api/download`: stream a (transcoded) download as an attachment.

use axum::{
    Json,
    body::Body,
    extract::{State, rejection::JsonRejection},
    response::{IntoResponse, Response},
};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::error::Error;
use crate::selector::DownloadRequest;

/// Validate, start the pipeline and hand its output to the transport.
///
/// Everything up to and including the first chunk happens before the
/// response headers are sent, so startup and early process failures still
/// produce a JSON error. After that, failures truncate the body. With
/// `verify_format_ids` set, explicit ids are first checked against the
/// formats the source offers.
pub async fn download(
    State(state): State<AppState>,
    body: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let mut plan = state.selector.build(&request)?;

    let has_explicit_ids = !plan.selector.explicit_ids().is_empty();
    if has_explicit_ids && state.orchestrator.config().verify_format_ids {
        let media = state.orchestrator.fetch_info(&plan.url).await?;
        let formats = state.resolver.classify(&media.formats);
        let title = plan.title.take().or(media.title);
        plan = state.selector.build_checked(&request, &formats)?;
        plan.title = title;
    }

    let orchestrator = &state.orchestrator;
    let (filename, mut session) = tokio::try_join!(
        async { Ok::<_, Error>(orchestrator.resolve_filename(&plan).await) },
        orchestrator.start(&plan),
    )?;

    let metadata = session.delivery_metadata(&plan, &filename);
    session.relay_mut().prime().await?;
    let headers = metadata.headers()?;

    info!(
        session_id = %session.id(),
        filename = %metadata.filename,
        content_length = ?metadata.content_length,
        "Relaying download"
    );

    let body = Body::from_stream(session.into_relay().into_stream());
    Ok((headers, body).into_response())
}
