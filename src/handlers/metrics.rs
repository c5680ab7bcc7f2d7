use axum::http::header;
use axum::response::IntoResponse;

use crate::error::Result;

pub async fn metrics_handler() -> Result<impl IntoResponse> {
    let body = crate::metrics::render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
