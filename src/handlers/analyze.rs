use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, State, multipart::MultipartRejection},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{GatewayError, Result, truncate_detail};
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::models::AnalyzeResponse;
use crate::pipeline::{self, InferenceResult};
use crate::state::ServerContext;

const IMAGE_FIELD: &str = "image";

// The uploaded file as received, before any decoding
struct Upload {
    file_name: String,
    bytes: Bytes,
}

// POST /analyze_medical_report
pub async fn analyze_handler(
    State(ctx): State<Arc<ServerContext>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<AnalyzeResponse>> {
    REQUEST_TOTAL.inc();
    let start = Instant::now();
    tracing::info!("received medical report analysis request");

    // anything that is not a multipart form has no image field
    let multipart = multipart.map_err(|e| {
        tracing::warn!("rejected non-multipart request: {}", e);
        GatewayError::MissingImage
    })?;
    let upload = read_image(multipart).await?;
    tracing::info!("processing image file {:?} ({} bytes)", upload.file_name, upload.bytes.len());

    let outcome = match tokio::time::timeout(ctx.request_timeout, process(&ctx, upload)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(GatewayError::RequestTimeout(ctx.request_timeout)),
    };

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(
                "request failed after {:.2}s: {}",
                start.elapsed().as_secs_f64(),
                truncate_detail(&e.to_string())
            );
            return Err(e);
        }
    };

    let total = start.elapsed();
    REQUEST_LATENCY.observe(total.as_secs_f64());
    tracing::info!(
        "request completed in {:.2}s (analysis: {:.2}s, recommendation: {:.2}s)",
        total.as_secs_f64(),
        result.analysis.elapsed.as_secs_f64(),
        result.recommendation.elapsed.as_secs_f64()
    );

    let cache_hit = result.fully_cached();
    Ok(Json(AnalyzeResponse {
        processing_time: total.as_secs_f64(),
        analysis_time: result.analysis.elapsed.as_secs_f64(),
        recommendation_time: result.recommendation.elapsed.as_secs_f64(),
        analysis_result: result.analysis.text,
        health_recommendations: result.recommendation.text,
        cache_hit,
    }))
}

async fn read_image(mut multipart: Multipart) -> Result<Upload> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::MalformedUpload(e.body_text()))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| GatewayError::MalformedUpload(e.body_text()))?;

        if file_name.is_empty() || bytes.is_empty() {
            return Err(GatewayError::MissingImage);
        }
        return Ok(Upload { file_name, bytes });
    }

    Err(GatewayError::MissingImage)
}

// Normalize on the blocking pool, then run both model stages
async fn process(ctx: &ServerContext, upload: Upload) -> Result<InferenceResult> {
    let normalizer = ctx.normalizer.clone();
    let normalized =
        tokio::task::spawn_blocking(move || normalizer.normalize(&upload.file_name, &upload.bytes))
            .await
            .map_err(|e| GatewayError::Internal(format!("image worker: {e}")))??;

    let base64_image = STANDARD.encode(&normalized.jpeg);
    tracing::info!("image encoded to base64: {} chars", base64_image.len());

    pipeline::run(ctx, &base64_image).await
}
