// Two-stage inference: the vision model lists abnormal findings from the report image,
// then the text model turns those findings into health recommendations.
//
// Each stage checks the response cache first and only calls upstream on a miss. The cache
// lock is held for the lookup and the store, never across the network call.

use std::time::{Duration, Instant};

use crate::cache::{Fingerprint, OperationKind};
use crate::error::{GatewayError, Result};
use crate::models::{ChatMessage, ChatRequest, ChatResponse, ContentPart, ImageUrl, MessageContent};
use crate::state::ServerContext;
use crate::upstream::ModelEndpoint;

pub const ANALYSIS_PROMPT: &str = "Carefully analyze this medical laboratory report image. \
Identify and list every abnormal indicator with its measured value and reference range. \
If no abnormal indicators are present, state explicitly: \"No abnormal indicators found\" \
(未发现异常指标). Answer concisely using professional medical terminology, \
in the language of the report.";

pub fn recommendation_prompt(analysis: &str) -> String {
    format!(
        "Based on the following analysis of a medical laboratory report, provide practical \
health recommendations and precautions:\n\n{analysis}\n\n\
Give concise, actionable guidance covering diet, exercise and lifestyle, \
in the same language as the analysis."
    )
}

// Output of one stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub text: String,
    pub elapsed: Duration,
    pub cached: bool,
}

#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub analysis: StageOutput,
    pub recommendation: StageOutput,
}

impl InferenceResult {
    pub fn fully_cached(&self) -> bool {
        self.analysis.cached && self.recommendation.cached
    }
}

// Runs both stages in order. A failure in either stage aborts the whole run.
pub async fn run(ctx: &ServerContext, base64_image: &str) -> Result<InferenceResult> {
    let analysis = analyze(ctx, base64_image).await?;
    tracing::info!(
        "analysis stage done: {} chars in {:.2}s (cached: {})",
        analysis.text.chars().count(),
        analysis.elapsed.as_secs_f64(),
        analysis.cached
    );

    let recommendation = recommend(ctx, &analysis.text).await?;
    tracing::info!(
        "recommendation stage done: {} chars in {:.2}s (cached: {})",
        recommendation.text.chars().count(),
        recommendation.elapsed.as_secs_f64(),
        recommendation.cached
    );

    Ok(InferenceResult {
        analysis,
        recommendation,
    })
}

pub async fn analyze(ctx: &ServerContext, base64_image: &str) -> Result<StageOutput> {
    let key = Fingerprint::new(base64_image, OperationKind::Analysis, ctx.cache_key_prefix);
    cached_completion(ctx, &ctx.vision, key, || ChatRequest {
        model: ctx.vision.model.clone(),
        messages: vec![ChatMessage::user(MessageContent::Parts(vec![
            ContentPart::Text {
                text: ANALYSIS_PROMPT.to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/jpeg;base64,{base64_image}"),
                },
            },
        ]))],
    })
    .await
}

pub async fn recommend(ctx: &ServerContext, analysis: &str) -> Result<StageOutput> {
    let key = Fingerprint::new(analysis, OperationKind::Recommendation, ctx.cache_key_prefix);
    cached_completion(ctx, &ctx.text, key, || ChatRequest {
        model: ctx.text.model.clone(),
        messages: vec![ChatMessage::user(MessageContent::Text(recommendation_prompt(
            analysis,
        )))],
    })
    .await
}

async fn cached_completion<F>(
    ctx: &ServerContext,
    endpoint: &ModelEndpoint,
    key: Fingerprint,
    build_request: F,
) -> Result<StageOutput>
where
    F: FnOnce() -> ChatRequest,
{
    let start = Instant::now();

    if let Some(text) = ctx.cache.as_ref().and_then(|cache| cache.get(&key)) {
        tracing::info!("cache hit {} ({})", key, endpoint.model);
        return Ok(StageOutput {
            text,
            elapsed: start.elapsed(),
            cached: true,
        });
    }

    let request = build_request();
    let response: ChatResponse = match ctx.client.request(endpoint, &request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(
                "{} request failed after {:.2}s: {}",
                endpoint.model,
                start.elapsed().as_secs_f64(),
                e
            );
            return Err(e);
        }
    };

    let text = response.into_content().ok_or_else(|| {
        GatewayError::MalformedResponse(format!("{} returned no message content", endpoint.model))
    })?;

    if let Some(cache) = &ctx.cache {
        cache.set(key, text.clone());
    }

    Ok(StageOutput {
        text,
        elapsed: start.elapsed(),
        cached: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Args;
    use clap::Parser;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn completion(content: &str) -> String {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]}).to_string()
    }

    fn context(vision: &ServerGuard, text: &ServerGuard, extra: &[&str]) -> ServerContext {
        context_at(vision.url(), text.url(), extra)
    }

    fn context_at(vision_url: String, text_url: String, extra: &[&str]) -> ServerContext {
        let mut argv = vec![
            "medical-report-gateway".to_string(),
            "--api-key".into(),
            "sk-test".into(),
            "--vision-api-base".into(),
            vision_url,
            "--text-api-base".into(),
            text_url,
            "--vision-model".into(),
            "vision-model".into(),
            "--text-model".into(),
            "text-model".into(),
            "--retry-backoff-ms".into(),
            "1".into(),
        ];
        argv.extend(extra.iter().map(|s| s.to_string()));
        ServerContext::from_args(&Args::try_parse_from(argv).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn recommendation_prompt_carries_the_analysis() {
        let mut vision = Server::new_async().await;
        let mut text = Server::new_async().await;

        let vision_mock = vision
            .mock("POST", "/chat/completions")
            .match_body(Matcher::PartialJson(json!({"model": "vision-model"})))
            .with_status(200)
            .with_body(completion("abnormal glucose"))
            .expect(1)
            .create_async()
            .await;
        let text_mock = text
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex("abnormal glucose".into()))
            .with_status(200)
            .with_body(completion("eat less sugar"))
            .expect(1)
            .create_async()
            .await;

        let ctx = context(&vision, &text, &[]);
        let result = run(&ctx, "aGVsbG8=").await.unwrap();

        assert_eq!(result.analysis.text, "abnormal glucose");
        assert_eq!(result.recommendation.text, "eat less sugar");
        assert!(!result.fully_cached());
        vision_mock.assert_async().await;
        text_mock.assert_async().await;
    }

    #[tokio::test]
    async fn vision_request_embeds_the_image_as_data_uri() {
        let mut vision = Server::new_async().await;
        let text = Server::new_async().await;

        let mock = vision
            .mock("POST", "/chat/completions")
            .match_body(Matcher::Regex(r"data:image/jpeg;base64,QUJD".into()))
            .with_status(200)
            .with_body(completion("none"))
            .expect(1)
            .create_async()
            .await;

        let ctx = context(&vision, &text, &[]);
        let out = analyze(&ctx, "QUJD").await.unwrap();
        assert_eq!(out.text, "none");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn repeated_requests_are_served_from_cache() {
        let mut vision = Server::new_async().await;
        let mut text = Server::new_async().await;

        let vision_mock = vision
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(completion("high cholesterol"))
            .expect(1)
            .create_async()
            .await;
        let text_mock = text
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(completion("more exercise"))
            .expect(1)
            .create_async()
            .await;

        let ctx = context(&vision, &text, &[]);
        let first = run(&ctx, "SAME-IMAGE").await.unwrap();
        let second = run(&ctx, "SAME-IMAGE").await.unwrap();

        assert!(!first.fully_cached());
        assert!(second.fully_cached());
        assert_eq!(second.recommendation.text, "more exercise");
        vision_mock.assert_async().await;
        text_mock.assert_async().await;
    }

    #[tokio::test]
    async fn disabled_cache_always_calls_upstream() {
        let mut vision = Server::new_async().await;
        let text = Server::new_async().await;

        let mock = vision
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(completion("ok"))
            .expect(2)
            .create_async()
            .await;

        let ctx = context(&vision, &text, &["--enable-cache", "false"]);
        assert!(ctx.cache.is_none());
        analyze(&ctx, "IMG").await.unwrap();
        let again = analyze(&ctx, "IMG").await.unwrap();
        assert!(!again.cached);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn analysis_failure_skips_recommendation() {
        let mut vision = Server::new_async().await;
        let mut text = Server::new_async().await;

        let vision_mock = vision
            .mock("POST", "/chat/completions")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;
        let text_mock = text
            .mock("POST", "/chat/completions")
            .expect(0)
            .create_async()
            .await;

        let ctx = context(&vision, &text, &[]);
        let err = run(&ctx, "IMG").await.unwrap_err();

        assert!(matches!(err, GatewayError::Upstream { status: 400, .. }));
        // nothing was cached for the failed stage
        assert_eq!(ctx.cache.as_ref().map(|c| c.len()), Some(0));
        vision_mock.assert_async().await;
        text_mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_choices_is_a_malformed_response() {
        let mut vision = Server::new_async().await;
        let text = Server::new_async().await;

        vision
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let ctx = context(&vision, &text, &[]);
        let err = analyze(&ctx, "IMG").await.unwrap_err();
        assert!(matches!(err, GatewayError::MalformedResponse(_)));
    }

    // Accepts connections and never answers; returns the base URL and an accept counter
    async fn silent_upstream() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(socket);
            }
        });
        (format!("http://{addr}"), accepted)
    }

    #[tokio::test]
    async fn default_request_budget_lets_hung_attempts_exhaust_retries() {
        let (vision_url, accepted) = silent_upstream().await;
        let ctx = context_at(
            vision_url,
            "http://127.0.0.1:9".into(),
            &["--api-timeout", "1", "--max-retries", "3"],
        );

        let outcome = tokio::time::timeout(ctx.request_timeout, analyze(&ctx, "IMG")).await;

        let err = outcome.expect("request budget cut the retries short").unwrap_err();
        assert!(matches!(err, GatewayError::ExhaustedRetries { attempts: 3, .. }));
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }
}
