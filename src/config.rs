use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::upstream::backoff_delay;

const HOSTED_API_HOST: &str = "openrouter.ai";

// Slack on top of both stages' retry budgets for upload handling and image work
const REQUEST_MARGIN: Duration = Duration::from_secs(30);

// CLI argument structure; every option can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "medical-report-gateway")]
#[command(about = "Medical report analysis gateway: vision findings, then text recommendations")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Bearer token for the model APIs; mandatory for the hosted service
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(
        long,
        env = "OPENROUTER_API_BASE",
        default_value = "https://openrouter.ai/api/v1"
    )]
    pub api_base: String,

    // Overrides for self-hosted deployments
    #[arg(long, env = "VL_API_BASE")]
    pub vision_api_base: Option<String>,

    #[arg(long, env = "LLM_API_BASE")]
    pub text_api_base: Option<String>,

    #[arg(
        long,
        env = "API_A_MODEL",
        default_value = "qwen/qwen2.5-vl-32b-instruct:free"
    )]
    pub vision_model: String,

    #[arg(long, env = "API_B_MODEL", default_value = "qwen/qwen3-30b-a3b:free")]
    pub text_model: String,

    // Longest image edge sent upstream, in pixels
    #[arg(long, env = "MAX_IMAGE_SIZE", default_value_t = 1280)]
    pub max_image_size: u32,

    // Per-attempt upstream timeout in seconds
    #[arg(long, env = "API_TIMEOUT", default_value_t = 300)]
    pub api_timeout: u64,

    // Total upstream attempts per call
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub retry_backoff_ms: u64,

    // Largest accepted image file in bytes
    #[arg(long, env = "MAX_FILE_SIZE", default_value_t = 10 * 1024 * 1024)]
    pub max_file_size: usize,

    // Largest accepted request body in bytes
    #[arg(long, env = "MAX_CONTENT_LENGTH", default_value_t = 16 * 1024 * 1024)]
    pub max_upload_size: usize,

    #[arg(long, env = "ENABLE_CACHE", default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_cache: bool,

    // Cache TTL in seconds
    #[arg(long, env = "CACHE_TTL", default_value_t = 3600)]
    pub cache_ttl: u64,

    #[arg(long, env = "CACHE_CAPACITY", default_value_t = 1000)]
    pub cache_capacity: usize,

    // Hash only this many leading payload bytes into cache keys (unset: whole payload)
    #[arg(long, env = "CACHE_KEY_PREFIX")]
    pub cache_key_prefix: Option<usize>,

    #[arg(long, env = "JPEG_QUALITY_THRESHOLD", default_value_t = 800)]
    pub quality_threshold: u32,

    // Wall-clock budget per analysis request in seconds (unset: both stages' retry budgets)
    #[arg(long, env = "REQUEST_TIMEOUT")]
    pub request_timeout: Option<u64>,

    #[arg(long, env = "MAX_WORKERS", default_value_t = 4)]
    pub max_workers: usize,

    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    pub fn vision_base(&self) -> &str {
        self.vision_api_base.as_deref().unwrap_or(&self.api_base)
    }

    pub fn text_base(&self) -> &str {
        self.text_api_base.as_deref().unwrap_or(&self.api_base)
    }

    // Longest one stage can spend upstream: every attempt timing out, plus the sleeps between
    pub fn stage_budget(&self) -> Duration {
        let attempts = self.max_retries.max(1);
        let backoff_base = Duration::from_millis(self.retry_backoff_ms);
        let sleeps: Duration = (0..attempts - 1).map(|n| backoff_delay(backoff_base, n)).sum();
        Duration::from_secs(self.api_timeout).saturating_mul(attempts) + sleeps
    }

    // Explicit REQUEST_TIMEOUT, or room for both stages to use their whole retry budget
    pub fn request_budget(&self) -> Duration {
        match self.request_timeout {
            Some(secs) => Duration::from_secs(secs),
            None => self.stage_budget().saturating_mul(2) + REQUEST_MARGIN,
        }
    }

    // Startup checks; any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        let needs_key = [self.vision_base(), self.text_base()]
            .iter()
            .any(|base| base.contains(HOSTED_API_HOST));
        let has_key = self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty());
        if needs_key && !has_key {
            return Err(GatewayError::Configuration(
                "OPENROUTER_API_KEY must be set when using the hosted model API".to_string(),
            ));
        }

        let positive = [
            ("MAX_RETRIES", self.max_retries as usize),
            ("MAX_IMAGE_SIZE", self.max_image_size as usize),
            ("CACHE_CAPACITY", self.cache_capacity),
            ("MAX_WORKERS", self.max_workers),
            ("MAX_FILE_SIZE", self.max_file_size),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(GatewayError::Configuration(format!(
                "{name} must be greater than zero"
            )));
        }

        let stages = self.stage_budget().saturating_mul(2);
        if self.request_budget() < stages {
            tracing::warn!(
                "REQUEST_TIMEOUT of {:?} is shorter than the {:?} both stages may need to retry",
                self.request_budget(),
                stages
            );
        }

        Ok(())
    }
}
